use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use tokio::net::lookup_host;

use crate::context::RequestContext;

/// 把域名解析为 IP，可以在返回的上下文里附加信息
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, ctx: RequestContext, name: &str) -> io::Result<(RequestContext, IpAddr)>;
}

/// 使用系统解析器，取第一个结果
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl NameResolver for DnsResolver {
    async fn resolve(&self, ctx: RequestContext, name: &str) -> io::Result<(RequestContext, IpAddr)> {
        let lookup = lookup_host((name, 0));
        let mut addrs = tokio::select! {
            biased;
            err = ctx.ctx().done() => return Err(err.into()),
            addrs = lookup => addrs?,
        };
        match addrs.next() {
            Some(addr) => Ok((ctx, addr.ip())),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("无法解析域名: {}", name),
            )),
        }
    }
}
