use async_trait::async_trait;

use crate::context::RequestContext;
use crate::protocol::{AddrSpec, Command};
use crate::request::Request;

/// 决定一个请求是否被放行
#[async_trait]
pub trait RuleSet: Send + Sync {
    async fn allow(&self, ctx: RequestContext, req: &Request) -> (RequestContext, bool);
}

/// 透明地改写请求的实际目标地址
#[async_trait]
pub trait AddressRewriter: Send + Sync {
    async fn rewrite(&self, ctx: RequestContext, req: &Request) -> (RequestContext, AddrSpec);
}

/// 放行所有请求
#[derive(Debug, Clone, Copy, Default)]
pub struct PermitAll;

#[async_trait]
impl RuleSet for PermitAll {
    async fn allow(&self, ctx: RequestContext, _req: &Request) -> (RequestContext, bool) {
        (ctx, true)
    }
}

/// 按命令类型放行
#[derive(Debug, Clone, Copy, Default)]
pub struct PermitCommand {
    pub enable_connect: bool,
    pub enable_bind: bool,
    pub enable_associate: bool,
}

impl PermitCommand {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            enable_connect: true,
            enable_bind: true,
            enable_associate: true,
        }
    }
}

#[async_trait]
impl RuleSet for PermitCommand {
    async fn allow(&self, ctx: RequestContext, req: &Request) -> (RequestContext, bool) {
        let allowed = match req.command {
            Command::Connect => self.enable_connect,
            Command::Bind => self.enable_bind,
            Command::Associate => self.enable_associate,
            Command::Other(_) => false,
        };
        (ctx, allowed)
    }
}
