use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::context::RequestContext;
use crate::protocol::Reply;

/// 拨号得到的上游连接
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// 本地绑定地址，用于填写 CONNECT 成功应答
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Connection for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, ctx: &RequestContext, network: &str, addr: &str) -> io::Result<Box<dyn Connection>>;
}

/// 直接建立 TCP 连接
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, ctx: &RequestContext, network: &str, addr: &str) -> io::Result<Box<dyn Connection>> {
        if !network.starts_with("tcp") {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("不支持的网络类型: {}", network),
            ));
        }
        tokio::select! {
            biased;
            err = ctx.ctx().done() => Err(err.into()),
            stream = TcpStream::connect(addr) => Ok(Box::new(stream?) as Box<dyn Connection>),
        }
    }
}

/// 把拨号错误映射为应答码，先看错误类型，再看错误信息
pub fn classify_dial_error(err: &io::Error) -> Reply {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => return Reply::ConnectionRefused,
        io::ErrorKind::NetworkUnreachable => return Reply::NetworkUnreachable,
        io::ErrorKind::HostUnreachable => return Reply::HostUnreachable,
        _ => {}
    }

    let msg = err.to_string();
    if msg.contains("refused") {
        Reply::ConnectionRefused
    } else if msg.contains("network is unreachable") {
        Reply::NetworkUnreachable
    } else {
        Reply::HostUnreachable
    }
}

#[cfg(test)]
mod tests {
    use bandwidth::Context;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_classify_by_kind() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(classify_dial_error(&refused), Reply::ConnectionRefused);

        let unreachable = io::Error::from(io::ErrorKind::NetworkUnreachable);
        assert_eq!(classify_dial_error(&unreachable), Reply::NetworkUnreachable);
    }

    #[test]
    fn test_classify_by_message() {
        let refused = io::Error::other("dial tcp 10.0.0.1:80: connection refused");
        assert_eq!(classify_dial_error(&refused), Reply::ConnectionRefused);

        let unreachable = io::Error::other("connect: network is unreachable");
        assert_eq!(classify_dial_error(&unreachable), Reply::NetworkUnreachable);

        let timeout = io::Error::other("i/o timeout");
        assert_eq!(classify_dial_error(&timeout), Reply::HostUnreachable);
    }

    #[tokio::test]
    async fn test_tcp_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let ctx = RequestContext::new(Context::background());

        let conn = TcpDialer.dial(&ctx, "tcp", &addr).await.unwrap();
        assert!(conn.local_addr().unwrap().ip().is_loopback());

        let err = TcpDialer.dial(&ctx, "udp", &addr).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
