use log::{debug, info};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::auth::AuthContext;
use crate::context::RequestContext;
use crate::dialer::classify_dial_error;
use crate::error::{Error, Result};
use crate::protocol::{AddrSpec, Command, Reply, SOCKS_VERSION, read_addr_spec, send_reply};
use crate::relay::{ClientConn, relay};
use crate::server::Server;

/// 客户端的一次代理请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub version: u8,
    pub command: Command,
    /// 方法协商得到的认证结果
    pub auth_context: Option<AuthContext>,
    /// 发起请求的客户端地址
    pub remote_addr: Option<AddrSpec>,
    /// 客户端请求的目标
    pub dest_addr: AddrSpec,
    /// 经过地址改写后的实际目标
    pub real_dest_addr: Option<AddrSpec>,
}

impl Request {
    pub fn new(command: Command, dest_addr: AddrSpec) -> Self {
        Self {
            version: SOCKS_VERSION,
            command,
            auth_context: None,
            remote_addr: None,
            dest_addr,
            real_dest_addr: None,
        }
    }

    /// 读取 VER | CMD | RSV 和目标地址
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 3];
        reader.read_exact(&mut header).await?;

        if header[0] != SOCKS_VERSION {
            return Err(Error::UnsupportedVersion(header[0]));
        }

        let dest_addr = read_addr_spec(reader).await?;
        Ok(Self::new(Command::from(header[1]), dest_addr))
    }

    /// 实际要连接的地址，没有改写时就是请求的目标
    pub fn effective_dest(&self) -> &AddrSpec {
        self.real_dest_addr.as_ref().unwrap_or(&self.dest_addr)
    }
}

impl Server {
    /// 认证完成后处理请求: 解析域名，改写地址，然后按命令分发
    pub async fn handle_request<C: ClientConn>(
        &self,
        mut ctx: RequestContext,
        conn: &mut C,
        req: &mut Request,
    ) -> Result<()> {
        if let (Some(resolver), Some(fqdn)) = (&self.config.resolver, req.dest_addr.fqdn.clone()) {
            let cancel = ctx.ctx().clone();
            match resolver.resolve(ctx, &fqdn).await {
                Ok((next, ip)) => {
                    debug!("解析 {} 得到 {}", fqdn, ip);
                    ctx = next;
                    req.dest_addr.ip = Some(ip);
                }
                Err(source) => {
                    cancel.err()?;
                    send_reply(conn, Reply::HostUnreachable, None).await?;
                    return Err(Error::Resolve { host: fqdn, source });
                }
            }
        }

        req.real_dest_addr = None;
        if let Some(rewriter) = &self.config.rewriter {
            let (next, addr) = rewriter.rewrite(ctx, req).await;
            ctx = next;
            req.real_dest_addr = Some(addr);
        }

        match req.command {
            Command::Connect => self.handle_connect(ctx, conn, req).await,
            Command::Bind => self.handle_bind(ctx, conn, req).await,
            Command::Associate => self.handle_associate(ctx, conn, req).await,
            Command::Other(code) => {
                send_reply(conn, Reply::CommandNotSupported, None).await?;
                Err(Error::UnsupportedCommand(code))
            }
        }
    }

    async fn allow<C: ClientConn>(
        &self,
        ctx: RequestContext,
        conn: &mut C,
        req: &Request,
    ) -> Result<RequestContext> {
        let (ctx, allowed) = self.config.rules.allow(ctx, req).await;
        if !allowed {
            send_reply(conn, Reply::RuleFailure, None).await?;
            return Err(Error::RuleRejected {
                command: req.command,
                addr: req.dest_addr.clone(),
            });
        }
        Ok(ctx)
    }

    async fn handle_connect<C: ClientConn>(
        &self,
        ctx: RequestContext,
        conn: &mut C,
        req: &Request,
    ) -> Result<()> {
        let ctx = self.allow(ctx, conn, req).await?;

        let addr = req.effective_dest().address();
        let target = match self.config.dialer.dial(&ctx, "tcp", &addr).await {
            Ok(target) => target,
            Err(source) => {
                ctx.err()?;
                send_reply(conn, classify_dial_error(&source), None).await?;
                return Err(Error::Dial {
                    addr: req.dest_addr.to_string(),
                    source,
                });
            }
        };

        let bound = target.local_addr().ok().map(AddrSpec::from);
        send_reply(conn, Reply::Succeeded, bound.as_ref()).await?;
        info!("已连接到目标: {}", req.dest_addr);

        let buffer_size = self.config.relay_buffer_size.min(conn.max_io_size()).max(1);
        let (up, down) = relay(ctx.ctx(), conn, target, buffer_size).await?;
        info!("{} 传输完成: 上行 {} 字节, 下行 {} 字节", req.dest_addr, up, down);
        Ok(())
    }

    async fn handle_bind<C: ClientConn>(
        &self,
        ctx: RequestContext,
        conn: &mut C,
        req: &Request,
    ) -> Result<()> {
        self.allow(ctx, conn, req).await?;
        send_reply(conn, Reply::CommandNotSupported, None).await
    }

    async fn handle_associate<C: ClientConn>(
        &self,
        ctx: RequestContext,
        conn: &mut C,
        req: &Request,
    ) -> Result<()> {
        let ctx = self.allow(ctx, conn, req).await?;

        let bind = AddrSpec::from(self.udp_bind_addr());
        send_reply(conn, Reply::Succeeded, Some(&bind)).await?;
        debug!("UDP 关联已建立: {}", bind);

        // 控制连接上不再有数据，读到 EOF 即关联结束
        let mut discard = [0u8; 1];
        loop {
            tokio::select! {
                err = ctx.ctx().done() => return Err(err.into()),
                n = conn.read(&mut discard) => {
                    if n? == 0 {
                        break;
                    }
                }
            }
        }
        debug!("UDP 关联结束: {}", bind);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bandwidth::Context;
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

    use super::*;
    use crate::dialer::{Connection, Dialer};
    use crate::ruleset::{AddressRewriter, PermitCommand};
    use crate::server::Config;

    struct FailingDialer {
        message: &'static str,
        calls: AtomicUsize,
    }

    impl FailingDialer {
        fn new(message: &'static str) -> Arc<Self> {
            Arc::new(Self {
                message,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Dialer for FailingDialer {
        async fn dial(&self, _ctx: &RequestContext, _network: &str, _addr: &str) -> io::Result<Box<dyn Connection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::other(self.message))
        }
    }

    struct FixedRewriter(AddrSpec);

    #[async_trait]
    impl AddressRewriter for FixedRewriter {
        async fn rewrite(&self, ctx: RequestContext, _req: &Request) -> (RequestContext, AddrSpec) {
            (ctx.with_value("rewritten", "yes"), self.0.clone())
        }
    }

    fn connect_request() -> Request {
        Request::new(Command::Connect, AddrSpec::ip("127.0.0.1".parse().unwrap(), 80))
    }

    async fn reply_code(client: &mut DuplexStream) -> u8 {
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], SOCKS_VERSION);
        reply[1]
    }

    async fn run(server: &Server, mut req: Request) -> (Result<()>, DuplexStream) {
        let (client, mut conn) = duplex(1024);
        let ctx = RequestContext::new(Context::background());
        let result = server.handle_request(ctx, &mut conn, &mut req).await;
        (result, client)
    }

    #[tokio::test]
    async fn test_read_connect_request() {
        let mut raw = Cursor::new(vec![0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50]);
        let req = Request::read_from(&mut raw).await.unwrap();
        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.dest_addr.ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(req.dest_addr.port, 80);
        assert_eq!(req.effective_dest(), &req.dest_addr);
    }

    #[tokio::test]
    async fn test_bad_version() {
        let mut raw = Cursor::new(vec![0x04, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50]);
        assert!(matches!(
            Request::read_from(&mut raw).await,
            Err(Error::UnsupportedVersion(4))
        ));
    }

    #[tokio::test]
    async fn test_connection_refused_reply() {
        let dialer = FailingDialer::new("dial tcp 127.0.0.1:80: connect: connection refused");
        let server = Server::new(Config {
            dialer: dialer.clone(),
            ..Config::default()
        });

        let (result, mut client) = run(&server, connect_request()).await;
        assert!(matches!(result, Err(Error::Dial { .. })));
        assert_eq!(reply_code(&mut client).await, Reply::ConnectionRefused as u8);
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_network_unreachable_reply() {
        let server = Server::new(Config {
            dialer: FailingDialer::new("connect: network is unreachable"),
            ..Config::default()
        });

        let (result, mut client) = run(&server, connect_request()).await;
        assert!(result.is_err());
        assert_eq!(reply_code(&mut client).await, Reply::NetworkUnreachable as u8);
    }

    #[tokio::test]
    async fn test_rule_denies_connect() {
        let dialer = FailingDialer::new("should not dial");
        let server = Server::new(Config {
            dialer: dialer.clone(),
            rules: Arc::new(PermitCommand::none()),
            ..Config::default()
        });

        let (result, mut client) = run(&server, connect_request()).await;
        assert!(result.unwrap_err().is_rule_rejection());
        assert_eq!(reply_code(&mut client).await, Reply::RuleFailure as u8);
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let server = Server::new(Config::default());
        let req = Request::new(Command::Other(0x09), AddrSpec::ip("127.0.0.1".parse().unwrap(), 80));

        let (result, mut client) = run(&server, req).await;
        assert!(matches!(result, Err(Error::UnsupportedCommand(0x09))));
        assert_eq!(reply_code(&mut client).await, Reply::CommandNotSupported as u8);
    }

    #[tokio::test]
    async fn test_bind_not_supported() {
        let server = Server::new(Config::default());
        let req = Request::new(Command::Bind, AddrSpec::ip("127.0.0.1".parse().unwrap(), 80));

        let (result, mut client) = run(&server, req).await;
        assert!(result.is_ok());
        assert_eq!(reply_code(&mut client).await, Reply::CommandNotSupported as u8);
    }

    #[tokio::test]
    async fn test_rewriter_changes_dial_target() {
        struct RecordingDialer(parking_lot::Mutex<Option<String>>);

        #[async_trait]
        impl Dialer for RecordingDialer {
            async fn dial(&self, ctx: &RequestContext, _network: &str, addr: &str) -> io::Result<Box<dyn Connection>> {
                assert_eq!(ctx.value("rewritten"), Some("yes"));
                *self.0.lock() = Some(addr.to_owned());
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            }
        }

        let dialer = Arc::new(RecordingDialer(parking_lot::Mutex::new(None)));
        let server = Server::new(Config {
            dialer: dialer.clone(),
            rewriter: Some(Arc::new(FixedRewriter(AddrSpec::ip("10.0.0.2".parse().unwrap(), 8080)))),
            ..Config::default()
        });

        let (result, mut client) = run(&server, connect_request()).await;
        assert!(result.is_err());
        assert_eq!(reply_code(&mut client).await, Reply::ConnectionRefused as u8);
        assert_eq!(dialer.0.lock().as_deref(), Some("10.0.0.2:8080"));
    }

    #[tokio::test]
    async fn test_associate_ends_on_eof() {
        let server = Server::new(Config::default());
        let req = Request::new(Command::Associate, AddrSpec::ip("0.0.0.0".parse().unwrap(), 0));
        let (mut client, mut conn) = duplex(1024);

        let handler = async {
            let ctx = RequestContext::new(Context::background());
            let mut req = req;
            server.handle_request(ctx, &mut conn, &mut req).await
        };
        let peer = async {
            let mut reply = [0u8; 10];
            client.read_exact(&mut reply).await.unwrap();
            client.shutdown().await.unwrap();
            reply
        };
        let (result, reply) = tokio::join!(handler, peer);

        result.unwrap();
        assert_eq!(reply[1], Reply::Succeeded as u8);
        assert_eq!(&reply[3..8], &[0x01, 127, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_canceled_context_skips_reply() {
        let root = Context::background();
        root.cancel();
        let server = Server::new(Config {
            dialer: FailingDialer::new("connection refused"),
            ..Config::default()
        });
        let (mut client, mut conn) = duplex(1024);
        let mut req = connect_request();

        let err = server
            .handle_request(RequestContext::new(root), &mut conn, &mut req)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());

        drop(conn);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
