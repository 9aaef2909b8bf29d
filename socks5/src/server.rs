use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bandwidth::{Context, LimitedListener, ListenerConfig};
use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, ToSocketAddrs, UdpSocket};

use crate::auth::{Authenticator, CredentialStore, NoAuth, UserPassAuthenticator, negotiate};
use crate::context::RequestContext;
use crate::dialer::{Dialer, TcpDialer};
use crate::error::{Error, Result};
use crate::protocol::{AddrSpec, Reply, SOCKS_VERSION, send_reply};
use crate::relay::ClientConn;
use crate::request::Request;
use crate::resolver::{DnsResolver, NameResolver};
use crate::ruleset::{AddressRewriter, PermitAll, RuleSet};
use crate::udp::UdpRelay;

/// 服务端配置
pub struct Config {
    /// 支持的认证方式，为空时根据 `credentials` 自动选择
    pub auth_methods: Vec<Arc<dyn Authenticator>>,
    pub credentials: Option<Arc<dyn CredentialStore>>,
    pub resolver: Option<Arc<dyn NameResolver>>,
    pub rules: Arc<dyn RuleSet>,
    pub rewriter: Option<Arc<dyn AddressRewriter>>,
    pub dialer: Arc<dyn Dialer>,
    /// UDP 中继地址，未指定时在应答里填 127.0.0.1
    pub bind_ip: IpAddr,
    /// UDP 中继端口，0 表示随机
    pub bind_port: u16,
    pub bandwidth: ListenerConfig,
    /// UDP 转发等待响应的超时
    pub udp_response_timeout: Duration,
    /// 同时处理的 UDP 数据包上限
    pub max_udp_tasks: usize,
    /// 转发缓冲区大小，还会被限速器的突发上限截断
    pub relay_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_methods: Vec::new(),
            credentials: None,
            resolver: Some(Arc::new(DnsResolver)),
            rules: Arc::new(PermitAll),
            rewriter: None,
            dialer: Arc::new(TcpDialer),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 0,
            bandwidth: ListenerConfig::default(),
            udp_response_timeout: Duration::from_secs(60),
            max_udp_tasks: 1024,
            relay_buffer_size: 32 * 1024,
        }
    }
}

pub struct Server {
    pub(crate) config: Config,
    authenticators: Vec<Arc<dyn Authenticator>>,
    udp_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let authenticators = if !config.auth_methods.is_empty() {
            config.auth_methods.clone()
        } else if let Some(credentials) = &config.credentials {
            vec![Arc::new(UserPassAuthenticator::new(Arc::clone(credentials))) as Arc<dyn Authenticator>]
        } else {
            vec![Arc::new(NoAuth) as Arc<dyn Authenticator>]
        };

        Self {
            config,
            authenticators,
            udp_addr: Mutex::new(None),
        }
    }

    /// 绑定 TCP 监听，直到 `ctx` 取消
    pub async fn listen_and_serve<A: ToSocketAddrs>(self: Arc<Self>, ctx: Context, addr: A) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(ctx, listener).await
    }

    /// 启动 UDP 中继，然后接受连接并为每个连接启动一个任务，连接都经过带宽限速
    pub async fn serve(self: Arc<Self>, ctx: Context, listener: TcpListener) -> Result<()> {
        let relay_started = self.udp_addr.lock().is_some();
        if !relay_started {
            self.start_udp_relay(&ctx).await?;
        }

        let listener = LimitedListener::new(ctx.clone(), self.config.bandwidth.clone(), listener);
        info!("SOCKS5 代理服务器启动在 {}", listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = ctx.done() => {
                    info!("服务器停止");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((conn, addr)) => {
                    info!("新连接来自: {}", addr);
                    let server = Arc::clone(&self);
                    let ctx = ctx.child();
                    tokio::spawn(async move {
                        match server.serve_conn(ctx, conn, addr).await {
                            Ok(()) => debug!("连接 {} 已关闭", addr),
                            Err(e) if e.is_rule_rejection() => info!("{}: {}", addr, e),
                            Err(e) if e.is_cancellation() => debug!("{}: 连接已取消", addr),
                            Err(e) => error!("处理连接时出错: {}", e),
                        }
                    });
                }
                Err(e) => {
                    error!("接受连接时出错: {}", e);
                }
            }
        }
    }

    /// 处理一个已经接受的连接: 方法协商，读取请求，然后分发
    pub async fn serve_conn<C: ClientConn>(&self, ctx: Context, mut conn: C, peer: SocketAddr) -> Result<()> {
        let version = conn.read_u8().await?;
        if version != SOCKS_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let auth_context = negotiate(&mut conn, &self.authenticators).await?;

        let mut req = match Request::read_from(&mut conn).await {
            Ok(req) => req,
            Err(Error::UnrecognizedAddrType(address_type)) => {
                send_reply(&mut conn, Reply::AddrTypeNotSupported, None).await?;
                return Err(Error::UnrecognizedAddrType(address_type));
            }
            Err(e) => return Err(e),
        };
        req.auth_context = Some(auth_context);
        req.remote_addr = Some(AddrSpec::from(peer));

        self.handle_request(RequestContext::new(ctx), &mut conn, &mut req).await
    }

    async fn start_udp_relay(&self, ctx: &Context) -> Result<()> {
        let udp = UdpSocket::bind(SocketAddr::new(self.config.bind_ip, self.config.bind_port)).await?;
        let relay = UdpRelay::new(
            udp,
            self.config.resolver.clone(),
            self.config.udp_response_timeout,
            self.config.max_udp_tasks,
        );
        let udp_addr = relay.local_addr()?;
        *self.udp_addr.lock() = Some(udp_addr);
        info!("UDP 中继监听在 {}", udp_addr);

        let udp_ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.run(udp_ctx).await {
                error!("UDP 中继退出: {}", e);
            }
        });
        Ok(())
    }

    /// ASSOCIATE 应答里告诉客户端的 UDP 中继地址
    pub fn udp_bind_addr(&self) -> SocketAddr {
        let ip = if self.config.bind_ip.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.config.bind_ip
        };
        let udp_addr = *self.udp_addr.lock();
        let port = udp_addr.map_or(self.config.bind_port, |addr| addr.port());
        SocketAddr::new(ip, port)
    }
}
