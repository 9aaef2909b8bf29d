use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::debug;
use tokio::net::{TcpListener, TcpStream};

use crate::conf::RateBudget;
use crate::conn::LimitedStream;
use crate::context::Context;
use crate::tree::{BandwidthLimiter, LimiterTree};

/// 监听器的四组限速配置
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// 服务端整体读限速
    pub read_server_rate: Arc<RateBudget>,
    /// 服务端整体写限速
    pub write_server_rate: Arc<RateBudget>,
    /// 单连接读限速
    pub read_conn_rate: Arc<RateBudget>,
    /// 单连接写限速
    pub write_conn_rate: Arc<RateBudget>,
}

impl ListenerConfig {
    /// 四组都使用同一份配置
    pub fn new(budget: Arc<RateBudget>) -> Self {
        Self {
            read_server_rate: budget.clone(),
            write_server_rate: budget.clone(),
            read_conn_rate: budget.clone(),
            write_conn_rate: budget,
        }
    }

    /// 服务端和单连接使用相同的读写速率，突发上限等于速率
    pub fn simple(read: i64, write: i64) -> Self {
        Self {
            read_server_rate: Arc::new(RateBudget::new(read, read)),
            write_server_rate: Arc::new(RateBudget::new(write, write)),
            read_conn_rate: Arc::new(RateBudget::new(read, read)),
            write_conn_rate: Arc::new(RateBudget::new(write, write)),
        }
    }

    pub fn unlimited() -> Self {
        Self::simple(0, 0)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// 对每个接入的连接同时施加单连接限速和服务端整体限速的监听器
pub struct LimitedListener {
    listener: TcpListener,
    server_read: BandwidthLimiter,
    server_write: BandwidthLimiter,
    config: ListenerConfig,
    ctx: Context,
}

impl LimitedListener {
    pub fn new(ctx: Context, config: ListenerConfig, listener: TcpListener) -> Self {
        let tree = LimiterTree::new();
        Self {
            listener,
            server_read: tree.root(config.read_server_rate.clone()),
            server_write: tree.root(config.write_server_rate.clone()),
            config,
            ctx,
        }
    }

    pub async fn accept(&self) -> io::Result<(LimitedStream<TcpStream>, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("为 {} 创建连接限速器", addr);
        Ok((self.wrap(stream), addr))
    }

    /// 给任意流挂上一对新的连接级限速器，父节点是服务端限速器
    pub fn wrap<S>(&self, stream: S) -> LimitedStream<S> {
        let read = self.server_read.child(self.config.read_conn_rate.clone());
        let write = self.server_write.child(self.config.write_conn_rate.clone());
        LimitedStream::new(self.ctx.child(), read, write, stream)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn tree(&self) -> &Arc<LimiterTree> {
        self.server_read.tree()
    }
}
