use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use bandwidth::Context;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::protocol::parse_udp_header;
use crate::resolver::NameResolver;

pub const MAX_UDP_PACKET_SIZE: usize = 2 * 1024;

/// 固定大小的 UDP 缓冲区池
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl BufferPool {
    /// 池中最多保留 `capacity` 个空闲缓冲区
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        })
    }

    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let mut buf = self.buffers.lock().pop().unwrap_or_default();
        buf.resize(MAX_UDP_PACKET_SIZE, 0);
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }

    fn put(&self, buf: Vec<u8>) {
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.capacity {
            buffers.push(buf);
        }
    }
}

/// 从池中借出的缓冲区，释放时自动归还
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

/// UDP 中继。
///
/// 每个数据包独立处理，不和任何控制连接绑定，任何来源都可以通过它转发。
pub struct UdpRelay {
    socket: UdpSocket,
    resolver: Option<Arc<dyn NameResolver>>,
    pool: Arc<BufferPool>,
    permits: Arc<Semaphore>,
    response_timeout: Duration,
}

impl UdpRelay {
    pub fn new(
        socket: UdpSocket,
        resolver: Option<Arc<dyn NameResolver>>,
        response_timeout: Duration,
        max_tasks: usize,
    ) -> Arc<Self> {
        let max_tasks = max_tasks.max(1);
        Arc::new(Self {
            socket,
            resolver,
            pool: BufferPool::new(max_tasks * 2),
            permits: Arc::new(Semaphore::new(max_tasks)),
            response_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// 接收数据包，每个包在单独的任务中转发，并发数受信号量限制
    pub async fn run(self: Arc<Self>, ctx: Context) -> Result<()> {
        loop {
            let permit = tokio::select! {
                _ = ctx.done() => return Ok(()),
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Ok(()),
                },
            };

            let mut packet = self.pool.get();
            let (n, src) = tokio::select! {
                _ = ctx.done() => return Ok(()),
                received = self.socket.recv_from(&mut packet) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("udp socks: 接收 UDP 数据失败: {}", e);
                        continue;
                    }
                },
            };
            packet.truncate(n);

            let relay = Arc::clone(&self);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match relay.serve_packet(&ctx, &packet).await {
                    Ok(response) => {
                        if let Err(e) = relay.socket.send_to(&response, src).await {
                            warn!("udp socks: 回复 {} 失败: {}", src, e);
                        }
                    }
                    Err(e) if e.is_cancellation() => debug!("udp socks: {} 的数据包已取消: {}", src, e),
                    Err(e) => warn!("udp socks: 处理来自 {} 的数据包失败: {}", src, e),
                }
            });
        }
    }

    /// 转发一个数据包并等待一个响应，响应带着和请求相同的包头和地址前缀
    pub async fn serve_packet(&self, ctx: &Context, packet: &[u8]) -> Result<PooledBuffer> {
        let (mut spec, prefix_len) = parse_udp_header(packet)?;

        if let Some(fqdn) = &spec.fqdn {
            let resolver = self.resolver.as_ref().ok_or(Error::NoResolver)?;
            let (_, ip) = resolver
                .resolve(RequestContext::new(ctx.clone()), fqdn)
                .await
                .map_err(|source| Error::Resolve {
                    host: fqdn.clone(),
                    source,
                })?;
            spec.ip = Some(ip);
        }
        let target_addr = spec
            .socket_addr()
            .ok_or_else(|| Error::AddressFormat(spec.to_string()))?;

        let local: SocketAddr = if target_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let target = UdpSocket::bind(local).await?;
        target.connect(target_addr).await?;
        target.send(&packet[prefix_len..]).await?;

        let mut response = self.pool.get();
        response[..prefix_len].copy_from_slice(&packet[..prefix_len]);

        let ctx = ctx.child().with_timeout(self.response_timeout);
        let n = tokio::select! {
            err = ctx.done() => return Err(err.into()),
            received = target.recv(&mut response[prefix_len..]) => received?,
        };
        response.truncate(prefix_len + n);
        Ok(response)
    }
}
