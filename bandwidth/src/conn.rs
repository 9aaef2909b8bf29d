use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::context::Context;
use crate::error::Result;
use crate::tree::BandwidthLimiter;

type WaitFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// 一次读或写在执行前拿到的令牌
enum Permit {
    Idle,
    Waiting(WaitFuture),
    /// 令牌已经拿到，底层 IO 还没有完成
    Granted,
}

impl Permit {
    fn poll_acquire(
        &mut self,
        limiter: &BandwidthLimiter,
        ctx: &Context,
        n: usize,
        cx: &mut TaskContext<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            match self {
                Permit::Granted => return Poll::Ready(Ok(())),
                Permit::Idle => {
                    let limiter = limiter.clone();
                    let ctx = ctx.clone();
                    let n = i64::try_from(n).unwrap_or(i64::MAX);
                    *self = Permit::Waiting(Box::pin(async move { limiter.wait_n(&ctx, n).await }));
                }
                Permit::Waiting(wait) => {
                    let result = ready!(wait.as_mut().poll(cx));
                    *self = Permit::Idle;
                    result?;
                    *self = Permit::Granted;
                }
            }
        }
    }
}

/// 读写都经过限速的流。
///
/// 每次读取 `buf` 前先等待 `buf` 剩余容量个读令牌，每次写入前等待 `buf.len()` 个写令牌。
/// 单次读写不能超过限速链上的突发上限，否则返回错误，
/// 调用方应按 [`LimitedStream::max_io_size`] 控制缓冲区大小。
pub struct LimitedStream<S> {
    inner: S,
    read_limiter: BandwidthLimiter,
    write_limiter: BandwidthLimiter,
    ctx: Context,
    read_permit: Permit,
    write_permit: Permit,
}

impl<S> LimitedStream<S> {
    pub fn new(
        ctx: Context,
        read_limiter: BandwidthLimiter,
        write_limiter: BandwidthLimiter,
        inner: S,
    ) -> Self {
        Self {
            inner,
            read_limiter,
            write_limiter,
            ctx,
            read_permit: Permit::Idle,
            write_permit: Permit::Idle,
        }
    }

    /// 读写两个方向上允许的最大单次 IO 字节数
    pub fn max_io_size(&self) -> usize {
        let limit = self
            .read_limiter
            .max_io_size()
            .min(self.write_limiter.max_io_size());
        usize::try_from(limit).unwrap_or(usize::MAX)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for LimitedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        ready!(this.read_permit.poll_acquire(&this.read_limiter, &this.ctx, buf.remaining(), cx))?;
        let result = ready!(Pin::new(&mut this.inner).poll_read(cx, buf));
        this.read_permit = Permit::Idle;
        Poll::Ready(result)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for LimitedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        ready!(this.write_permit.poll_acquire(&this.write_limiter, &this.ctx, buf.len(), cx))?;
        let result = ready!(Pin::new(&mut this.inner).poll_write(cx, buf));
        this.write_permit = Permit::Idle;
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    /// 只关闭写方向，对端读到 EOF，读方向仍可用
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
