use std::io;

use bandwidth::{Context, LimitedStream};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;

use crate::error::Result;

/// 客户端一侧的连接
pub trait ClientConn: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// 单次读写允许的最大字节数
    fn max_io_size(&self) -> usize {
        usize::MAX
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> ClientConn for LimitedStream<S> {
    fn max_io_size(&self) -> usize {
        LimitedStream::max_io_size(self)
    }
}

impl ClientConn for TcpStream {}

impl ClientConn for DuplexStream {}

/// 在两个连接之间双向转发，返回 (客户端到上游, 上游到客户端) 的字节数。
///
/// 一个方向读到 EOF 后只关闭对端的写方向，两个方向都结束才返回。
/// 任一方向出错立即返回，另一个方向随之被丢弃。
pub async fn relay<A, B>(ctx: &Context, client: A, upstream: B, buffer_size: usize) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let up = copy_half(&mut client_read, &mut upstream_write, buffer_size);
    let down = copy_half(&mut upstream_read, &mut client_write, buffer_size);

    tokio::select! {
        err = ctx.done() => Err(err.into()),
        result = async { tokio::try_join!(up, down) } => Ok(result?),
    }
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, buffer_size: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    if let Err(e) = writer.shutdown().await {
        debug!("关闭写方向失败: {}", e);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bandwidth::{BandwidthLimiter, RateBudget};
    use tokio::io::duplex;

    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_upstream_close_half_closes_client() {
        let (client_far, client_near) = duplex(1024);
        let (upstream_near, upstream_far) = duplex(1024);
        let ctx = Context::background();

        let relay_task = tokio::spawn(async move { relay(&ctx, client_near, upstream_near, 64).await });

        let (mut client_read, mut client_write) = tokio::io::split(client_far);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream_far);

        upstream_write.write_all(b"response").await.unwrap();
        upstream_write.shutdown().await.unwrap();

        let mut received = Vec::new();
        client_read.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"response");

        // 客户端方向仍然可写
        client_write.write_all(b"late request").await.unwrap();
        client_write.shutdown().await.unwrap();
        let mut forwarded = Vec::new();
        upstream_read.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, b"late request");

        let (up, down) = relay_task.await.unwrap().unwrap();
        assert_eq!((up, down), (12, 8));
    }

    #[tokio::test]
    async fn test_error_tears_down_both_directions() {
        let (client_far, client_near) = duplex(1024);
        let (upstream_near, upstream_far) = duplex(1024);
        let limited = LimitedStream::new(
            Context::background(),
            BandwidthLimiter::new(Arc::new(RateBudget::new(1000, 4))),
            BandwidthLimiter::unlimited(),
            client_near,
        );

        // 缓冲区大于突发上限，客户端方向的第一次读就会失败
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            relay(&Context::background(), limited, upstream_near, 64),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::Io(_))));

        let mut upstream_far = upstream_far;
        let mut rest = Vec::new();
        upstream_far.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(client_far);
    }

    #[tokio::test]
    async fn test_cancel_stops_relay() {
        let (_client_far, client_near) = duplex(1024);
        let (upstream_near, _upstream_far) = duplex(1024);
        let ctx = Context::background();
        let canceller = ctx.clone();

        let task = tokio::spawn(async move { relay(&ctx, client_near, upstream_near, 64).await });
        canceller.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
    }
}
