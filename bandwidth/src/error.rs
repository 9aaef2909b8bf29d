use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// 单次请求的令牌数超过突发上限，永远无法满足
    #[error("请求 {n} 字节超过限速器突发上限 {burst}")]
    Oversized { n: i64, burst: i64 },

    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("等待 {n} 字节的令牌会超过截止时间")]
    WouldExceedDeadline { n: i64 },
}

impl Error {
    /// 是否由取消或超时引起
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::Canceled | Error::DeadlineExceeded | Error::WouldExceedDeadline { .. }
        )
    }

    /// 从限速流返回的 IO 错误中取回原始错误
    pub fn from_io(err: &io::Error) -> Option<&Error> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<Error>())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::Oversized { .. } => io::ErrorKind::InvalidInput,
            Error::DeadlineExceeded | Error::WouldExceedDeadline { .. } => io::ErrorKind::TimedOut,
            Error::Canceled => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
