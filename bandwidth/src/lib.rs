//! 分层令牌桶带宽限速
//!
//! 服务端级别的限速器作为根节点，每个连接的读写限速器作为子节点。
//! 子节点等待时先满足父节点，再满足自己的令牌桶，
//! 从而同时受连接上限和全局上限约束。

mod conf;
mod conn;
mod context;
mod error;
mod limiter;
mod listener;
mod tree;

pub use conf::{Budget, INF, RateBudget};
pub use conn::LimitedStream;
pub use context::Context;
pub use error::{Error, Result};
pub use limiter::Limiter;
pub use listener::{LimitedListener, ListenerConfig};
pub use tree::{BandwidthLimiter, LimiterTree, NodeId};
