use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, sleep_until};

use crate::conf::{Budget, INF};
use crate::context::Context;
use crate::error::{Error, Result};

/// 单节点令牌桶。
///
/// 令牌按 `limit` 字节/秒连续补充，最多累积到 `burst`。
/// 等待者先预留令牌（余额可以为负），再睡到欠下的令牌补齐为止；
/// 中途被取消时把预留的令牌还回去。
#[derive(Debug)]
pub struct Limiter {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    limit: i64,
    burst: i64,
    tokens: f64,
    /// `None` 表示从未使用过，桶是满的
    last: Option<Instant>,
}

impl State {
    fn advance(&self, now: Instant) -> f64 {
        let Some(last) = self.last else {
            return self.burst as f64;
        };
        if self.limit == INF {
            return self.burst as f64;
        }
        let elapsed = now.saturating_duration_since(last).as_secs_f64();
        (self.tokens + elapsed * self.limit as f64).min(self.burst as f64)
    }

    fn sync(&mut self, now: Instant) {
        self.tokens = self.advance(now);
        self.last = Some(now);
    }
}

impl Limiter {
    pub fn new(limit: i64, burst: i64) -> Self {
        Self {
            state: Mutex::new(State {
                limit,
                burst,
                tokens: burst as f64,
                last: None,
            }),
        }
    }

    pub fn from_budget(budget: Budget) -> Self {
        Self::new(budget.limit, budget.burst)
    }

    pub fn limit(&self) -> i64 {
        self.state.lock().limit
    }

    pub fn burst(&self) -> i64 {
        self.state.lock().burst
    }

    /// 当前可用的令牌数
    pub fn tokens(&self) -> f64 {
        self.state.lock().advance(Instant::now())
    }

    /// 按配置快照更新速率和突发上限，未变化时什么都不做
    pub fn configure(&self, budget: Budget) {
        let mut state = self.state.lock();
        if state.limit == budget.limit && state.burst == budget.burst {
            return;
        }
        state.sync(Instant::now());
        state.limit = budget.limit;
        state.burst = budget.burst;
    }

    /// 阻塞直到有 `n` 个令牌可用并消耗它们。
    ///
    /// `n` 超过突发上限时立即返回 [`Error::Oversized`]；
    /// 取消或到期时返回对应错误且不消耗令牌。
    pub async fn wait_n(&self, ctx: &Context, n: i64) -> Result<()> {
        ctx.err()?;

        let Some(ready_at) = self.reserve(n, ctx.deadline())? else {
            return Ok(());
        };

        tokio::select! {
            _ = sleep_until(ready_at) => Ok(()),
            err = ctx.done() => {
                self.restore(n);
                Err(err)
            }
        }
    }

    /// 预留令牌，返回需要等到的时刻；无需等待时返回 `None`
    fn reserve(&self, n: i64, deadline: Option<Instant>) -> Result<Option<Instant>> {
        let mut state = self.state.lock();
        if state.limit == INF || n <= 0 {
            return Ok(None);
        }
        if n > state.burst {
            return Err(Error::Oversized {
                n,
                burst: state.burst,
            });
        }

        let now = Instant::now();
        let tokens = state.advance(now) - n as f64;
        let wait = if tokens < 0.0 {
            Duration::try_from_secs_f64(-tokens / state.limit as f64).ok()
        } else {
            Some(Duration::ZERO)
        };
        // 等待时间超出时钟范围时按永远等不到处理
        let Some(ready_at) = wait.and_then(|wait| now.checked_add(wait)) else {
            return Err(Error::WouldExceedDeadline { n });
        };
        if matches!(deadline, Some(deadline) if ready_at > deadline) {
            return Err(Error::WouldExceedDeadline { n });
        }

        state.tokens = tokens;
        state.last = Some(now);
        Ok((ready_at > now).then_some(ready_at))
    }

    fn restore(&self, n: i64) {
        let mut state = self.state.lock();
        state.sync(Instant::now());
        state.tokens = (state.tokens + n as f64).min(state.burst as f64);
    }
}
