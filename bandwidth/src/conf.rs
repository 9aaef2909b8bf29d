use parking_lot::RwLock;

/// 不限速
pub const INF: i64 = i64::MAX;

/// 某一时刻的限速配置快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    /// 每秒字节数，`INF` 表示不限速
    pub limit: i64,
    /// 单次读写最多能消耗的字节数
    pub burst: i64,
}

/// 可在多个任务间并发读写的限速配置。
///
/// 限速器在每次等待前都会重新读取它，修改会在下一次等待时生效。
#[derive(Debug)]
pub struct RateBudget {
    inner: RwLock<Budget>,
}

impl RateBudget {
    /// `limit <= 0` 视为不限速，`burst <= 0` 时取 `limit`
    pub fn new(limit: i64, burst: i64) -> Self {
        let limit = validate_limit(limit);
        Self {
            inner: RwLock::new(Budget {
                limit,
                burst: validate_burst(burst, limit),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(INF, INF)
    }

    pub fn set_limit(&self, limit: i64) {
        let mut budget = self.inner.write();
        budget.limit = validate_limit(limit);
        // 原先不限速时 burst 也是 INF，需要跟着新的速率收紧
        if budget.burst == INF {
            budget.burst = budget.limit;
        }
    }

    pub fn set_burst(&self, burst: i64) {
        let mut budget = self.inner.write();
        budget.burst = validate_burst(burst, budget.limit);
    }

    pub fn limit(&self) -> i64 {
        self.inner.read().limit
    }

    pub fn burst(&self) -> i64 {
        self.inner.read().burst
    }

    pub fn snapshot(&self) -> Budget {
        *self.inner.read()
    }
}

impl Default for RateBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

fn validate_limit(limit: i64) -> i64 {
    if limit < 1 { INF } else { limit }
}

fn validate_burst(burst: i64, limit: i64) -> i64 {
    if burst <= 0 { limit } else { burst }
}
