/*!
 * 事务冲突重试策略
 *
 * 描述存储客户端如何重试因序列化冲突（SQLSTATE `40001`）被存储中止的事务，
 * 以及两次尝试之间带抖动的指数退避。
 *
 * 策略只是一个值，由 `Database::new` 接收，不修改任何驱动级全局状态。
 */

use rand::Rng;
use std::time::Duration;

/// 可重试事务冲突的 SQLSTATE
pub const SERIALIZATION_FAILURE: &str = "40001";

/// CockroachDB 客户端重试协议约定的保存点名
pub const RESTART_SAVEPOINT: &str = "cockroach_restart";

const JITTER_RATIO: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub savepoint: &'static str,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            savepoint: RESTART_SAVEPOINT,
            max_attempts: 10,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, err: &sqlx::Error) -> bool {
        let code = err.as_database_error().and_then(|db| db.code());
        is_retryable_code(code.as_deref())
    }

    pub fn savepoint_sql(&self) -> String {
        format!("SAVEPOINT {}", self.savepoint)
    }

    pub fn rollback_sql(&self) -> String {
        format!("ROLLBACK TO SAVEPOINT {}", self.savepoint)
    }

    pub fn release_sql(&self) -> String {
        format!("RELEASE SAVEPOINT {}", self.savepoint)
    }

    /// 第 `attempt` 次重试前的等待时间（从 1 开始计），第 0 次不等待
    ///
    /// `base_backoff * 2^(attempt-1)`，以 `max_backoff` 封顶，再叠加不超过 10% 的随机抖动。
    pub fn backoff(&self, attempt: u32) -> Duration {
        let Some(exponent) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let delay = self
            .base_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff));
        delay + delay.mul_f64(rand::thread_rng().gen_range(0.0..JITTER_RATIO))
    }
}

pub fn is_retryable_code(code: Option<&str>) -> bool {
    code == Some(SERIALIZATION_FAILURE)
}

/// 为存储客户端生成带冲突重试的事务策略
pub struct RetryPolicyRegistrar;

impl RetryPolicyRegistrar {
    /// 幂等：每次调用得到相同的策略
    pub fn register() -> RetryPolicy {
        RetryPolicy::default()
    }
}
