/*!
 * 数据库访问模块
 *
 * 封装 PostgreSQL 协议兼容存储（CockroachDB）的连接池：
 * - 惰性打开连接池（仅校验连接串）
 * - 就绪检查
 * - 遵循 CockroachDB 客户端重试协议的事务执行
 */

use crate::error::{AppError, AppResult};
use crate::probe::{self, ConnectivityError, ConnectivityProbe, Verified};
use crate::retry::RetryPolicy;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// 事务回调返回的 future
pub type TxFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, sqlx::Error>> + Send + 'c>>;

/// 打开连接池但不建立连接
///
/// 只有连接串格式错误时才会失败，真正的连通性由 `ConnectivityProbe` 确认。
pub fn open_pool(database_url: &str, acquire_timeout: Duration) -> AppResult<PgPool> {
    let pool = PgPoolOptions::new()
        .acquire_timeout(acquire_timeout)
        .connect_lazy(database_url)?;
    Ok(pool)
}

#[derive(Clone, Debug)]
pub struct Database {
    pool: PgPool,
    retry: RetryPolicy,
    probe: ConnectivityProbe,
}

impl Database {
    /// 只接受已通过探测的连接池
    pub fn new(pool: Verified<PgPool>, retry: RetryPolicy, probe: ConnectivityProbe) -> Self {
        Database {
            pool: pool.into_inner(),
            retry,
            probe,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn ping(&self) -> Result<(), ConnectivityError> {
        probe::check(&self.pool, self.probe.timeout()).await
    }

    /// 在事务中执行 `op`，遇到序列化冲突时按重试协议自动重试
    ///
    /// 流程：`BEGIN` → `SAVEPOINT` → op → `RELEASE SAVEPOINT` → `COMMIT`；
    /// op 或 RELEASE 返回 40001 时 `ROLLBACK TO SAVEPOINT` 后重新执行 op。
    /// 其余错误直接返回，事务随 `tx` 析构回滚。
    pub async fn execute_tx<T, F>(&self, mut op: F) -> AppResult<T>
    where
        F: for<'c> FnMut(&'c mut PgConnection) -> TxFuture<'c, T>,
    {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&self.retry.savepoint_sql())
            .execute(&mut *tx)
            .await?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let err = match op(&mut *tx).await {
                Ok(value) => match sqlx::query(&self.retry.release_sql())
                    .execute(&mut *tx)
                    .await
                {
                    Ok(_) => {
                        tx.commit().await?;
                        if attempt > 1 {
                            debug!(attempt, "transaction committed after retry");
                        }
                        return Ok(value);
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            if !self.retry.is_retryable(&err) {
                return Err(err.into());
            }
            if attempt >= self.retry.max_attempts {
                return Err(AppError::RetriesExhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            warn!(attempt, error = %err, "transaction conflict, retrying");
            sqlx::query(&self.retry.rollback_sql())
                .execute(&mut *tx)
                .await?;
            tokio::time::sleep(self.retry.backoff(attempt)).await;
        }
    }
}
