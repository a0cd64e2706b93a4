/*!
 * 存储连通性探测
 *
 * 启动时对存储执行一次 `SELECT 1;`，只有探测成功才会得到 `Verified` 句柄，
 * 而存储客户端只能由 `Verified` 句柄构造，从类型上保证服务端拿到的连接都已确认可达。
 */

use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const LIVENESS_QUERY: &str = "SELECT 1;";

/// 存储不可达。所有失败原因统一归入此类，不区分瞬时或永久错误
#[derive(Error, Debug)]
pub enum ConnectivityError {
    #[error("liveness query failed: {0}")]
    Query(String),

    #[error("liveness query timed out after {0:?}")]
    TimedOut(Duration),
}

/// 能执行无 schema 依赖查询的存储句柄
pub trait Liveness {
    fn ping(&self, query: &str) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
}

impl Liveness for PgPool {
    async fn ping(&self, query: &str) -> Result<(), sqlx::Error> {
        sqlx::query(query).execute(self).await?;
        Ok(())
    }
}

/// 已通过连通性探测的句柄
#[derive(Debug, Clone)]
pub struct Verified<C>(C);

impl<C> Verified<C> {
    pub fn get(&self) -> &C {
        &self.0
    }

    pub fn into_inner(self) -> C {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectivityProbe {
    timeout: Duration,
}

impl ConnectivityProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 执行一次探测，不做重试
    pub async fn verify<C: Liveness>(&self, handle: C) -> Result<Verified<C>, ConnectivityError> {
        check(&handle, self.timeout).await?;
        debug!(timeout = ?self.timeout, "store liveness query acknowledged");
        Ok(Verified(handle))
    }
}

/// 探测但不转移所有权，供就绪检查复用
pub async fn check<C: Liveness>(handle: &C, timeout: Duration) -> Result<(), ConnectivityError> {
    match tokio::time::timeout(timeout, handle.ping(LIVENESS_QUERY)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectivityError::Query(e.to_string())),
        Err(_) => Err(ConnectivityError::TimedOut(timeout)),
    }
}
