/*!
 * 错误处理模块
 *
 * 定义服务运行期的统一错误类型，以及启动阶段的致命错误。
 * 运行期错误会被转换为 JSON HTTP 响应；启动错误只由顶层 `main` 记录并决定退出码。
 */

use crate::probe::ConnectivityError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// 应用程序结果类型的别名
pub type AppResult<T> = Result<T, AppError>;

/// 应用程序错误枚举
#[derive(Error, Debug)]
pub enum AppError {
    /// 数据库操作错误
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// 存储不可达（连接探测失败）
    #[error("Store unreachable: {0}")]
    Connectivity(#[from] ConnectivityError),

    /// 事务在冲突重试次数用尽后仍未成功
    #[error("Transaction retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: sqlx::Error },

    /// 认证失败错误
    /// 缺少令牌、JWT 验证失败、JWKS 不可用等
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// JWT 处理错误
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// HTTP 客户端错误（JWKS 拉取）
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// 配置错误
    /// 配置文件缺失或格式错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 内部服务器错误
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    /// 将错误转换为 HTTP 响应
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Auth(_) | AppError::Jwt(_) | AppError::HttpClient(_) => {
                (StatusCode::UNAUTHORIZED, "Authentication failed")
            }
            AppError::Connectivity(_) => (StatusCode::SERVICE_UNAVAILABLE, "Store unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };

        let body = Json(json!({
            "error": error_message,
            "message": self.to_string()
        }));

        (status, body).into_response()
    }
}
