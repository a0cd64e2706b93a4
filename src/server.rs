/*!
 * HTTP 服务器模块
 *
 * `ServerDescriptor` 汇总启动阶段产出的全部参数（监听地址、调试开关、日志 span、
 * 存储客户端、认证配置），构造后不可修改，以引用传给运行循环。
 */

use crate::auth::{AuthConfig, JwtValidator};
use crate::database::Database;
use crate::error::{AppError, AppResult};
use crate::handlers::AppState;
use crate::routes::create_router;
use axum::{serve, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn, Instrument, Span};

/// 服务器描述
#[derive(Debug, Clone)]
pub struct ServerDescriptor<S = Database> {
    listen: String,
    debug: bool,
    logger: Span,
    store: S,
    auth: AuthConfig,
}

impl<S> ServerDescriptor<S> {
    pub fn new(listen: String, debug: bool, logger: Span, store: S, auth: AuthConfig) -> Self {
        Self {
            listen,
            debug,
            logger,
            store,
            auth,
        }
    }

    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn logger(&self) -> &Span {
        &self.logger
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn auth_config(&self) -> &AuthConfig {
        &self.auth
    }
}

/// HTTP 服务器
pub struct Server {
    listen: String,
    logger: Span,
    router: Router,
}

impl Server {
    /// 根据描述创建服务器，路由与认证中间件在此装配
    pub fn new(descriptor: &ServerDescriptor) -> Self {
        let state = AppState {
            db: descriptor.store().clone(),
            auth: Arc::new(JwtValidator::new(descriptor.auth_config().clone())),
        };
        Self {
            listen: descriptor.listen().to_string(),
            logger: descriptor.logger().clone(),
            router: create_router(state, descriptor.debug()),
        }
    }

    /// 绑定地址并运行，直到收到停止信号
    ///
    /// 绑定失败或运行期的不可恢复错误都会返回 `Err`，正常停机返回 `Ok`。
    pub async fn run(self) -> AppResult<()> {
        let listener = TcpListener::bind(&self.listen).await.map_err(|e| {
            AppError::Internal(format!("Failed to bind to address {}: {}", self.listen, e))
        })?;

        let router = self.router;
        async move {
            if let Ok(addr) = listener.local_addr() {
                info!(address = %addr, "Server listening");
            }
            serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .map_err(|e| AppError::Internal(format!("Server error: {}", e)))?;
            info!("Server stopped");
            Ok::<(), AppError>(())
        }
        .instrument(self.logger)
        .await
    }
}

/// 等待 Ctrl-C 或 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
