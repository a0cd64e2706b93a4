/*!
 * 启动编排模块
 *
 * 基于解析好的 `Configuration` 依次执行各启动阶段，并记录每一次状态迁移。
 *
 * - 阶段严格按顺序执行，任何阶段出错都立即终止，不做回滚
 * - 服务器最后启动，且只接收已通过连通性探测的存储
 * - 阶段失败被包装为带阶段信息的 `BootstrapError`，由 `main` 统一记录日志并决定退出码
 */

use crate::auth::AuthConfigAssembler;
use crate::config::{keys, Configuration};
use crate::database::{self, Database};
use crate::error::{AppError, AppResult};
use crate::probe::{ConnectivityProbe, Liveness, Verified};
use crate::retry::{RetryPolicy, RetryPolicyRegistrar};
use crate::server::{Server, ServerDescriptor};
use sqlx::PgPool;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span};

const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Unconfigured,
    ConfigResolved,
    ConnectivityVerified,
    PolicyRegistered,
    AuthAssembled,
    Running,
    Terminated,
    FatalAborted,
}

/// 导致启动终止的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoadConfig,
    OpenStore,
    VerifyConnectivity,
    StartServer,
}

impl Stage {
    pub fn failure_message(&self) -> &'static str {
        match self {
            Stage::LoadConfig => "failed to load configuration",
            Stage::OpenStore => "failed to init data store",
            Stage::VerifyConnectivity => "failed verifying database connection",
            Stage::StartServer => "failed starting server",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.failure_message())
    }
}

#[derive(Error, Debug)]
#[error("{stage}: {source}")]
pub struct BootstrapError {
    pub stage: Stage,
    #[source]
    pub source: AppError,
}

impl BootstrapError {
    pub fn new(stage: Stage, source: AppError) -> Self {
        Self { stage, source }
    }
}

/// 启动过程驱动的外部组件：存储驱动与服务器运行循环
pub trait Collaborators {
    type Conn: Liveness;
    type Store;

    /// 打开存储句柄，此时不与存储通信
    fn open_store(&mut self, uri: &str, acquire_timeout: Duration) -> AppResult<Self::Conn>;

    /// 用已验证的句柄和重试策略构造存储客户端
    fn attach_retry_policy(
        &mut self,
        conn: Verified<Self::Conn>,
        policy: RetryPolicy,
        probe: ConnectivityProbe,
    ) -> Self::Store;

    /// 运行直到关闭
    fn serve(
        &mut self,
        descriptor: &ServerDescriptor<Self::Store>,
    ) -> impl Future<Output = AppResult<()>>;
}

/// 生产环境实现：PostgreSQL 协议存储 + axum 服务器
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresCollaborators;

impl Collaborators for PostgresCollaborators {
    type Conn = PgPool;
    type Store = Database;

    fn open_store(&mut self, uri: &str, acquire_timeout: Duration) -> AppResult<PgPool> {
        database::open_pool(uri, acquire_timeout)
    }

    fn attach_retry_policy(
        &mut self,
        conn: Verified<PgPool>,
        policy: RetryPolicy,
        probe: ConnectivityProbe,
    ) -> Database {
        Database::new(conn, policy, probe)
    }

    async fn serve(&mut self, descriptor: &ServerDescriptor<Database>) -> AppResult<()> {
        Server::new(descriptor).run().await
    }
}

pub struct Bootstrap {
    config: Configuration,
    history: Vec<BootstrapState>,
}

impl Bootstrap {
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            history: vec![BootstrapState::Unconfigured, BootstrapState::ConfigResolved],
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.history
            .last()
            .copied()
            .unwrap_or(BootstrapState::Unconfigured)
    }

    pub fn history(&self) -> &[BootstrapState] {
        &self.history
    }

    fn advance(&mut self, next: BootstrapState) {
        debug!(from = ?self.state(), to = ?next, "bootstrap transition");
        self.history.push(next);
    }

    fn abort(&mut self, stage: Stage, source: AppError) -> BootstrapError {
        self.advance(BootstrapState::FatalAborted);
        BootstrapError::new(stage, source)
    }

    fn probe(&self) -> ConnectivityProbe {
        let secs = self
            .config
            .get_u64(keys::DB_PROBE_TIMEOUT)
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS);
        ConnectivityProbe::new(Duration::from_secs(secs))
    }

    /// 依次执行各阶段，然后运行服务器直到其返回
    pub async fn run<C: Collaborators>(&mut self, collab: &mut C) -> Result<(), BootstrapError> {
        let probe = self.probe();

        let conn = match collab.open_store(&self.config.get_string(keys::DB_URI), probe.timeout()) {
            Ok(conn) => conn,
            Err(e) => return Err(self.abort(Stage::OpenStore, e)),
        };

        let verified = match probe.verify(conn).await {
            Ok(verified) => verified,
            Err(e) => return Err(self.abort(Stage::VerifyConnectivity, e.into())),
        };
        self.advance(BootstrapState::ConnectivityVerified);

        let store = collab.attach_retry_policy(verified, RetryPolicyRegistrar::register(), probe);
        self.advance(BootstrapState::PolicyRegistered);

        let auth = AuthConfigAssembler::build(&self.config);
        self.advance(BootstrapState::AuthAssembled);

        let listen = self.config.get_string(keys::LISTEN);
        info!(address = %listen, "starting server");

        let descriptor = ServerDescriptor::new(
            listen.clone(),
            self.config.get_bool(keys::LOGGING_DEBUG),
            info_span!("server", address = %listen),
            store,
            auth,
        );
        self.advance(BootstrapState::Running);

        match collab.serve(&descriptor).await {
            Ok(()) => {
                self.advance(BootstrapState::Terminated);
                Ok(())
            }
            Err(e) => Err(self.abort(Stage::StartServer, e)),
        }
    }
}

/// 输出一条包含失败阶段与原因的结构化日志
pub fn log_fatal(err: &BootstrapError) {
    error!(stage = ?err.stage, error = %err.source, "{}", err.stage);
}

/// 启动结果对应的进程退出码
pub fn exit_status(result: &Result<(), BootstrapError>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}
