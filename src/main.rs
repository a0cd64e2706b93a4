/*!
 * serverservice 主入口
 *
 * 负责：
 * - 解析命令行并合并配置（参数 > 环境变量 > 配置文件 > 默认值）
 * - 初始化日志
 * - 按顺序执行启动阶段并运行 HTTP 服务
 *
 * 任一阶段失败只在这里记录一次并以非零状态退出。
 */

use clap::Parser;
use serverservice::bootstrap::{self, Bootstrap, BootstrapError, PostgresCollaborators, Stage};
use serverservice::cli::{Cli, Commands};
use serverservice::config::{ConfigResolver, FileValues, ProcessEnv};
use serverservice::logging;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // .env 中的变量并入进程环境，已存在的变量不会被覆盖
    dotenvy::dotenv().ok();

    let (file, file_error) = match cli.config.as_deref().map(FileValues::load).transpose() {
        Ok(file) => (file.unwrap_or_default(), None),
        Err(e) => (FileValues::default(), Some(e)),
    };

    let config =
        ConfigResolver::with_service_defaults().resolve(&cli.flag_values(), &ProcessEnv, &file);

    if let Err(e) = logging::init_logging(&config) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    if let Some(e) = file_error {
        bootstrap::log_fatal(&BootstrapError::new(Stage::LoadConfig, e));
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Serve(_) => {
            let mut bootstrap = Bootstrap::new(config);
            bootstrap.run(&mut PostgresCollaborators).await
        }
    };

    if let Err(e) = &result {
        bootstrap::log_fatal(e);
    }
    ExitCode::from(bootstrap::exit_status(&result))
}
