use crate::config::{keys, Configuration};
use std::fs::OpenOptions;
use std::io;
use std::sync::Mutex;
use tracing_subscriber::fmt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// `logging.debug` 选择默认级别，`RUST_LOG` 优先；`logging.file` 非空时同时写入文件
pub fn init_logging(config: &Configuration) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let log_level = if config.get_bool(keys::LOGGING_DEBUG) {
        "debug"
    } else {
        "info"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_ansi(true)
        .with_writer(io::stdout);

    let log_path = config.get_string(keys::LOGGING_FILE);
    let file_layer = if log_path.is_empty() {
        None
    } else {
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        Some(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .with_writer(Mutex::new(log_file)),
        )
    };

    Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}
