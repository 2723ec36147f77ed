//! 日志初始化
//!
//! stderr 输出始终开启；诊断日志文件按天轮转，尽力而为：目录无法创建时只输出到 stderr。

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// 未设置 `RUST_LOG` 时的过滤规则
pub const DEFAULT_LOG_FILTER: &str = "camshare_daemon=info,camshare_driver=info,camshare_protocol=info";

const LOG_FILE_PREFIX: &str = "camshare-daemon";

/// 创建按天轮转的文件写入器
///
/// 返回的 guard 必须保持存活，丢弃时会刷新缓冲。
pub fn file_writer(
    log_dir: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard), String> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("cannot create {}: {}", log_dir.display(), e))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(log_dir)
        .map_err(|e| format!("cannot open log file in {}: {}", log_dir.display(), e))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// 初始化全局日志
///
/// `log_dir` 为 `None` 时不写文件。返回文件写入器的 guard（如有）。
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let (file_layer, guard, file_error) = match log_dir.map(file_writer) {
        Some(Ok((writer, guard))) => (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
            None,
        ),
        Some(Err(e)) => (None, None, Some(e)),
        None => (None, None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();

    if let Err(e) = installed {
        eprintln!("Logging already initialized: {}", e);
    }
    if let Some(e) = file_error {
        tracing::warn!("File logging disabled: {}", e);
    }
    guard
}
