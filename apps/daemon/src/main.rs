//! camshare 守护进程主入口

use anyhow::Context;
use camshare_daemon::{DaemonConfig, Server, SingletonLock, logging};
use camshare_driver::{SharedCamera, SimulatedCamera};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// camshare 守护进程
///
/// 常驻进程，独占相机，通过回环 TCP 向多个客户端进程提供串行化的相机访问
#[derive(Parser, Debug)]
#[command(name = "camshare_daemon")]
#[command(about = "camshare daemon - share one camera between many client processes", long_about = None)]
struct Args {
    /// TOML 配置文件
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// 监听地址（必须是回环地址）
    ///
    /// 默认: 127.0.0.1:21110
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// 连接静默超时（秒）
    ///
    /// 默认: 1800
    #[arg(long)]
    liveness_timeout: Option<f64>,

    /// 客户端未 disconnect 就断开时，释放它持有的设备引用
    #[arg(long)]
    release_on_disconnect: bool,

    /// 锁文件路径
    ///
    /// 默认: XDG_RUNTIME_DIR 或系统临时目录
    #[arg(long)]
    lock_file: Option<PathBuf>,

    /// 诊断日志目录
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// 不写日志文件（只输出到 stderr）
    #[arg(long)]
    no_file_log: bool,
}

impl Args {
    /// 命令行参数覆盖配置文件
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(timeout) = self.liveness_timeout {
            config.liveness_timeout_secs = timeout;
        }
        if self.release_on_disconnect {
            config.release_on_disconnect = true;
        }
        if let Some(ref lock_file) = self.lock_file {
            config.lock_file = Some(lock_file.clone());
        }
        if let Some(ref log_dir) = self.log_dir {
            config.log_dir = Some(log_dir.clone());
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match args.config {
        Some(ref path) => DaemonConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    let log_dir = (!args.no_file_log).then(|| config.log_dir_or_default());
    let _log_guard = logging::init(log_dir.as_deref());

    // 1. 单例锁：同一时刻只能有一个进程占用相机
    let lock_path = config.lock_file_or_default();
    let _lock = SingletonLock::try_lock(&lock_path).with_context(|| {
        format!(
            "another camshare daemon may be running (lock file {})",
            lock_path.display()
        )
    })?;

    // 2. 设备层
    let camera = Arc::new(SharedCamera::new(SimulatedCamera::new(
        config.simulator.clone(),
    )));

    // 3. 监听
    let server = Server::bind(&config, camera)?;
    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down");
        shutdown.trigger();
    })
    .context("installing signal handler")?;

    info!("camshare daemon starting");
    info!("  Listen: {}", server.local_addr());
    info!("  Liveness timeout: {:?}", config.liveness_timeout());
    info!("  Release on disconnect: {}", config.release_on_disconnect);
    info!("  Shutdown grace: {:?}", config.shutdown_grace());
    info!("  Lock file: {}", lock_path.display());
    if let Some(ref dir) = log_dir {
        info!("  Log dir: {}", dir.display());
    }

    server.run()?;
    info!("camshare daemon stopped");
    Ok(())
}
