//! 守护进程配置
//!
//! 默认值 ← TOML 配置文件 ← 命令行参数，后者覆盖前者。

use crate::error::DaemonError;
use camshare_driver::SimulatorConfig;
use camshare_protocol::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认监听地址
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:21110";

/// 守护进程配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// 监听地址（必须是回环地址）
    pub bind_addr: SocketAddr,

    /// 连接无入站数据多久后被关闭（秒，默认 30 分钟）
    pub liveness_timeout_secs: f64,

    /// 活跃度检查周期（毫秒）
    pub liveness_check_interval_ms: u64,

    /// 连接断开时释放它仍持有的设备引用
    ///
    /// 默认关闭：客户端未发送 `disconnect` 就消失时，其引用保持占用。
    pub release_on_disconnect: bool,

    /// 单帧最大字节数
    pub max_frame_bytes: usize,

    /// 关闭时等待连接自行结束的时间（毫秒）
    ///
    /// 超时后停止读取剩余连接的新请求，正在执行的请求仍会完成并回复。
    pub shutdown_grace_ms: u64,

    /// 诊断日志目录（`None` 时使用平台默认目录）
    pub log_dir: Option<PathBuf>,

    /// 单例锁文件路径（`None` 时使用平台默认路径）
    pub lock_file: Option<PathBuf>,

    /// 模拟相机参数
    pub simulator: SimulatorConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 21110)),
            liveness_timeout_secs: 30.0 * 60.0,
            liveness_check_interval_ms: 1000,
            release_on_disconnect: false,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            shutdown_grace_ms: 5000,
            log_dir: None,
            lock_file: None,
            simulator: SimulatorConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// 从 TOML 文本解析（缺失的键取默认值）
    pub fn from_toml_str(text: &str) -> Result<Self, DaemonError> {
        let config: Self = toml::from_str(text).map_err(|e| DaemonError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, DaemonError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DaemonError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// 检查取值范围
    pub fn validate(&self) -> Result<(), DaemonError> {
        if !self.bind_addr.ip().is_loopback() {
            return Err(DaemonError::Config(format!(
                "bind_addr {} is not a loopback address",
                self.bind_addr
            )));
        }
        let secs = self.liveness_timeout_secs;
        match Duration::try_from_secs_f64(secs) {
            Ok(timeout) if !timeout.is_zero() => {},
            Err(_) if secs > 0.0 => {
                return Err(DaemonError::Config(format!(
                    "liveness_timeout_secs {} is out of range",
                    secs
                )));
            },
            _ => {
                return Err(DaemonError::Config(format!(
                    "liveness_timeout_secs must be positive, got {}",
                    secs
                )));
            },
        }
        if self.liveness_check_interval_ms == 0 {
            return Err(DaemonError::Config(
                "liveness_check_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_frame_bytes < 1024 {
            return Err(DaemonError::Config(format!(
                "max_frame_bytes must be at least 1024, got {}",
                self.max_frame_bytes
            )));
        }
        Ok(())
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.liveness_timeout_secs)
            .unwrap_or(Duration::from_secs(30 * 60))
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_check_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn log_dir_or_default(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(default_log_dir)
    }

    pub fn lock_file_or_default(&self) -> PathBuf {
        self.lock_file.clone().unwrap_or_else(default_lock_file)
    }
}

/// 默认锁文件路径
///
/// 优先 `XDG_RUNTIME_DIR`，其次系统临时目录。
pub fn default_lock_file() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir()
        && (runtime_dir.exists() || std::fs::create_dir_all(&runtime_dir).is_ok())
    {
        return runtime_dir.join("camshare_daemon.lock");
    }
    std::env::temp_dir().join("camshare_daemon.lock")
}

/// 默认日志目录
///
/// 优先用户状态目录（`~/.local/state`），其次本地数据目录，最后系统临时目录。
pub fn default_log_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join("camshare").join("logs"))
        .unwrap_or_else(|| std::env::temp_dir().join("camshare-logs"))
}
