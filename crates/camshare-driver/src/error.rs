//! 驱动层错误类型定义

use camshare_protocol::CommandCode;
use thiserror::Error;

/// 绑定层错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingErrorKind {
    Unknown,
    NotFound,
    AccessDenied,
    Busy,
    InvalidParameter,
    Unsupported,
    CommandFailed,
    Timeout,
    Io,
}

/// 硬件绑定层错误（携带底层诊断文本）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct BindingError {
    pub kind: BindingErrorKind,
    pub message: String,
}

impl BindingError {
    pub fn new(kind: BindingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn command_failed(code: CommandCode, message: impl Into<String>) -> Self {
        Self::new(
            BindingErrorKind::CommandFailed,
            format!("{} failed: {}", code, message.into()),
        )
    }
}

impl From<String> for BindingError {
    fn from(message: String) -> Self {
        Self::new(BindingErrorKind::Unknown, message)
    }
}

impl From<&str> for BindingError {
    fn from(message: &str) -> Self {
        Self::new(BindingErrorKind::Unknown, message)
    }
}

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 引用计数为 0 时发出了硬件请求
    #[error("Device not connected")]
    NotConnected,

    /// 枚举没有找到可用的相机
    #[error("No camera found")]
    NoDevice,

    /// 设备拒绝或执行命令出错
    #[error("Hardware error: {0}")]
    Hardware(#[from] BindingError),

    /// 请求参数不合法（在发往硬件前被拒绝）
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// 硬件返回的数据无法按预期形状解析
    #[error("Unexpected reply to {code}: {message}")]
    UnexpectedReply { code: CommandCode, message: String },
}
