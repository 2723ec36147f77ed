//! 协议层错误类型定义

use thiserror::Error;

/// 协议层错误类型
///
/// 覆盖帧切分、信封解析和像素编解码三类失败。
/// 守护进程会把这些错误转换成带 `error` 字段的响应帧，连接保持打开。
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON 解析/序列化失败
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// 帧内容不是合法 UTF-8
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    /// 未知的请求类型
    #[error("Unknown request type: {0}")]
    UnknownType(String),

    /// 透传命令缺少数字命令码
    #[error("Request type `{0}` requires a numeric `command` code")]
    MissingCommandCode(String),

    /// 缓冲区内未终止的帧超过上限
    #[error("Frame exceeds {limit} bytes without terminator")]
    FrameTooLarge { limit: usize },

    /// 像素数据 base64 解码失败
    #[error("Invalid base64 pixel payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// 像素数据解压失败
    #[error("Pixel decompression failed: {0}")]
    Decompress(String),

    /// 不支持的像素编码
    #[error("Unsupported pixel encoding: {0}")]
    UnsupportedEncoding(String),

    /// 解压后的样本数与声明的宽高不符
    #[error("Sample count mismatch: expected {expected} samples, got {actual} bytes")]
    SampleCountMismatch { expected: usize, actual: usize },
}
