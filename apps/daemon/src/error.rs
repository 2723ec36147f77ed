//! 守护进程错误类型

use camshare_driver::DriverError;
use camshare_protocol::ProtocolError;
use std::net::SocketAddr;
use thiserror::Error;

/// 守护进程启动/运行错误
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 单个请求的失败原因（转换为带 `error` 字段的响应，连接保持打开）
#[derive(Error, Debug)]
pub enum RequestError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Internal error while handling `{0}`")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_error_is_transparent() {
        let err = RequestError::from(DriverError::NotConnected);
        assert_eq!(err.to_string(), "Device not connected");

        let err = RequestError::from(ProtocolError::UnknownType("zap".to_string()));
        assert_eq!(err.to_string(), "Unknown request type: zap");
    }

    #[test]
    fn test_bind_error_names_address() {
        let err = DaemonError::Bind {
            addr: "127.0.0.1:21110".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("127.0.0.1:21110"));
    }
}
