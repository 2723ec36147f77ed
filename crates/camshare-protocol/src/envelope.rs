//! 请求/响应信封
//!
//! 请求：`{"type": <名称>, "command": <数字命令码，可选>, "parameters": <JSON>}`
//! 响应：`{"payload": <JSON>, "error": <字符串，仅失败时出现>}`
//!
//! 同一连接上一次只有一个未完成的请求，请求与响应按读写顺序隐式对应，没有请求 ID。

use crate::command::CommandCode;
use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Request Types
// ============================================================================

/// 请求类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Connect,
    Disconnect,
    StartExposure,
    AbortExposure,
    ExposureInProgress,
    EndReadout,
    ReadPixels,
    QueryTemperature,
    SetTemperature,
    GetDeviceInfo,
    FilterWheel,
    /// 硬件透传（使用 `command` 数字命令码）
    Command,
    /// 守护进程状态
    Status,
    /// 保活帧（只刷新活跃时间，不产生响应）
    KeepAlive,
    /// 客户端告别（应答后关闭连接）
    Bye,
}

impl RequestKind {
    pub const ALL: [RequestKind; 15] = [
        RequestKind::Connect,
        RequestKind::Disconnect,
        RequestKind::StartExposure,
        RequestKind::AbortExposure,
        RequestKind::ExposureInProgress,
        RequestKind::EndReadout,
        RequestKind::ReadPixels,
        RequestKind::QueryTemperature,
        RequestKind::SetTemperature,
        RequestKind::GetDeviceInfo,
        RequestKind::FilterWheel,
        RequestKind::Command,
        RequestKind::Status,
        RequestKind::KeepAlive,
        RequestKind::Bye,
    ];

    /// 线上名称
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Connect => "connect",
            RequestKind::Disconnect => "disconnect",
            RequestKind::StartExposure => "start-exposure",
            RequestKind::AbortExposure => "abort-exposure",
            RequestKind::ExposureInProgress => "exposure-in-progress",
            RequestKind::EndReadout => "end-readout",
            RequestKind::ReadPixels => "read-pixels",
            RequestKind::QueryTemperature => "query-temperature",
            RequestKind::SetTemperature => "set-temperature",
            RequestKind::GetDeviceInfo => "get-device-info",
            RequestKind::FilterWheel => "filter-wheel",
            RequestKind::Command => "command",
            RequestKind::Status => "status",
            RequestKind::KeepAlive => "keepalive",
            RequestKind::Bye => "bye",
        }
    }

    /// 是否会触碰硬件（需要经过串行化锁）
    pub fn touches_hardware(self) -> bool {
        !matches!(
            self,
            RequestKind::ExposureInProgress
                | RequestKind::Status
                | RequestKind::KeepAlive
                | RequestKind::Bye
        )
    }
}

impl FromStr for RequestKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Request
// ============================================================================

/// 请求信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandCode>,
    #[serde(default)]
    pub parameters: Value,
}

impl Request {
    /// 创建不带参数的请求
    pub fn simple(kind: RequestKind) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            command: None,
            parameters: Value::Null,
        }
    }

    /// 创建带参数的请求
    pub fn with_params<P: Serialize>(kind: RequestKind, params: &P) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: kind.as_str().to_string(),
            command: None,
            parameters: serde_json::to_value(params)?,
        })
    }

    /// 创建硬件透传请求
    pub fn passthrough(code: CommandCode, parameters: Value) -> Self {
        Self {
            kind: RequestKind::Command.as_str().to_string(),
            command: Some(code),
            parameters,
        }
    }

    /// 解析请求类型
    pub fn request_kind(&self) -> Result<RequestKind, ProtocolError> {
        self.kind.parse()
    }

    /// 透传命令码；缺失时报错
    pub fn command_code(&self) -> Result<CommandCode, ProtocolError> {
        self.command
            .ok_or_else(|| ProtocolError::MissingCommandCode(self.kind.clone()))
    }

    /// 按命令形状解析参数
    ///
    /// `parameters` 缺失或为 `null` 时按空对象处理，让全默认字段的参数类型可以省略参数。
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let value = if self.parameters.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            self.parameters.clone()
        };
        Ok(serde_json::from_value(value)?)
    }
}

// ============================================================================
// Response
// ============================================================================

/// 响应信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// 成功且无返回值
    pub fn empty() -> Self {
        Self {
            payload: Value::Null,
            error: None,
        }
    }

    /// 成功，携带已序列化的结果
    pub fn ok(payload: Value) -> Self {
        Self {
            payload,
            error: None,
        }
    }

    /// 成功，序列化结构化结果
    pub fn ok_serialized<T: Serialize>(payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self::ok(serde_json::to_value(payload)?))
    }

    /// 失败
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            payload: Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// 按结果形状解析 payload
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ConnectParams, SubDevice, SubDeviceParams};

    #[test]
    fn test_request_kind_names_roundtrip() {
        for kind in RequestKind::ALL {
            assert_eq!(kind.as_str().parse::<RequestKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_request_kind() {
        let err = "warp-drive".parse::<RequestKind>().unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(ref t) if t == "warp-drive"));
    }

    #[test]
    fn test_exposure_query_does_not_touch_hardware() {
        assert!(!RequestKind::ExposureInProgress.touches_hardware());
        assert!(!RequestKind::KeepAlive.touches_hardware());
        assert!(RequestKind::AbortExposure.touches_hardware());
        assert!(RequestKind::ReadPixels.touches_hardware());
    }

    #[test]
    fn test_request_field_order_irrelevant() {
        let a: Request = serde_json::from_str(
            r#"{"type":"end-readout","parameters":{"sub_device":"imaging"}}"#,
        )
        .unwrap();
        let b: Request = serde_json::from_str(
            r#"{"parameters":{"sub_device":"imaging"},"type":"end-readout"}"#,
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.request_kind().unwrap(), RequestKind::EndReadout);
        let params: SubDeviceParams = a.params().unwrap();
        assert_eq!(params.sub_device, SubDevice::Imaging);
    }

    #[test]
    fn test_missing_parameters_use_defaults() {
        let req: Request = serde_json::from_str(r#"{"type":"connect"}"#).unwrap();
        assert_eq!(req.parameters, Value::Null);
        let params: ConnectParams = req.params().unwrap();
        assert_eq!(params.target(), None);
    }

    #[test]
    fn test_missing_required_parameter_is_error() {
        let req = Request::simple(RequestKind::EndReadout);
        assert!(matches!(
            req.params::<SubDeviceParams>(),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_passthrough_requires_code() {
        let req: Request = serde_json::from_str(r#"{"type":"command"}"#).unwrap();
        assert!(matches!(
            req.command_code(),
            Err(ProtocolError::MissingCommandCode(_))
        ));

        let req = Request::passthrough(CommandCode::QUERY_COMMAND_STATUS, Value::Null);
        assert_eq!(
            req.command_code().unwrap(),
            CommandCode::QUERY_COMMAND_STATUS
        );
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""command":12"#));
    }

    #[test]
    fn test_response_error_field_omitted_on_success() {
        let json = serde_json::to_string(&Response::ok(Value::Bool(true))).unwrap();
        assert_eq!(json, r#"{"payload":true}"#);

        let json = serde_json::to_string(&Response::error("Device not connected")).unwrap();
        assert!(json.contains(r#""error":"Device not connected""#));
    }

    #[test]
    fn test_response_payload_as() {
        let resp = Response::ok(Value::Bool(false));
        assert!(!resp.payload_as::<bool>().unwrap());
        assert!(!resp.is_error());
    }
}
