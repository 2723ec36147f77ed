//! # camshare 协议层
//!
//! 守护进程与客户端之间的线上格式：
//!
//! - [`envelope`]：请求/响应 JSON 信封
//! - [`framing`]：以固定终止序列分隔的帧
//! - [`command`]：命令目录、硬件命令码与各命令的参数/结果形状
//! - [`pixels`]：16 位像素缓冲的压缩传输与 bayer 对角互换

pub mod command;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod pixels;

pub use command::{
    ColorFilter, CommandCode, ConnectParams, DeviceInfo, DeviceInfoParams, DriverInfo,
    FilterWheelCommand, FilterWheelStatus, InfoRequest, ReadoutRegion, SensorInfo, ServiceStatus,
    ShutterMode, StartExposureParams, SubDevice, SubDeviceParams, TemperatureRegulation,
    TemperatureStatus,
};
pub use envelope::{Request, RequestKind, Response};
pub use error::ProtocolError;
pub use framing::{DEFAULT_MAX_FRAME_BYTES, FRAME_TERMINATOR, FrameDecoder, encode_frame};
pub use pixels::{CompressedPixels, PIXEL_ENCODING, PixelBuffer, swap_bayer_diagonal};
