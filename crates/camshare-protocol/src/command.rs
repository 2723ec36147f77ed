//! 命令目录与参数/结果结构体
//!
//! 请求信封中的 `parameters` 与响应中的 `payload` 按命令类型取下列形状。
//! 硬件透传命令使用 [`CommandCode`] 数字命令码。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ============================================================================
// 硬件命令码
// ============================================================================

/// 硬件命令码（透传给绑定层）
///
/// 数值与相机厂商驱动的命令编号保持一致，仅对守护进程自身会用到的命令给出常量。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandCode(pub u16);

impl CommandCode {
    pub const START_EXPOSURE: Self = Self(1);
    pub const END_EXPOSURE: Self = Self(2);
    pub const SET_TEMPERATURE_REGULATION: Self = Self(5);
    pub const QUERY_TEMPERATURE_STATUS: Self = Self(6);
    pub const GET_DRIVER_INFO: Self = Self(10);
    pub const GET_CCD_INFO: Self = Self(11);
    pub const QUERY_COMMAND_STATUS: Self = Self(12);
    pub const END_READOUT: Self = Self(25);
    pub const START_READOUT: Self = Self(35);
    pub const FILTER_WHEEL: Self = Self(43);

    /// 已知命令的名称（用于日志）
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::START_EXPOSURE => Some("START_EXPOSURE"),
            Self::END_EXPOSURE => Some("END_EXPOSURE"),
            Self::SET_TEMPERATURE_REGULATION => Some("SET_TEMPERATURE_REGULATION"),
            Self::QUERY_TEMPERATURE_STATUS => Some("QUERY_TEMPERATURE_STATUS"),
            Self::GET_DRIVER_INFO => Some("GET_DRIVER_INFO"),
            Self::GET_CCD_INFO => Some("GET_CCD_INFO"),
            Self::QUERY_COMMAND_STATUS => Some("QUERY_COMMAND_STATUS"),
            Self::END_READOUT => Some("END_READOUT"),
            Self::START_READOUT => Some("START_READOUT"),
            Self::FILTER_WHEEL => Some("FILTER_WHEEL"),
            _ => None,
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "CMD({})", self.0),
        }
    }
}

// ============================================================================
// 子设备
// ============================================================================

/// 可独立曝光的成像通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubDevice {
    /// 主成像传感器
    Imaging,
    /// 跟踪/导星传感器
    Tracking,
}

impl SubDevice {
    pub const ALL: [SubDevice; 2] = [SubDevice::Imaging, SubDevice::Tracking];

    /// 数组下标（曝光记录表使用）
    pub fn index(self) -> usize {
        match self {
            SubDevice::Imaging => 0,
            SubDevice::Tracking => 1,
        }
    }
}

impl fmt::Display for SubDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubDevice::Imaging => write!(f, "imaging"),
            SubDevice::Tracking => write!(f, "tracking"),
        }
    }
}

/// 只携带子设备的参数（abort / end-readout / exposure-in-progress）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubDeviceParams {
    pub sub_device: SubDevice,
}

// ============================================================================
// 连接
// ============================================================================

/// `connect` 参数：以太网相机的 IP，USB 相机留空
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub address: String,
}

impl ConnectParams {
    /// 空字符串视为“自动选择第一台设备”
    pub fn target(&self) -> Option<&str> {
        let trimmed = self.address.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

// ============================================================================
// 曝光
// ============================================================================

/// 快门模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutterMode {
    /// 亮场（快门打开）
    #[default]
    Open,
    /// 暗场（快门关闭）
    Closed,
}

/// `start-exposure` 参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StartExposureParams {
    pub sub_device: SubDevice,
    /// 请求的曝光时长（秒）
    pub duration_secs: f64,
    #[serde(default)]
    pub shutter: ShutterMode,
}

impl StartExposureParams {
    /// 转换为 `Duration`；负数、NaN、无穷大返回 `None`
    pub fn duration(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.duration_secs).ok()
    }
}

/// `read-pixels` 参数：读出区域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadoutRegion {
    pub sub_device: SubDevice,
    #[serde(default)]
    pub left: u32,
    #[serde(default)]
    pub top: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_binning")]
    pub binning: u8,
}

fn default_binning() -> u8 {
    1
}

impl ReadoutRegion {
    /// 全幅读出
    pub fn full(sub_device: SubDevice, width: u32, height: u32) -> Self {
        Self {
            sub_device,
            left: 0,
            top: 0,
            width,
            height,
            binning: 1,
        }
    }

    /// 样本数（width × height）
    pub fn sample_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

// ============================================================================
// 温控
// ============================================================================

/// `query-temperature` 结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureStatus {
    pub regulation_enabled: bool,
    pub setpoint_c: f64,
    pub sensor_c: f64,
    pub ambient_c: f64,
    /// 制冷功率（0-100）
    pub cooler_power_pct: f64,
}

/// `set-temperature` 参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRegulation {
    pub enabled: bool,
    #[serde(default)]
    pub setpoint_c: f64,
}

// ============================================================================
// 设备信息
// ============================================================================

/// `get-device-info` 请求的信息类别
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoRequest {
    /// 传感器几何与色彩信息（[`DeviceInfo`]）
    #[default]
    Sensor,
    /// 驱动版本信息（[`DriverInfo`]）
    Driver,
}

/// `get-device-info` 参数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfoParams {
    #[serde(default)]
    pub request: InfoRequest,
}

/// 单个传感器的几何信息
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorInfo {
    pub width: u32,
    pub height: u32,
    pub pixel_width_um: f64,
    pub pixel_height_um: f64,
    pub bit_depth: u8,
}

/// 彩色滤镜阵列
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorFilter {
    #[default]
    Mono,
    Rggb,
    Grbg,
    Gbrg,
    Bggr,
}

impl ColorFilter {
    pub fn is_color(self) -> bool {
        !matches!(self, ColorFilter::Mono)
    }
}

/// 传感器信息（`request = sensor`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub serial: String,
    pub firmware_version: u16,
    pub imaging: SensorInfo,
    pub tracking: Option<SensorInfo>,
    #[serde(default)]
    pub cfa: ColorFilter,
    /// 读出时对角样本位置互换（部分彩色机型固件行为）
    #[serde(default)]
    pub cfa_readout_swapped: bool,
    pub filter_wheel_slots: Option<u8>,
}

impl DeviceInfo {
    /// 是否需要在客户端做 2×2 对角样本互换
    ///
    /// 条件：彩色传感器 且 设备报告了读出互换标志。
    pub fn requires_bayer_swap(&self) -> bool {
        self.cfa.is_color() && self.cfa_readout_swapped
    }

    /// 指定子设备的几何信息
    pub fn sensor(&self, sub_device: SubDevice) -> Option<&SensorInfo> {
        match sub_device {
            SubDevice::Imaging => Some(&self.imaging),
            SubDevice::Tracking => self.tracking.as_ref(),
        }
    }
}

/// 驱动信息（`request = driver`）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub name: String,
    pub version: String,
}

// ============================================================================
// 滤镜轮
// ============================================================================

/// `filter-wheel` 参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FilterWheelCommand {
    /// 查询当前位置
    Query,
    /// 移动到指定槽位（从 1 开始）
    Goto { position: u8 },
}

/// `filter-wheel` 结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterWheelStatus {
    pub slots: u8,
    /// 当前槽位；移动中或未知时为 `None`
    pub position: Option<u8>,
    pub moving: bool,
}

// ============================================================================
// 服务状态
// ============================================================================

/// `status` 结果（守护进程自身状态）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub ref_count: usize,
    pub hardware_open: bool,
    pub active_connections: u64,
    pub connections_accepted: u64,
    pub requests_handled: u64,
    pub request_errors: u64,
    pub uptime_secs: u64,
}
