//! 硬件绑定抽象
//!
//! 厂商 SDK 的封装（USB/串口事务）实现 [`CameraBinding`]。所有方法都是阻塞调用，
//! 不要求可重入：调用方（[`DeviceSession`](crate::DeviceSession)）保证同一时刻最多一个调用。

use crate::error::BindingError;
use camshare_protocol::{CommandCode, PixelBuffer, ReadoutRegion};
use serde_json::Value;

/// 枚举得到的设备描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub serial: String,
    /// 以太网相机的 IP；USB 相机为 `None`
    pub address: Option<String>,
}

impl DeviceDescriptor {
    /// 是否匹配 `connect` 给出的目标
    pub fn matches(&self, target: Option<&str>) -> bool {
        match target {
            None => true,
            Some(target) => self.address.as_deref() == Some(target) || self.serial == target,
        }
    }
}

/// 硬件绑定接口
pub trait CameraBinding: Send {
    /// 绑定名称（日志与驱动信息使用）
    fn name(&self) -> &str;

    /// 枚举已连接的设备
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>, BindingError>;

    /// 打开设备并建立链路
    fn open(&mut self, device: &DeviceDescriptor) -> Result<(), BindingError>;

    /// 关闭设备
    fn close(&mut self) -> Result<(), BindingError>;

    /// 发送一条命令，参数与结果为命令相关的 JSON 形状
    fn command(&mut self, code: CommandCode, params: &Value) -> Result<Value, BindingError>;

    /// 读出像素
    fn read_pixels(&mut self, region: &ReadoutRegion) -> Result<PixelBuffer, BindingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_matching() {
        let usb = DeviceDescriptor {
            name: "cam".to_string(),
            serial: "SN100".to_string(),
            address: None,
        };
        let eth = DeviceDescriptor {
            name: "cam".to_string(),
            serial: "SN200".to_string(),
            address: Some("10.0.0.5".to_string()),
        };

        assert!(usb.matches(None));
        assert!(usb.matches(Some("SN100")));
        assert!(!usb.matches(Some("10.0.0.5")));
        assert!(eth.matches(Some("10.0.0.5")));
        assert!(!eth.matches(Some("10.0.0.6")));
    }
}
