//! 共享相机
//!
//! 把 [`DeviceSession`]（硬件串行化 + 引用计数）与 [`ExposureTracker`]（软件曝光计时）
//! 组合成守护进程使用的高层接口。

use crate::binding::CameraBinding;
use crate::clock::{Clock, SystemClock};
use crate::error::DriverError;
use crate::exposure::{ExposureState, ExposureTracker};
use crate::session::{DeviceSession, ReleaseOutcome};
use camshare_protocol::{
    CommandCode, ConnectParams, DeviceInfo, DriverInfo, FilterWheelCommand, FilterWheelStatus,
    InfoRequest, PixelBuffer, ReadoutRegion, StartExposureParams, SubDevice, SubDeviceParams,
    TemperatureRegulation, TemperatureStatus,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// `get-device-info` 的两种结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DeviceInfoReply {
    Sensor(DeviceInfo),
    Driver(DriverInfo),
}

/// 多客户端共享的相机
pub struct SharedCamera {
    session: DeviceSession,
    tracker: ExposureTracker,
}

impl SharedCamera {
    pub fn new(binding: impl CameraBinding + 'static) -> Self {
        Self::with_clock(binding, Arc::new(SystemClock))
    }

    pub fn with_clock(binding: impl CameraBinding + 'static, clock: Arc<dyn Clock>) -> Self {
        Self {
            session: DeviceSession::new(binding),
            tracker: ExposureTracker::new(clock),
        }
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn tracker(&self) -> &ExposureTracker {
        &self.tracker
    }

    /// 获取一个引用
    ///
    /// 返回 `Ok(true)` 表示调用方现在持有一个引用；没有找到相机时返回 `Ok(false)`，计数不变。
    pub fn connect(&self, params: &ConnectParams) -> Result<bool, DriverError> {
        match self.session.open(params.target()) {
            Ok(_) => Ok(true),
            Err(DriverError::NoDevice) => {
                warn!(
                    "Connect failed: no camera found{}",
                    params
                        .target()
                        .map(|t| format!(" at {}", t))
                        .unwrap_or_default()
                );
                Ok(false)
            },
            Err(e) => Err(e),
        }
    }

    /// 释放一个引用
    pub fn disconnect(&self) -> ReleaseOutcome {
        self.session.close()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn ref_count(&self) -> usize {
        self.session.ref_count()
    }

    /// 开始曝光：硬件接受后才记录开始时间
    pub fn start_exposure(&self, params: &StartExposureParams) -> Result<(), DriverError> {
        let duration = params.duration().ok_or_else(|| {
            DriverError::InvalidParameters(format!(
                "exposure duration must be a finite non-negative number, got {}",
                params.duration_secs
            ))
        })?;
        let value = to_params(params)?;
        // 曝光记录在硬件锁内写入
        self.session
            .transaction(|hw| {
                hw.command(CommandCode::START_EXPOSURE, &value)
                    .map(|_| self.tracker.start(params.sub_device, duration))
            })?
            .map_err(|e| {
                warn!("{} rejected by hardware: {}", CommandCode::START_EXPOSURE, e);
                DriverError::Hardware(e)
            })?;
        info!(
            "Exposure started on {} for {:?} ({:?} shutter)",
            params.sub_device, duration, params.shutter
        );
        Ok(())
    }

    /// 是否仍在曝光（只看时钟，不访问硬件）
    pub fn exposure_in_progress(&self, sub_device: SubDevice) -> bool {
        self.tracker.is_exposing(sub_device)
    }

    pub fn exposure_state(&self, sub_device: SubDevice) -> ExposureState {
        self.tracker.state(sub_device)
    }

    /// 结束读出；无论硬件是否报错都清除曝光记录
    pub fn end_readout(&self, sub_device: SubDevice) -> Result<(), DriverError> {
        let value = to_params(&SubDeviceParams { sub_device })?;
        let outcome = self.session.transaction(|hw| {
            let result = hw.command(CommandCode::END_READOUT, &value);
            self.tracker.end_readout(sub_device);
            result
        });
        match outcome {
            Ok(result) => result.map(|_| ()).map_err(DriverError::Hardware),
            Err(e) => {
                self.tracker.end_readout(sub_device);
                Err(e)
            },
        }
    }

    /// 中止曝光
    ///
    /// 在同一次硬件锁持有期间依次发送 END_EXPOSURE 与 END_READOUT，两条都会尝试；
    /// 曝光记录总是被清除，返回第一个错误。
    pub fn abort_exposure(&self, sub_device: SubDevice) -> Result<(), DriverError> {
        let value = to_params(&SubDeviceParams { sub_device })?;
        let outcome = self.session.transaction(|hw| {
            let end_exposure = hw.command(CommandCode::END_EXPOSURE, &value);
            let end_readout = hw.command(CommandCode::END_READOUT, &value);
            self.tracker.abort(sub_device);
            end_exposure.and(end_readout)
        });

        match outcome {
            Ok(Ok(_)) => {
                info!("Exposure on {} aborted", sub_device);
                Ok(())
            },
            Ok(Err(e)) => {
                warn!("Abort on {} reported a hardware error: {}", sub_device, e);
                Err(DriverError::Hardware(e))
            },
            Err(e) => {
                self.tracker.abort(sub_device);
                Err(e)
            },
        }
    }

    /// 读出像素
    pub fn read_pixels(&self, region: &ReadoutRegion) -> Result<PixelBuffer, DriverError> {
        let pixels = self.session.read_pixels(region)?;
        if pixels.width() != region.width || pixels.height() != region.height {
            return Err(DriverError::UnexpectedReply {
                code: CommandCode::START_READOUT,
                message: format!(
                    "requested {}x{}, got {}x{}",
                    region.width,
                    region.height,
                    pixels.width(),
                    pixels.height()
                ),
            });
        }
        Ok(pixels)
    }

    pub fn query_temperature(&self) -> Result<TemperatureStatus, DriverError> {
        self.execute_typed(CommandCode::QUERY_TEMPERATURE_STATUS, &Value::Null)
    }

    pub fn set_temperature(&self, regulation: &TemperatureRegulation) -> Result<(), DriverError> {
        let value = to_params(regulation)?;
        self.session
            .execute(CommandCode::SET_TEMPERATURE_REGULATION, &value)?;
        Ok(())
    }

    pub fn device_info(&self, request: InfoRequest) -> Result<DeviceInfoReply, DriverError> {
        match request {
            InfoRequest::Sensor => self
                .execute_typed(CommandCode::GET_CCD_INFO, &Value::Null)
                .map(DeviceInfoReply::Sensor),
            InfoRequest::Driver => self
                .execute_typed(CommandCode::GET_DRIVER_INFO, &Value::Null)
                .map(DeviceInfoReply::Driver),
        }
    }

    pub fn filter_wheel(&self, command: FilterWheelCommand) -> Result<FilterWheelStatus, DriverError> {
        let value = to_params(&command)?;
        self.execute_typed(CommandCode::FILTER_WHEEL, &value)
    }

    /// 硬件透传
    pub fn execute(&self, code: CommandCode, params: &Value) -> Result<Value, DriverError> {
        self.session.execute(code, params)
    }

    fn execute_typed<T: DeserializeOwned>(
        &self,
        code: CommandCode,
        params: &Value,
    ) -> Result<T, DriverError> {
        let reply = self.session.execute(code, params)?;
        serde_json::from_value(reply).map_err(|e| DriverError::UnexpectedReply {
            code,
            message: e.to_string(),
        })
    }
}

fn to_params<T: Serialize>(params: &T) -> Result<Value, DriverError> {
    serde_json::to_value(params).map_err(|e| DriverError::InvalidParameters(e.to_string()))
}
