//! 模拟相机
//!
//! 不依赖厂商 SDK 的 [`CameraBinding`] 实现，用于开发、集成测试和无硬件环境下运行守护进程。
//! [`SimProbe`] 记录打开/关闭次数与每次硬件调用的进入/退出时间，并支持故障注入。

use crate::binding::{CameraBinding, DeviceDescriptor};
use crate::error::{BindingError, BindingErrorKind};
use camshare_protocol::{
    ColorFilter, CommandCode, DeviceInfo, DriverInfo, FilterWheelCommand, FilterWheelStatus,
    PixelBuffer, ReadoutRegion, SensorInfo, ShutterMode, StartExposureParams, SubDevice,
    SubDeviceParams, TemperatureRegulation, TemperatureStatus,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// 模拟器配置（守护进程配置文件的 `[simulator]` 段）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub name: String,
    pub serial: String,
    /// 以太网相机地址；`None` 模拟 USB 相机
    pub address: Option<String>,
    pub firmware_version: u16,
    pub imaging: SensorInfo,
    pub tracking: Option<SensorInfo>,
    pub cfa: ColorFilter,
    pub cfa_readout_swapped: bool,
    pub filter_wheel_slots: Option<u8>,
    pub ambient_c: f64,
    /// 每次硬件调用的模拟耗时
    pub command_latency_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            name: "Simulated Camera".to_string(),
            serial: "SIM-0001".to_string(),
            address: None,
            firmware_version: 100,
            imaging: SensorInfo {
                width: 1024,
                height: 768,
                pixel_width_um: 9.0,
                pixel_height_um: 9.0,
                bit_depth: 16,
            },
            tracking: Some(SensorInfo {
                width: 657,
                height: 495,
                pixel_width_um: 7.4,
                pixel_height_um: 7.4,
                bit_depth: 16,
            }),
            cfa: ColorFilter::Mono,
            cfa_readout_swapped: false,
            filter_wheel_slots: Some(5),
            ambient_c: 20.0,
            command_latency_ms: 0,
        }
    }
}

// ============================================================================
// 探针
// ============================================================================

/// 一次硬件调用的进入/退出时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRecord {
    pub op: &'static str,
    pub code: Option<CommandCode>,
    pub entered: Instant,
    pub exited: Instant,
}

impl CallRecord {
    /// 两次调用的执行区间是否重叠
    pub fn overlaps(&self, other: &CallRecord) -> bool {
        self.entered < other.exited && other.entered < self.exited
    }
}

#[derive(Debug, Default)]
struct Faults {
    open: Option<String>,
    close: Option<String>,
    commands: HashMap<CommandCode, String>,
}

/// 模拟器的观测与故障注入句柄
#[derive(Debug)]
pub struct SimProbe {
    present: AtomicBool,
    open_count: AtomicUsize,
    close_count: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<CallRecord>>,
    faults: Mutex<Faults>,
}

impl SimProbe {
    fn new() -> Self {
        Self {
            present: AtomicBool::new(true),
            open_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// 设备是否出现在枚举结果中
    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// 观测到的最大并发硬件调用数（串行化正确时恒为 1）
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    /// 指定命令码被调用的顺序
    pub fn command_log(&self) -> Vec<CommandCode> {
        self.calls.lock().iter().filter_map(|c| c.code).collect()
    }

    pub fn fail_next_open(&self, reason: impl Into<String>) {
        self.faults.lock().open = Some(reason.into());
    }

    pub fn fail_next_close(&self, reason: impl Into<String>) {
        self.faults.lock().close = Some(reason.into());
    }

    /// 让指定命令持续失败，直到 [`clear_faults`](Self::clear_faults)
    pub fn fail_command(&self, code: CommandCode, reason: impl Into<String>) {
        self.faults.lock().commands.insert(code, reason.into());
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    fn enter(&self, op: &'static str, code: Option<CommandCode>) -> CallGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        CallGuard {
            probe: self,
            op,
            code,
            entered: Instant::now(),
        }
    }
}

struct CallGuard<'a> {
    probe: &'a SimProbe,
    op: &'static str,
    code: Option<CommandCode>,
    entered: Instant,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let exited = Instant::now();
        self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.probe.calls.lock().push(CallRecord {
            op: self.op,
            code: self.code,
            entered: self.entered,
            exited,
        });
    }
}

// ============================================================================
// 模拟相机
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct SimExposure {
    started_at: Instant,
    duration: Duration,
    shutter: ShutterMode,
}

/// 模拟相机
pub struct SimulatedCamera {
    config: SimulatorConfig,
    probe: Arc<SimProbe>,
    open: Option<DeviceDescriptor>,
    regulation: TemperatureRegulation,
    wheel_position: u8,
    exposures: [Option<SimExposure>; 2],
    frames: u64,
}

impl SimulatedCamera {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            probe: Arc::new(SimProbe::new()),
            open: None,
            regulation: TemperatureRegulation {
                enabled: false,
                setpoint_c: 0.0,
            },
            wheel_position: 1,
            exposures: [None, None],
            frames: 0,
        }
    }

    pub fn probe(&self) -> Arc<SimProbe> {
        Arc::clone(&self.probe)
    }

    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            name: self.config.name.clone(),
            serial: self.config.serial.clone(),
            address: self.config.address.clone(),
        }
    }

    fn simulate_latency(&self) {
        if self.config.command_latency_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.command_latency_ms));
        }
    }

    fn ensure_open(&self) -> Result<(), BindingError> {
        if self.open.is_none() {
            return Err(BindingError::new(
                BindingErrorKind::Io,
                "link not established",
            ));
        }
        Ok(())
    }

    fn sensor(&self, sub_device: SubDevice) -> Result<SensorInfo, BindingError> {
        let sensor = match sub_device {
            SubDevice::Imaging => Some(self.config.imaging),
            SubDevice::Tracking => self.config.tracking,
        };
        sensor.ok_or_else(|| {
            BindingError::new(
                BindingErrorKind::Unsupported,
                format!("camera has no {} sensor", sub_device),
            )
        })
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.config.name.clone(),
            serial: self.config.serial.clone(),
            firmware_version: self.config.firmware_version,
            imaging: self.config.imaging,
            tracking: self.config.tracking,
            cfa: self.config.cfa,
            cfa_readout_swapped: self.config.cfa_readout_swapped,
            filter_wheel_slots: self.config.filter_wheel_slots,
        }
    }

    fn temperature(&self) -> TemperatureStatus {
        let ambient = self.config.ambient_c;
        let (sensor, power) = if self.regulation.enabled {
            // 制冷器最多比环境低 40°C
            let floor = ambient - 40.0;
            let sensor = self.regulation.setpoint_c.max(floor);
            let power = ((ambient - sensor) * 2.5).clamp(0.0, 100.0);
            (sensor, power)
        } else {
            (ambient, 0.0)
        };
        TemperatureStatus {
            regulation_enabled: self.regulation.enabled,
            setpoint_c: self.regulation.setpoint_c,
            sensor_c: sensor,
            ambient_c: ambient,
            cooler_power_pct: power,
        }
    }

    fn filter_wheel(&mut self, command: FilterWheelCommand) -> Result<FilterWheelStatus, BindingError> {
        let slots = self.config.filter_wheel_slots.ok_or_else(|| {
            BindingError::new(BindingErrorKind::Unsupported, "no filter wheel attached")
        })?;
        if let FilterWheelCommand::Goto { position } = command {
            if position == 0 || position > slots {
                return Err(BindingError::new(
                    BindingErrorKind::InvalidParameter,
                    format!("filter position {} out of range 1..={}", position, slots),
                ));
            }
            self.wheel_position = position;
        }
        Ok(FilterWheelStatus {
            slots,
            position: Some(self.wheel_position),
            moving: false,
        })
    }

    fn handle_command(&mut self, code: CommandCode, params: &Value) -> Result<Value, BindingError> {
        match code {
            CommandCode::START_EXPOSURE => {
                let p: StartExposureParams = parse_params(code, params)?;
                self.sensor(p.sub_device)?;
                let duration = p.duration().ok_or_else(|| {
                    BindingError::new(
                        BindingErrorKind::InvalidParameter,
                        format!("invalid exposure duration {}", p.duration_secs),
                    )
                })?;
                self.exposures[p.sub_device.index()] = Some(SimExposure {
                    started_at: Instant::now(),
                    duration,
                    shutter: p.shutter,
                });
                Ok(Value::Null)
            },
            CommandCode::END_EXPOSURE | CommandCode::END_READOUT => {
                let p: SubDeviceParams = parse_params(code, params)?;
                self.exposures[p.sub_device.index()] = None;
                Ok(Value::Null)
            },
            CommandCode::START_READOUT => {
                let region: ReadoutRegion = parse_params(code, params)?;
                self.validate_region(&region)?;
                Ok(Value::Null)
            },
            CommandCode::QUERY_TEMPERATURE_STATUS => to_reply(code, &self.temperature()),
            CommandCode::SET_TEMPERATURE_REGULATION => {
                self.regulation = parse_params(code, params)?;
                Ok(Value::Null)
            },
            CommandCode::GET_CCD_INFO => to_reply(code, &self.device_info()),
            CommandCode::GET_DRIVER_INFO => to_reply(
                code,
                &DriverInfo {
                    name: self.name().to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            ),
            CommandCode::QUERY_COMMAND_STATUS => {
                let now = Instant::now();
                let exposing = |sub: SubDevice| {
                    self.exposures[sub.index()]
                        .is_some_and(|e| now.saturating_duration_since(e.started_at) < e.duration)
                };
                Ok(json!({
                    "imaging_exposing": exposing(SubDevice::Imaging),
                    "tracking_exposing": exposing(SubDevice::Tracking),
                }))
            },
            CommandCode::FILTER_WHEEL => {
                let command: FilterWheelCommand = parse_params(code, params)?;
                let status = self.filter_wheel(command)?;
                to_reply(code, &status)
            },
            other => Err(BindingError::new(
                BindingErrorKind::Unsupported,
                format!("{} is not supported", other),
            )),
        }
    }

    fn validate_region(&self, region: &ReadoutRegion) -> Result<SensorInfo, BindingError> {
        let sensor = self.sensor(region.sub_device)?;
        if region.binning == 0 {
            return Err(BindingError::new(
                BindingErrorKind::InvalidParameter,
                "binning must be at least 1",
            ));
        }
        let bin = region.binning as u64;
        let max_w = sensor.width as u64 / bin;
        let max_h = sensor.height as u64 / bin;
        if region.left as u64 + region.width as u64 > max_w
            || region.top as u64 + region.height as u64 > max_h
        {
            return Err(BindingError::new(
                BindingErrorKind::InvalidParameter,
                format!(
                    "region {}x{}+{}+{} exceeds {} sensor {}x{} at bin {}",
                    region.width,
                    region.height,
                    region.left,
                    region.top,
                    region.sub_device,
                    max_w,
                    max_h,
                    region.binning
                ),
            ));
        }
        Ok(sensor)
    }

    fn synthesize(&mut self, region: &ReadoutRegion) -> PixelBuffer {
        self.frames += 1;
        let shutter = self.exposures[region.sub_device.index()]
            .map(|e| e.shutter)
            .unwrap_or_default();
        let mut rng = StdRng::seed_from_u64(self.frames);
        let noise: Vec<u16> = (0..region.sample_count())
            .map(|_| rng.gen_range(0..32u16))
            .collect();

        let (left, top, width) = (region.left, region.top, region.width);
        PixelBuffer::from_fn(region.width, region.height, |x, y| {
            let bias = 1000u16;
            let signal = match shutter {
                ShutterMode::Closed => 0,
                ShutterMode::Open => (((left + x) + (top + y)) % 4096) as u16,
            };
            let n = noise[y as usize * width as usize + x as usize];
            bias + signal + n
        })
    }
}

impl CameraBinding for SimulatedCamera {
    fn name(&self) -> &str {
        "simulator"
    }

    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>, BindingError> {
        let probe = Arc::clone(&self.probe);
        let _call = probe.enter("enumerate", None);
        self.simulate_latency();
        if probe.present.load(Ordering::SeqCst) {
            Ok(vec![self.descriptor()])
        } else {
            Ok(Vec::new())
        }
    }

    fn open(&mut self, device: &DeviceDescriptor) -> Result<(), BindingError> {
        let probe = Arc::clone(&self.probe);
        let _call = probe.enter("open", None);
        self.simulate_latency();

        if let Some(reason) = probe.faults.lock().open.take() {
            return Err(BindingError::new(BindingErrorKind::AccessDenied, reason));
        }
        if self.open.is_some() {
            return Err(BindingError::new(
                BindingErrorKind::Busy,
                "device is already open",
            ));
        }
        if device.serial != self.config.serial {
            return Err(BindingError::new(
                BindingErrorKind::NotFound,
                format!("unknown device {}", device.serial),
            ));
        }
        self.open = Some(device.clone());
        probe.open_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<(), BindingError> {
        let probe = Arc::clone(&self.probe);
        let _call = probe.enter("close", None);
        self.simulate_latency();

        // 无论是否报错，链路都已断开
        self.open = None;
        self.exposures = [None, None];
        probe.close_count.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = probe.faults.lock().close.take() {
            return Err(BindingError::new(BindingErrorKind::Io, reason));
        }
        Ok(())
    }

    fn command(&mut self, code: CommandCode, params: &Value) -> Result<Value, BindingError> {
        let probe = Arc::clone(&self.probe);
        let _call = probe.enter("command", Some(code));
        self.simulate_latency();
        self.ensure_open()?;

        if let Some(reason) = probe.faults.lock().commands.get(&code).cloned() {
            return Err(BindingError::command_failed(code, reason));
        }
        self.handle_command(code, params)
    }

    fn read_pixels(&mut self, region: &ReadoutRegion) -> Result<PixelBuffer, BindingError> {
        let probe = Arc::clone(&self.probe);
        let _call = probe.enter("read_pixels", None);
        self.simulate_latency();
        self.ensure_open()?;

        self.validate_region(region)?;
        if let Some(exposure) = self.exposures[region.sub_device.index()] {
            if exposure.started_at.elapsed() < exposure.duration {
                return Err(BindingError::new(
                    BindingErrorKind::Busy,
                    format!("{} exposure still integrating", region.sub_device),
                ));
            }
        }
        Ok(self.synthesize(region))
    }
}

fn parse_params<T: DeserializeOwned>(code: CommandCode, params: &Value) -> Result<T, BindingError> {
    let value = if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params.clone()
    };
    serde_json::from_value(value).map_err(|e| {
        BindingError::new(
            BindingErrorKind::InvalidParameter,
            format!("bad parameters for {}: {}", code, e),
        )
    })
}

fn to_reply<T: Serialize>(code: CommandCode, value: &T) -> Result<Value, BindingError> {
    serde_json::to_value(value).map_err(|e| BindingError::command_failed(code, e.to_string()))
}
