//! 设备会话：引用计数与硬件串行化
//!
//! 所有硬件调用都在同一把锁内完成，锁同时保护引用计数与设备句柄，
//! 因此"计数从 0 变 1 时打开设备"和"计数降到 0 时关闭设备"都是原子的。
//!
//! 不变量：
//! - 引用计数 > 0 当且仅当设备处于打开状态
//! - 任意时刻最多一个硬件调用在执行

use crate::binding::{CameraBinding, DeviceDescriptor};
use crate::error::{BindingError, DriverError};
use camshare_protocol::{CommandCode, PixelBuffer, ReadoutRegion};
use parking_lot::Mutex;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// 已打开设备的句柄
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub descriptor: DeviceDescriptor,
    pub opened_at: Instant,
}

impl DeviceHandle {
    pub fn uptime(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

/// 关闭设备的结果
///
/// 关闭失败不会阻止计数归零，只作为诊断信息返回。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownResult {
    Clean,
    Failed(String),
}

impl TeardownResult {
    fn from_close(result: Result<(), BindingError>) -> Self {
        match result {
            Ok(()) => TeardownResult::Clean,
            Err(e) => TeardownResult::Failed(e.to_string()),
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, TeardownResult::Clean)
    }
}

/// 释放一次引用的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// 计数本来就是 0，无操作
    NotHeld,
    /// 仍有其他持有者
    StillOpen { remaining: usize },
    /// 最后一个引用，设备已关闭
    Closed(TeardownResult),
}

impl ReleaseOutcome {
    /// 是否真正释放了一个引用
    pub fn released(&self) -> bool {
        !matches!(self, ReleaseOutcome::NotHeld)
    }
}

struct SessionState {
    binding: Box<dyn CameraBinding>,
    ref_count: usize,
    handle: Option<DeviceHandle>,
}

impl SessionState {
    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.ref_count == 0 {
            return Err(DriverError::NotConnected);
        }
        Ok(())
    }
}

/// 引用计数的设备会话
pub struct DeviceSession {
    state: Mutex<SessionState>,
}

impl DeviceSession {
    pub fn new(binding: impl CameraBinding + 'static) -> Self {
        Self::from_boxed(Box::new(binding))
    }

    pub fn from_boxed(binding: Box<dyn CameraBinding>) -> Self {
        Self {
            state: Mutex::new(SessionState {
                binding,
                ref_count: 0,
                handle: None,
            }),
        }
    }

    /// 获取一个引用
    ///
    /// 计数为 0 时枚举并打开设备；打开失败时计数保持 0。
    /// 返回 `true` 表示这次调用真正打开了硬件。
    pub fn open(&self, target: Option<&str>) -> Result<bool, DriverError> {
        let mut state = self.state.lock();

        if state.ref_count > 0 {
            state.ref_count += 1;
            if let (Some(target), Some(handle)) = (target, &state.handle) {
                if !handle.descriptor.matches(Some(target)) {
                    warn!(
                        "Connect target '{}' ignored: device {} is already open",
                        target, handle.descriptor.serial
                    );
                }
            }
            debug!("Device reference acquired (ref_count={})", state.ref_count);
            return Ok(false);
        }

        let devices = state.binding.enumerate()?;
        debug!(
            "Enumerated {} device(s) via {}",
            devices.len(),
            state.binding.name()
        );
        let descriptor = devices
            .into_iter()
            .find(|d| d.matches(target))
            .ok_or(DriverError::NoDevice)?;

        state.binding.open(&descriptor)?;
        info!(
            "Opened camera {} (serial {})",
            descriptor.name, descriptor.serial
        );
        state.handle = Some(DeviceHandle {
            descriptor,
            opened_at: Instant::now(),
        });
        state.ref_count = 1;
        Ok(true)
    }

    /// 释放一个引用
    ///
    /// 计数为 0 时无操作（不会变成负数）；降到 0 时关闭设备，关闭失败只记录日志。
    pub fn close(&self) -> ReleaseOutcome {
        let mut state = self.state.lock();

        if state.ref_count == 0 {
            debug!("Release ignored: device is not connected");
            return ReleaseOutcome::NotHeld;
        }

        state.ref_count -= 1;
        if state.ref_count > 0 {
            debug!("Device reference released (ref_count={})", state.ref_count);
            return ReleaseOutcome::StillOpen {
                remaining: state.ref_count,
            };
        }

        let handle = state.handle.take();
        let teardown = TeardownResult::from_close(state.binding.close());
        match (&teardown, handle) {
            (TeardownResult::Clean, Some(handle)) => info!(
                "Closed camera {} after {:?}",
                handle.descriptor.serial,
                handle.uptime()
            ),
            (TeardownResult::Clean, None) => info!("Closed camera"),
            (TeardownResult::Failed(reason), _) => {
                warn!("Camera close reported an error (ignored): {}", reason)
            },
        }
        ReleaseOutcome::Closed(teardown)
    }

    /// 执行一条硬件命令
    pub fn execute(&self, code: CommandCode, params: &Value) -> Result<Value, DriverError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        trace!("-> {}", code);
        state.binding.command(code, params).map_err(|e| {
            warn!("{} rejected by hardware: {}", code, e);
            DriverError::Hardware(e)
        })
    }

    /// 读出像素
    pub fn read_pixels(&self, region: &ReadoutRegion) -> Result<PixelBuffer, DriverError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        trace!(
            "-> readout {} {}x{}+{}+{}",
            region.sub_device, region.width, region.height, region.left, region.top
        );
        Ok(state.binding.read_pixels(region)?)
    }

    /// 在一次锁持有期间执行多步硬件操作
    ///
    /// 用于需要连续发送多条命令、中间不允许穿插其他请求的场景。
    pub fn transaction<R>(
        &self,
        f: impl FnOnce(&mut dyn CameraBinding) -> R,
    ) -> Result<R, DriverError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        Ok(f(state.binding.as_mut()))
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().ref_count > 0
    }

    pub fn ref_count(&self) -> usize {
        self.state.lock().ref_count
    }

    /// 当前打开的设备
    pub fn device(&self) -> Option<DeviceDescriptor> {
        self.state
            .lock()
            .handle
            .as_ref()
            .map(|handle| handle.descriptor.clone())
    }

    pub fn binding_name(&self) -> String {
        self.state.lock().binding.name().to_string()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.ref_count > 0 {
            warn!(
                "Session dropped with {} outstanding reference(s), closing camera",
                state.ref_count
            );
            state.ref_count = 0;
            state.handle = None;
            if let Err(e) = state.binding.close() {
                warn!("Camera close during shutdown failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedCamera, SimulatorConfig};
    use camshare_protocol::SubDevice;

    fn session() -> (DeviceSession, std::sync::Arc<crate::sim::SimProbe>) {
        let camera = SimulatedCamera::new(SimulatorConfig::default());
        let probe = camera.probe();
        (DeviceSession::new(camera), probe)
    }

    #[test]
    fn test_two_clients_share_one_open() {
        let (session, probe) = session();

        // A 连接
        assert!(session.open(None).unwrap());
        assert_eq!(session.ref_count(), 1);
        // B 连接：不重新打开
        assert!(!session.open(None).unwrap());
        assert_eq!(session.ref_count(), 2);
        assert_eq!(probe.open_count(), 1);

        // A 断开：B 仍可用
        assert_eq!(
            session.close(),
            ReleaseOutcome::StillOpen { remaining: 1 }
        );
        assert_eq!(probe.close_count(), 0);
        assert!(
            session
                .execute(CommandCode::QUERY_TEMPERATURE_STATUS, &Value::Null)
                .is_ok()
        );

        // B 断开：设备关闭
        assert_eq!(
            session.close(),
            ReleaseOutcome::Closed(TeardownResult::Clean)
        );
        assert_eq!(probe.close_count(), 1);
        assert!(!session.is_connected());
    }

    #[test]
    fn test_close_clamps_at_zero() {
        let (session, probe) = session();
        assert_eq!(session.close(), ReleaseOutcome::NotHeld);
        assert_eq!(session.ref_count(), 0);
        assert_eq!(probe.close_count(), 0);

        session.open(None).unwrap();
        session.close();
        assert_eq!(session.close(), ReleaseOutcome::NotHeld);
        assert_eq!(session.ref_count(), 0);
        assert_eq!(probe.close_count(), 1);
    }

    #[test]
    fn test_no_device_leaves_count_zero() {
        let (session, probe) = session();
        probe.set_present(false);

        assert!(matches!(session.open(None), Err(DriverError::NoDevice)));
        assert_eq!(session.ref_count(), 0);
        assert_eq!(probe.open_count(), 0);

        // 设备插上后可以正常连接
        probe.set_present(true);
        assert!(session.open(None).unwrap());
        assert_eq!(session.ref_count(), 1);
    }

    #[test]
    fn test_open_failure_leaves_count_zero() {
        let (session, probe) = session();
        probe.fail_next_open("USB claim failed");
        assert!(matches!(session.open(None), Err(DriverError::Hardware(_))));
        assert_eq!(session.ref_count(), 0);
        assert!(session.device().is_none());
    }

    #[test]
    fn test_unmatched_target_is_no_device() {
        let (session, _probe) = session();
        assert!(matches!(
            session.open(Some("10.9.9.9")),
            Err(DriverError::NoDevice)
        ));
        assert!(session.open(Some(SimulatorConfig::default().serial.as_str())).unwrap());
    }

    #[test]
    fn test_commands_require_connection() {
        let (session, probe) = session();
        assert!(matches!(
            session.execute(CommandCode::GET_CCD_INFO, &Value::Null),
            Err(DriverError::NotConnected)
        ));
        assert!(matches!(
            session.read_pixels(&ReadoutRegion::full(SubDevice::Imaging, 4, 4)),
            Err(DriverError::NotConnected)
        ));
        assert!(matches!(
            session.transaction(|_| ()),
            Err(DriverError::NotConnected)
        ));
        assert_eq!(probe.call_count("command"), 0);
    }

    #[test]
    fn test_teardown_failure_is_swallowed() {
        let (session, probe) = session();
        session.open(None).unwrap();
        probe.fail_next_close("device vanished");

        match session.close() {
            ReleaseOutcome::Closed(TeardownResult::Failed(reason)) => {
                assert!(reason.contains("device vanished"))
            },
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(session.ref_count(), 0);
        assert!(!session.is_connected());

        // 之后可以重新打开
        assert!(session.open(None).unwrap());
    }

    #[test]
    fn test_hardware_error_keeps_reference() {
        let (session, probe) = session();
        session.open(None).unwrap();
        probe.fail_command(CommandCode::QUERY_TEMPERATURE_STATUS, "bus stall");

        assert!(matches!(
            session.execute(CommandCode::QUERY_TEMPERATURE_STATUS, &Value::Null),
            Err(DriverError::Hardware(_))
        ));
        assert_eq!(session.ref_count(), 1);
    }

    #[test]
    fn test_drop_closes_outstanding_session() {
        let (session, probe) = session();
        session.open(None).unwrap();
        session.open(None).unwrap();
        drop(session);
        assert_eq!(probe.close_count(), 1);
    }
}
