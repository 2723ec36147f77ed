//! # camshare Driver
//!
//! 共享相机的设备层：
//!
//! - [`DeviceSession`]：引用计数的打开/关闭与硬件调用串行化
//! - [`ExposureTracker`]：按时钟推算的曝光状态
//! - [`SharedCamera`]：两者组合后的高层接口
//! - [`CameraBinding`]：硬件绑定抽象，[`SimulatedCamera`] 为内置模拟实现

pub mod binding;
pub mod camera;
pub mod clock;
pub mod error;
pub mod exposure;
pub mod session;
pub mod sim;

pub use binding::{CameraBinding, DeviceDescriptor};
pub use camera::{DeviceInfoReply, SharedCamera};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BindingError, BindingErrorKind, DriverError};
pub use exposure::{ExposureRecord, ExposureState, ExposureTracker, is_exposing_at};
pub use session::{DeviceHandle, DeviceSession, ReleaseOutcome, TeardownResult};
pub use sim::{CallRecord, SimProbe, SimulatedCamera, SimulatorConfig};
