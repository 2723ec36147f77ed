//! # camshare Daemon
//!
//! 在回环地址上监听客户端连接，把所有客户端的请求串行化到同一台相机。
//!
//! - [`Server`]：接受连接，每个连接一个 [`ConnectionHandler`] 线程
//! - [`Dispatcher`]：请求类型 → [`SharedCamera`](camshare_driver::SharedCamera) 调用
//! - [`LivenessMonitor`] / [`Watchdog`]：关闭长时间静默的连接

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod liveness;
pub mod logging;
pub mod server;
pub mod singleton;
pub mod stats;

pub use config::{DEFAULT_BIND_ADDR, DaemonConfig, default_lock_file, default_log_dir};
pub use dispatch::{ConnectionState, DispatchOutcome, Dispatcher};
pub use error::{DaemonError, RequestError};
pub use handler::{CloseReason, ConnectionHandler, HandlerConfig};
pub use liveness::{LivenessMonitor, Watchdog};
pub use server::{Server, ShutdownHandle};
pub use singleton::SingletonLock;
pub use stats::ServerStats;
