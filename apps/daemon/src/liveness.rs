//! 连接活跃度监控
//!
//! **App Start Relative Time Pattern**：时间戳以进程启动为锚点的单调微秒数，
//! 存放在 `AtomicU64` 中，读线程刷新、看门狗线程检查，无需加锁。

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

static APP_START: OnceLock<Instant> = OnceLock::new();

fn monotonic_micros() -> u64 {
    let start = APP_START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

/// 单个连接的活跃度
pub struct LivenessMonitor {
    last_activity: AtomicU64,
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_activity: AtomicU64::new(monotonic_micros()),
            timeout,
        }
    }

    /// 收到入站数据
    pub fn touch(&self) {
        self.last_activity
            .store(monotonic_micros(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last_us = self.last_activity.load(Ordering::Relaxed);
        Duration::from_micros(monotonic_micros().saturating_sub(last_us))
    }

    pub fn is_alive(&self) -> bool {
        self.idle_for() < self.timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// 看门狗线程
///
/// 每个检查周期醒来一次；连接超时则调用 `on_expire`（通常是关闭 socket）后退出。
/// 丢弃 `Watchdog` 即停止线程。
pub struct Watchdog {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    pub fn spawn<F>(
        name: String,
        monitor: Arc<LivenessMonitor>,
        check_interval: Duration,
        on_expire: F,
    ) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);

        let handle = thread::Builder::new().name(name).spawn(move || {
            loop {
                match stop_rx.recv_timeout(check_interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !monitor.is_alive() {
                            warn!(
                                "No inbound data for {:?} (limit {:?}), closing connection",
                                monitor.idle_for(),
                                monitor.timeout()
                            );
                            fired_clone.store(true, Ordering::SeqCst);
                            on_expire();
                            return;
                        }
                    },
                    // 显式停止或发送端被丢弃
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!("Watchdog stopped");
                        return;
                    },
                }
            }
        })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            fired,
        })
    }

    /// 是否因超时触发过
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
