//! 守护进程统计

use camshare_driver::SharedCamera;
use camshare_protocol::ServiceStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// 连接与请求计数（无锁）
#[derive(Debug)]
pub struct ServerStats {
    started_at: Instant,
    connections_accepted: AtomicU64,
    active_connections: AtomicU64,
    requests_handled: AtomicU64,
    request_errors: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            connections_accepted: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            requests_handled: AtomicU64::new(0),
            request_errors: AtomicU64::new(0),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // 不会低于 0
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn request_handled(&self) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.request_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// 生成 `status` 响应
    pub fn snapshot(&self, camera: &SharedCamera) -> ServiceStatus {
        let ref_count = camera.ref_count();
        ServiceStatus {
            ref_count,
            hardware_open: ref_count > 0,
            active_connections: self.active_connections.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
            request_errors: self.request_errors.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camshare_driver::{SimulatedCamera, SimulatorConfig};

    #[test]
    fn test_connection_counters() {
        let stats = ServerStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        assert_eq!(stats.active_connections(), 1);

        // 多余的关闭不会下溢
        stats.connection_closed();
        stats.connection_closed();
        assert_eq!(stats.active_connections(), 0);
    }

    #[test]
    fn test_snapshot() {
        let stats = ServerStats::new();
        let camera = SharedCamera::new(SimulatedCamera::new(SimulatorConfig::default()));
        stats.connection_opened();
        stats.request_handled();
        stats.request_handled();
        stats.request_failed();

        let status = stats.snapshot(&camera);
        assert_eq!(status.ref_count, 0);
        assert!(!status.hardware_open);
        assert_eq!(status.connections_accepted, 1);
        assert_eq!(status.requests_handled, 2);
        assert_eq!(status.request_errors, 1);
    }
}
