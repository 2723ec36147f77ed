//! 曝光状态跟踪
//!
//! 记录每个子设备最近一次曝光的开始时间与时长，"是否仍在曝光"完全由时钟推算，
//! 不访问硬件（硬件的就绪标志不可靠）。
//!
//! 跟踪器使用独立的锁，查询不会排在硬件命令后面等待。

use crate::clock::Clock;
use camshare_protocol::SubDevice;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// 单次曝光记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureRecord {
    pub sub_device: SubDevice,
    pub started_at: Instant,
    pub duration: Duration,
}

impl ExposureRecord {
    /// `now` 时刻剩余的曝光时间
    pub fn remaining(&self, now: Instant) -> Duration {
        self.duration
            .saturating_sub(now.saturating_duration_since(self.started_at))
    }
}

/// 判定 `now` 时刻记录是否仍在曝光：`now < started_at + duration`
pub fn is_exposing_at(record: &ExposureRecord, now: Instant) -> bool {
    now.saturating_duration_since(record.started_at) < record.duration
}

/// 子设备的曝光阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureState {
    /// 没有记录
    Idle,
    /// 仍在积分
    Exposing { remaining: Duration },
    /// 积分时间已过，等待读出结束
    ReadoutPending,
}

/// 按子设备保存曝光记录
pub struct ExposureTracker {
    clock: Arc<dyn Clock>,
    records: Mutex<[Option<ExposureRecord>; 2]>,
}

impl ExposureTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: Mutex::new([None, None]),
        }
    }

    /// 记录一次新曝光（覆盖旧记录）
    pub fn start(&self, sub_device: SubDevice, duration: Duration) -> ExposureRecord {
        let record = ExposureRecord {
            sub_device,
            started_at: self.clock.now(),
            duration,
        };
        let previous = self.records.lock()[sub_device.index()].replace(record);
        if let Some(previous) = previous {
            debug!(
                "Exposure on {} replaced a previous record ({:?})",
                sub_device, previous.duration
            );
        }
        record
    }

    /// 当前时刻是否仍在曝光；无记录时为 `false`
    pub fn is_exposing(&self, sub_device: SubDevice) -> bool {
        let now = self.clock.now();
        self.record(sub_device)
            .is_some_and(|record| is_exposing_at(&record, now))
    }

    pub fn state(&self, sub_device: SubDevice) -> ExposureState {
        let now = self.clock.now();
        match self.record(sub_device) {
            None => ExposureState::Idle,
            Some(record) if is_exposing_at(&record, now) => ExposureState::Exposing {
                remaining: record.remaining(now),
            },
            Some(_) => ExposureState::ReadoutPending,
        }
    }

    pub fn record(&self, sub_device: SubDevice) -> Option<ExposureRecord> {
        self.records.lock()[sub_device.index()]
    }

    /// 读出结束，清除记录（幂等）
    pub fn end_readout(&self, sub_device: SubDevice) -> Option<ExposureRecord> {
        self.records.lock()[sub_device.index()].take()
    }

    /// 中止曝光，清除记录（幂等）
    pub fn abort(&self, sub_device: SubDevice) -> Option<ExposureRecord> {
        let removed = self.records.lock()[sub_device.index()].take();
        if let Some(record) = &removed {
            debug!(
                "Exposure on {} aborted with {:?} remaining",
                sub_device,
                record.remaining(self.clock.now())
            );
        }
        removed
    }
}
