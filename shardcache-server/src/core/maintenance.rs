//! Adaptive maintenance
//!
//! A sweep visits every active bucket and bin of an engine and lets each value
//! decide whether it has expired (full horizon) or must be evicted (horizon
//! scaled by `memory_level_percent / 100`). The level comes either from
//! configuration or from [`MemoryPressure`], which lowers it continuously as
//! retained bytes exceed the memory budget.

use super::registry::CacheRegistry;
use super::types::{Timestamp, now_ms};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Level at which values live for their full horizon
pub const NORMAL_MEMORY_LEVEL: u32 = 100;

/// Input of one sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceRequest {
    pub now: Timestamp,
    pub memory_level_percent: u32,
    /// Run even when the engine swept recently
    pub forced: bool,
}

impl MaintenanceRequest {
    pub fn new(now: Timestamp, memory_level_percent: u32, forced: bool) -> Self {
        Self {
            now,
            memory_level_percent,
            forced,
        }
    }

    /// Forced sweep at the current time and normal level
    pub fn forced_now() -> Self {
        Self::new(now_ms(), NORMAL_MEMORY_LEVEL, true)
    }
}

/// Totals accumulated by a sweep
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MaintenanceResponse {
    pub scanned: u64,
    pub expired: u64,
    pub evicted: u64,
    /// Slots whose value faulted; they were left in place
    pub faults: u64,
    /// Bytes held by the slots that survived
    pub retained_bytes: usize,
    /// Empty buckets handed back to the bucket index
    pub buckets_released: u64,
    /// Engines that skipped this sweep because of their minimum interval
    pub skipped: u64,
}

impl MaintenanceResponse {
    pub fn merge(&mut self, other: &MaintenanceResponse) {
        self.scanned += other.scanned;
        self.expired += other.expired;
        self.evicted += other.evicted;
        self.faults += other.faults;
        self.retained_bytes += other.retained_bytes;
        self.buckets_released += other.buckets_released;
        self.skipped += other.skipped;
    }

    pub fn removed(&self) -> u64 {
        self.expired + self.evicted
    }
}

/// Maps retained bytes against a budget to a memory level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPressure {
    max_memory_bytes: usize,
    min_level_percent: u32,
}

impl MemoryPressure {
    pub fn new(max_memory_bytes: usize, min_level_percent: u32) -> Self {
        Self {
            max_memory_bytes,
            min_level_percent: min_level_percent.min(NORMAL_MEMORY_LEVEL),
        }
    }

    /// `100` within budget, `100 * budget / used` above it, never below the floor
    pub fn level_percent(&self, used_bytes: usize) -> u32 {
        if self.max_memory_bytes == 0 || used_bytes <= self.max_memory_bytes {
            return NORMAL_MEMORY_LEVEL;
        }
        let level = (self.max_memory_bytes as u128 * u128::from(NORMAL_MEMORY_LEVEL)
            / used_bytes as u128) as u32;
        level.max(self.min_level_percent)
    }
}

/// Periodic sweep settings for [`spawn_maintenance`]
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceSchedule {
    pub interval: Duration,
    /// Fixed level; `None` derives it from [`MemoryPressure`]
    pub memory_level_percent: Option<u32>,
    pub pressure: MemoryPressure,
}

/// Start the background sweep over every cache in `registry`.
///
/// Each tick runs on the blocking pool; a tick that arrives while the previous
/// sweep is still running is skipped.
pub fn spawn_maintenance(
    registry: Arc<CacheRegistry>,
    schedule: MaintenanceSchedule,
) -> tokio::task::JoinHandle<()> {
    info!(
        "Starting maintenance task (interval={}ms, level={:?})",
        schedule.interval.as_millis(),
        schedule.memory_level_percent
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(schedule.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut retained_bytes = 0usize;

        loop {
            interval.tick().await;

            let level = schedule
                .memory_level_percent
                .unwrap_or_else(|| schedule.pressure.level_percent(retained_bytes));
            let request = MaintenanceRequest::new(now_ms(), level, false);

            let registry = registry.clone();
            match tokio::task::spawn_blocking(move || registry.do_maintenance(&request)).await {
                Ok(response) => {
                    retained_bytes = response.retained_bytes;
                    if response.removed() > 0 || response.faults > 0 {
                        debug!(
                            "Maintenance level={} scanned={} expired={} evicted={} faults={}",
                            level,
                            response.scanned,
                            response.expired,
                            response.evicted,
                            response.faults
                        );
                    }
                }
                Err(e) => warn!("Maintenance sweep aborted: {}", e),
            }
        }
    })
}
