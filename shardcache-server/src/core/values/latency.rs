use super::{BytesValue, CacheValue, ValueConfig, ValueFactory};
use crate::core::error::{CacheError, Result};
use crate::core::types::{Retention, Timestamp, now_ms};
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

pub const TYPE_NAME: &str = "latency";

/// Reference value that behaves like [`BytesValue`] but blocks for a
/// configured time on every write and read
#[derive(Debug)]
pub struct LatencyValue {
    inner: BytesValue,
    write_latency: Duration,
    read_latency: Duration,
}

impl LatencyValue {
    pub fn new(config: &ValueConfig) -> Self {
        let (write_latency, read_latency) = latencies(config);
        Self {
            inner: BytesValue::new(config),
            write_latency,
            read_latency,
        }
    }

    pub fn inner(&self) -> &BytesValue {
        &self.inner
    }

    pub fn read_latency(&self) -> Duration {
        self.read_latency
    }
}

/// `latency_ms` for writes; reads use `read_latency_ms` when set
fn latencies(config: &ValueConfig) -> (Duration, Duration) {
    let write_ms = config.latency_ms;
    let read_ms = config.setting_or("read_latency_ms", write_ms);
    (
        Duration::from_millis(write_ms),
        Duration::from_millis(read_ms),
    )
}

fn pause(latency: Duration) {
    if !latency.is_zero() {
        thread::sleep(latency);
    }
}

impl CacheValue for LatencyValue {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn update_configuration(&mut self, config: &ValueConfig) {
        let (write_latency, read_latency) = latencies(config);
        self.write_latency = write_latency;
        self.read_latency = read_latency;
        self.inner.update_configuration(config);
    }

    fn flush(&mut self, now: Timestamp, flush_horizon: Timestamp) {
        self.inner.flush(now, flush_horizon);
    }

    fn do_maintenance(&mut self, now: Timestamp, memory_level_percent: u32) -> Result<Retention> {
        self.inner.do_maintenance(now, memory_level_percent)
    }

    fn can_delete(&self) -> bool {
        self.inner.can_delete()
    }

    fn size(&self) -> usize {
        self.inner.size() + 2 * std::mem::size_of::<Duration>()
    }

    fn write_only(&mut self, request: Option<&[u8]>) -> Result<()> {
        pause(self.write_latency);
        self.inner.store(request, now_ms());
        Ok(())
    }

    fn read_only(&self, _request: &[u8]) -> Result<Option<Vec<u8>>> {
        pause(self.read_latency);
        Ok(self.inner.load(now_ms()))
    }

    fn upgrade_from(&mut self, previous: &dyn CacheValue) {
        self.inner.upgrade_from(previous);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory for [`LatencyValue`]
pub struct LatencyFactory {
    config: RwLock<ValueConfig>,
    closed: AtomicBool,
}

impl LatencyFactory {
    pub fn new(config: ValueConfig) -> Self {
        Self {
            config: RwLock::new(config),
            closed: AtomicBool::new(false),
        }
    }
}

impl ValueFactory for LatencyFactory {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn create_object(&self) -> Result<Box<dyn CacheValue>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Internal(
                "latency factory is closed".to_string(),
            ));
        }
        Ok(Box::new(LatencyValue::new(&self.config.read())))
    }

    fn update_configuration(&self, config: &ValueConfig) {
        *self.config.write() = config.clone();
    }

    fn configuration(&self) -> ValueConfig {
        self.config.read().clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub(super) fn construct(config: &ValueConfig) -> Arc<dyn ValueFactory> {
    Arc::new(LatencyFactory::new(config.clone()))
}
