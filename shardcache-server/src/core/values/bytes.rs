use super::{AgeTracker, CacheValue, LatencyValue, ValueConfig, ValueFactory};
use crate::core::error::{CacheError, Result};
use crate::core::types::{Retention, Timestamp, now_ms};
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const TYPE_NAME: &str = "bytes";

/// Raw byte pass-through with a time-to-live
#[derive(Debug)]
pub struct BytesValue {
    data: Option<Vec<u8>>,
    age: AgeTracker,
}

impl BytesValue {
    pub fn new(config: &ValueConfig) -> Self {
        Self {
            data: None,
            age: AgeTracker::new(now_ms(), config.max_age_ms),
        }
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn age_tracker(&self) -> &AgeTracker {
        &self.age
    }

    pub(crate) fn store(&mut self, request: Option<&[u8]>, now: Timestamp) {
        match request {
            Some(bytes) => {
                self.data = Some(bytes.to_vec());
                self.age.record_write(now);
            }
            None => self.data = None,
        }
    }

    pub(crate) fn load(&self, now: Timestamp) -> Option<Vec<u8>> {
        if self.age.is_stale(now) {
            return None;
        }
        let data = self.data.clone()?;
        self.age.record_read(now);
        Some(data)
    }

    fn adopt(&mut self, other: &BytesValue) {
        self.data = other.data.clone();
        self.age.copy_from(&other.age);
    }
}

impl CacheValue for BytesValue {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn update_configuration(&mut self, config: &ValueConfig) {
        self.age.set_max_age(config.max_age_ms);
    }

    fn flush(&mut self, _now: Timestamp, flush_horizon: Timestamp) {
        self.age.flush(flush_horizon);
    }

    fn do_maintenance(&mut self, now: Timestamp, memory_level_percent: u32) -> Result<Retention> {
        if self.data.is_none() {
            return Ok(Retention::Expired);
        }
        Ok(self.age.assess(now, memory_level_percent))
    }

    fn can_delete(&self) -> bool {
        self.data.is_none() || self.age.is_doomed()
    }

    fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.data.as_ref().map_or(0, Vec::capacity)
    }

    fn write_only(&mut self, request: Option<&[u8]>) -> Result<()> {
        self.store(request, now_ms());
        Ok(())
    }

    fn read_only(&self, _request: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.load(now_ms()))
    }

    fn upgrade_from(&mut self, previous: &dyn CacheValue) {
        if let Some(prev) = previous.as_any().downcast_ref::<BytesValue>() {
            self.adopt(prev);
        } else if let Some(prev) = previous.as_any().downcast_ref::<LatencyValue>() {
            self.adopt(prev.inner());
        } else if let Ok(Some(data)) = previous.read_only(&[]) {
            self.store(Some(&data), now_ms());
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory for [`BytesValue`]
pub struct BytesFactory {
    config: RwLock<ValueConfig>,
    closed: AtomicBool,
}

impl BytesFactory {
    pub fn new(config: ValueConfig) -> Self {
        Self {
            config: RwLock::new(config),
            closed: AtomicBool::new(false),
        }
    }
}

impl ValueFactory for BytesFactory {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn create_object(&self) -> Result<Box<dyn CacheValue>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Internal("bytes factory is closed".to_string()));
        }
        Ok(Box::new(BytesValue::new(&self.config.read())))
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
    Arc::new(BytesFactory::new(config.clone()))
}
