use super::error::{CacheError, Result};
use super::fingerprint::KeyFingerprint;
use super::lock::MeteredRwLock;
use super::types::{Retention, Timestamp};
use super::values::{CacheValue, ValueConfig};
use crate::metrics::CacheObserver;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// One cached value bound for life to its key.
///
/// The lock is created with the slot. A new slot stays pending until its
/// first write succeeds, and sweeps leave pending slots alone. A slot removed
/// from its bin is marked retired under the write lock; holders of a stale
/// handle must treat a retired slot as absent.
pub struct ValueSlot {
    fingerprint: KeyFingerprint,
    state: MeteredRwLock<SlotState>,
    last_modified: AtomicU64,
}

struct SlotState {
    value: Box<dyn CacheValue>,
    pending: bool,
    retired: bool,
}

impl ValueSlot {
    pub fn new(
        fingerprint: KeyFingerprint,
        value: Box<dyn CacheValue>,
        observer: Arc<dyn CacheObserver>,
        now: Timestamp,
    ) -> Self {
        Self {
            fingerprint,
            state: MeteredRwLock::new(
                SlotState {
                    value,
                    pending: true,
                    retired: false,
                },
                observer,
            ),
            last_modified: AtomicU64::new(now),
        }
    }

    pub fn fingerprint(&self) -> &KeyFingerprint {
        &self.fingerprint
    }

    pub fn last_modified(&self) -> Timestamp {
        self.last_modified.load(Ordering::Acquire)
    }

    pub fn read(&self) -> SlotReadGuard<'_> {
        SlotReadGuard {
            slot: self,
            state: self.state.read(),
        }
    }

    pub fn write(&self) -> SlotWriteGuard<'_> {
        SlotWriteGuard {
            slot: self,
            state: self.state.write(),
        }
    }

    fn guarded<R>(&self, operation: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let observer = self.state.observer();
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                observer.fault(operation);
                warn!(
                    "Value {} failed for key {:?}: {}",
                    operation, self.fingerprint, e
                );
                Err(e)
            }
            Err(payload) => {
                observer.fault(operation);
                let message = panic_message(payload.as_ref());
                warn!(
                    "Value {} panicked for key {:?}: {}",
                    operation, self.fingerprint, message
                );
                Err(CacheError::value_fault(operation, message))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "value type panicked".to_string()
    }
}

/// Shared access to a slot's value
pub struct SlotReadGuard<'a> {
    slot: &'a ValueSlot,
    state: RwLockReadGuard<'a, SlotState>,
}

impl SlotReadGuard<'_> {
    pub fn is_retired(&self) -> bool {
        self.state.retired
    }

    pub fn read_only(&self, request: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = &self.state.value;
        self.slot
            .guarded("read_only", || value.read_only(request))
    }

    pub fn size(&self) -> usize {
        self.state.value.size()
    }

    pub fn type_name(&self) -> &'static str {
        self.state.value.type_name()
    }
}

/// Exclusive access to a slot's value
pub struct SlotWriteGuard<'a> {
    slot: &'a ValueSlot,
    state: RwLockWriteGuard<'a, SlotState>,
}

impl SlotWriteGuard<'_> {
    pub fn is_retired(&self) -> bool {
        self.state.retired
    }

    /// No write has completed since the slot was created
    pub fn is_pending(&self) -> bool {
        self.state.pending
    }

    /// Mark the slot as removed from its bin
    pub fn retire(&mut self) {
        self.state.retired = true;
    }

    pub fn write_only(&mut self, request: Option<&[u8]>, now: Timestamp) -> Result<()> {
        let value = &mut self.state.value;
        self.slot
            .guarded("write_only", || value.write_only(request))?;
        self.state.pending = false;
        self.slot.last_modified.store(now, Ordering::Release);
        Ok(())
    }

    pub fn flush(&mut self, now: Timestamp, flush_horizon: Timestamp) -> Result<()> {
        let value = &mut self.state.value;
        self.slot.guarded("flush", || {
            value.flush(now, flush_horizon);
            Ok(())
        })
    }

    pub fn do_maintenance(&mut self, now: Timestamp, memory_level_percent: u32) -> Result<Retention> {
        let value = &mut self.state.value;
        self.slot.guarded("do_maintenance", || {
            value.do_maintenance(now, memory_level_percent)
        })
    }

    pub fn can_delete(&self) -> Result<bool> {
        let value = &self.state.value;
        self.slot.guarded("can_delete", || Ok(value.can_delete()))
    }

    pub fn size(&self) -> usize {
        self.state.value.size()
    }

    pub fn update_configuration(&mut self, config: &ValueConfig) -> Result<()> {
        let value = &mut self.state.value;
        self.slot.guarded("update_configuration", || {
            value.update_configuration(config);
            Ok(())
        })
    }

    /// Swap in `replacement` after letting it adopt the current value's state
    pub fn upgrade(&mut self, mut replacement: Box<dyn CacheValue>) -> Result<()> {
        let current = &self.state.value;
        self.slot.guarded("upgrade_from", || {
            replacement.upgrade_from(current.as_ref());
            Ok(())
        })?;
        self.state.value = replacement;
        Ok(())
    }
}
