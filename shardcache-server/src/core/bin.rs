use super::error::Result;
use super::fingerprint::KeyFingerprint;
use super::maintenance::{MaintenanceRequest, MaintenanceResponse};
use super::slot::ValueSlot;
use super::types::{Retention, Timestamp, now_ms};
use super::values::{CacheValue, ValueConfig, ValueFactory};
use crate::metrics::CacheObserver;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Builds the value for a key that is not yet present
pub type SlotFactory<'a> = &'a dyn Fn(&KeyFingerprint) -> Result<Box<dyn CacheValue>>;

/// Fine-grained shard holding key to slot mappings.
///
/// The map mutex is held only while the map itself is read or changed; value
/// access always goes through the slot's own lock. Sweeps lock and release one
/// slot at a time.
pub struct Bin {
    slots: Mutex<AHashMap<KeyFingerprint, Arc<ValueSlot>>>,
    capacity: usize,
    observer: Arc<dyn CacheObserver>,
}

impl Bin {
    pub fn new(capacity: usize, observer: Arc<dyn CacheObserver>) -> Self {
        Self {
            slots: Mutex::new(AHashMap::with_capacity(capacity)),
            capacity,
            observer,
        }
    }

    /// Return the slot for `fingerprint`, creating it through `factory` when
    /// absent. Without a factory this is a pure lookup.
    pub fn get_entry(
        &self,
        fingerprint: &KeyFingerprint,
        factory: Option<SlotFactory<'_>>,
    ) -> Result<Option<Arc<ValueSlot>>> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(fingerprint) {
            return Ok(Some(slot.clone()));
        }
        let Some(factory) = factory else {
            return Ok(None);
        };

        let value = factory(fingerprint)?;
        let owned = fingerprint.to_owned_copy();
        let slot = Arc::new(ValueSlot::new(
            owned.clone(),
            value,
            self.observer.clone(),
            now_ms(),
        ));
        slots.insert(owned, slot.clone());
        drop(slots);

        trace!("Created slot for {:?}", fingerprint);
        self.observer.created();
        self.observer.item_count_delta(1);
        Ok(Some(slot))
    }

    /// Retire the slot for `fingerprint` under its write lock, then unlink it
    pub fn delete_entry(&self, fingerprint: &KeyFingerprint) -> bool {
        let Some(slot) = self.slots.lock().get(fingerprint).cloned() else {
            return false;
        };
        let mut guard = slot.write();
        if guard.is_retired() {
            return false;
        }
        guard.retire();
        self.remove_slot(&slot)
    }

    /// Remove `slot` if it is still the mapping for its key. The caller holds
    /// the slot's write lock and has already retired it.
    pub(crate) fn remove_slot(&self, slot: &Arc<ValueSlot>) -> bool {
        let mut slots = self.slots.lock();
        let is_current = slots
            .get(slot.fingerprint())
            .is_some_and(|current| Arc::ptr_eq(current, slot));
        if !is_current {
            return false;
        }
        slots.remove(slot.fingerprint());
        drop(slots);
        self.observer.item_count_delta(-1);
        true
    }

    pub fn get_item_count(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn snapshot(&self) -> Vec<Arc<ValueSlot>> {
        self.slots.lock().values().cloned().collect()
    }

    /// Take every slot out without retiring them, for re-routing
    pub(crate) fn drain(&self) -> Vec<Arc<ValueSlot>> {
        self.slots.lock().drain().map(|(_, slot)| slot).collect()
    }

    /// Insert a slot moved from another bin
    pub(crate) fn adopt(&self, slot: Arc<ValueSlot>) {
        let key = slot.fingerprint().clone();
        self.slots.lock().insert(key, slot);
    }

    /// Run value maintenance on every slot and drop the ones that may go.
    /// Slots still waiting for their first write are skipped.
    pub fn do_maintenance(&self, request: &MaintenanceRequest, response: &mut MaintenanceResponse) {
        let mut expired = 0u64;
        let mut evicted = 0u64;

        for slot in self.snapshot() {
            let mut guard = slot.write();
            if guard.is_retired() || guard.is_pending() {
                continue;
            }
            response.scanned += 1;

            let verdict = match guard.do_maintenance(request.now, request.memory_level_percent) {
                Ok(verdict) => verdict,
                Err(_) => {
                    response.faults += 1;
                    continue;
                }
            };

            match guard.can_delete() {
                Ok(true) => {
                    guard.retire();
                    if self.remove_slot(&slot) {
                        match verdict {
                            Retention::Evicted => evicted += 1,
                            Retention::Expired | Retention::Keep => expired += 1,
                        }
                    }
                }
                Ok(false) => response.retained_bytes += guard.size(),
                Err(_) => response.faults += 1,
            }
        }

        response.expired += expired;
        response.evicted += evicted;
        if expired > 0 {
            self.observer.expired(expired);
        }
        if evicted > 0 {
            self.observer.evicted(evicted);
        }
    }

    /// Apply a flush horizon to every slot; returns how many were removed
    pub fn flush(&self, now: Timestamp, flush_horizon: Timestamp) -> u64 {
        let mut flushed = 0u64;
        for slot in self.snapshot() {
            let mut guard = slot.write();
            if guard.is_retired() || guard.is_pending() {
                continue;
            }
            if guard.flush(now, flush_horizon).is_err() {
                continue;
            }
            if matches!(guard.can_delete(), Ok(true)) {
                guard.retire();
                if self.remove_slot(&slot) {
                    flushed += 1;
                }
            }
        }
        flushed
    }

    /// Push new settings into every live value; returns the fault count
    pub fn update_configuration(&self, config: &ValueConfig) -> usize {
        self.snapshot()
            .iter()
            .filter(|slot| {
                let mut guard = slot.write();
                !guard.is_retired() && guard.update_configuration(config).is_err()
            })
            .count()
    }

    /// Rebuild every live value through `factory`; returns the fault count
    pub fn upgrade(&self, factory: &dyn ValueFactory) -> usize {
        let mut faults = 0;
        for slot in self.snapshot() {
            let mut guard = slot.write();
            if guard.is_retired() {
                continue;
            }
            let upgraded = factory
                .create_object_for_key(slot.fingerprint())
                .and_then(|replacement| guard.upgrade(replacement));
            if upgraded.is_err() {
                faults += 1;
            }
        }
        faults
    }

    /// Sum of value sizes of live slots
    pub fn memory_bytes(&self) -> usize {
        self.snapshot()
            .iter()
            .map(|slot| slot.read())
            .filter(|guard| !guard.is_retired())
            .map(|guard| guard.size())
            .sum()
    }
}
