//! Sharded cache engine
//!
//! Keys route by fingerprint to a bucket (high hash bits) and then to a bin
//! inside it (low hash bits). Buckets are allocated on first use and handed
//! back when a sweep finds them empty.
//!
//! Lock order is slot, then bucket tree, then bin map. Code that already holds
//! a slot lock takes the tree with `read_recursive` so a queued resize cannot
//! wedge it.

use super::bin::Bin;
use super::bucket_index::{BucketIndex, BucketIndexInfo};
use super::error::{CacheError, Result};
use super::fingerprint::KeyFingerprint;
use super::maintenance::{MaintenanceRequest, MaintenanceResponse};
use super::pool::FingerprintPool;
use super::slot::{SlotWriteGuard, ValueSlot};
use super::types::{EngineConfig, EngineStats, Timestamp, now_ms};
use super::values::{CacheValue, ValueConfig, ValueFactory};
use crate::metrics::CacheObserver;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Upper bound on bins per bucket
pub const MAX_BINS_PER_BUCKET: usize = 1 << 16;

/// Upper bound on the initial slot capacity of one bin
pub const MAX_BIN_CAPACITY: usize = 1 << 20;

/// Upper bound on parked request fingerprints per engine
pub const MAX_FINGERPRINT_POOL: usize = 1 << 16;

struct Bucket {
    bins: Box<[Bin]>,
}

impl Bucket {
    fn new(bins_per_bucket: usize, bin_capacity: usize, observer: &Arc<dyn CacheObserver>) -> Self {
        Self {
            bins: (0..bins_per_bucket)
                .map(|_| Bin::new(bin_capacity, observer.clone()))
                .collect(),
        }
    }

    fn is_empty(&self) -> bool {
        self.bins.iter().all(Bin::is_empty)
    }
}

struct BucketTree {
    index: BucketIndex,
    buckets: Vec<Option<Bucket>>,
    bins_per_bucket: usize,
    bin_capacity: usize,
}

impl BucketTree {
    fn new(config: &EngineConfig) -> Result<Self> {
        validate_bins(config.bins_per_bucket)?;
        Ok(Self {
            index: BucketIndex::new(config.buckets)?,
            buckets: (0..config.buckets).map(|_| None).collect(),
            bins_per_bucket: config.bins_per_bucket,
            bin_capacity: config.bin_capacity,
        })
    }

    fn route(&self, fingerprint: &KeyFingerprint) -> (usize, usize) {
        (
            fingerprint.bucket_index() as usize % self.buckets.len(),
            fingerprint.bin_index() as usize % self.bins_per_bucket,
        )
    }

    fn bin(&self, fingerprint: &KeyFingerprint) -> Option<&Bin> {
        let (bucket, bin) = self.route(fingerprint);
        self.bin_at(bucket, bin)
    }

    fn bin_at(&self, bucket: usize, bin: usize) -> Option<&Bin> {
        self.buckets.get(bucket)?.as_ref()?.bins.get(bin)
    }

    fn activate(&mut self, bucket: usize, observer: &Arc<dyn CacheObserver>) {
        if self.buckets[bucket].is_none() {
            self.buckets[bucket] = Some(Bucket::new(
                self.bins_per_bucket,
                self.bin_capacity,
                observer,
            ));
            self.index.add(bucket);
        }
    }

    fn active_bins(&self) -> Vec<(usize, usize)> {
        self.index
            .iter_active()
            .flat_map(|bucket| (0..self.bins_per_bucket).map(move |bin| (bucket, bin)))
            .collect()
    }
}

fn validate_bins(bins_per_bucket: usize) -> Result<()> {
    if bins_per_bucket == 0 || bins_per_bucket > MAX_BINS_PER_BUCKET {
        return Err(CacheError::InvalidBinCount(bins_per_bucket));
    }
    Ok(())
}

fn validate_capacities(config: &EngineConfig) -> Result<()> {
    if config.bin_capacity > MAX_BIN_CAPACITY {
        return Err(CacheError::InvalidCapacity {
            setting: "bin_capacity".to_string(),
            value: config.bin_capacity,
        });
    }
    if config.fingerprint_pool > MAX_FINGERPRINT_POOL {
        return Err(CacheError::InvalidCapacity {
            setting: "fingerprint_pool".to_string(),
            value: config.fingerprint_pool,
        });
    }
    Ok(())
}

/// One named cache: a bucket tree of bins plus the factory of its value type
pub struct CacheEngine {
    name: String,
    tree: RwLock<BucketTree>,
    factory: RwLock<Option<Arc<dyn ValueFactory>>>,
    observer: Arc<dyn CacheObserver>,
    fingerprints: FingerprintPool,
    min_sweep_interval_ms: AtomicU64,
    last_sweep: AtomicU64,
    retained_bytes: AtomicUsize,
}

impl CacheEngine {
    pub fn new(
        name: impl Into<String>,
        config: &EngineConfig,
        factory: Option<Arc<dyn ValueFactory>>,
        observer: Arc<dyn CacheObserver>,
    ) -> Result<Self> {
        let name = name.into();
        validate_capacities(config)?;
        let tree = BucketTree::new(config)?;
        debug!(
            "Cache {} created with {} buckets x {} bins",
            name, config.buckets, config.bins_per_bucket
        );

        Ok(Self {
            name,
            tree: RwLock::new(tree),
            factory: RwLock::new(factory),
            observer,
            fingerprints: FingerprintPool::new(config.fingerprint_pool),
            min_sweep_interval_ms: AtomicU64::new(config.min_sweep_interval_ms),
            last_sweep: AtomicU64::new(0),
            retained_bytes: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn observer(&self) -> &Arc<dyn CacheObserver> {
        &self.observer
    }

    /// Current value factory
    pub fn factory(&self) -> Result<Arc<dyn ValueFactory>> {
        self.factory
            .read()
            .clone()
            .ok_or_else(|| CacheError::NoFactory(self.name.clone()))
    }

    /// Install `factory` for new slots without touching existing values
    pub fn set_factory(&self, factory: Option<Arc<dyn ValueFactory>>) {
        let previous = std::mem::replace(&mut *self.factory.write(), factory);
        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// Install `factory` and, when `upgrade` is set, rebuild every live value
    /// through it. Returns the number of values that could not be upgraded.
    pub fn replace_factory(&self, factory: Arc<dyn ValueFactory>, upgrade: bool) -> usize {
        let type_name = factory.type_name();
        self.set_factory(Some(factory.clone()));
        if !upgrade {
            return 0;
        }

        let faults = self.for_each_bin(|bin| bin.upgrade(factory.as_ref()));
        info!(
            "Cache {} upgraded to value type {} ({} faults)",
            self.name, type_name, faults
        );
        faults
    }

    pub fn set_min_sweep_interval(&self, interval_ms: u64) {
        self.min_sweep_interval_ms.store(interval_ms, Ordering::Relaxed);
    }

    fn create_value(
        &self,
        factory: &Arc<dyn ValueFactory>,
        fingerprint: &KeyFingerprint,
    ) -> Result<Box<dyn CacheValue>> {
        let created = panic::catch_unwind(AssertUnwindSafe(|| {
            factory.create_object_for_key(fingerprint)
        }));
        let failure = match created {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "value factory panicked".to_string(),
        };
        warn!("Cache {} could not create value: {}", self.name, failure);
        self.observer.fault("create_object");
        Err(CacheError::FactoryFailed {
            cache: self.name.clone(),
            message: failure,
        })
    }

    /// Existing slot for `fingerprint`, if its bucket is allocated
    fn lookup(&self, fingerprint: &KeyFingerprint) -> Result<Option<Arc<ValueSlot>>> {
        let tree = self.tree.read();
        match tree.bin(fingerprint) {
            Some(bin) => bin.get_entry(fingerprint, None),
            None => Ok(None),
        }
    }

    /// Slot for `fingerprint`, allocating its bucket and value when needed
    fn slot_for_write(
        &self,
        fingerprint: &KeyFingerprint,
        factory: &Arc<dyn ValueFactory>,
    ) -> Result<Arc<ValueSlot>> {
        let create = |fp: &KeyFingerprint| self.create_value(factory, fp);

        {
            let tree = self.tree.read();
            if let Some(bin) = tree.bin(fingerprint) {
                return created(bin.get_entry(fingerprint, Some(&create))?);
            }
        }

        let mut tree = self.tree.write();
        let (bucket, _) = tree.route(fingerprint);
        tree.activate(bucket, &self.observer);
        let tree = RwLockWriteGuard::downgrade(tree);
        let bin = tree
            .bin(fingerprint)
            .ok_or_else(|| CacheError::Internal(format!("bucket {bucket} not allocated")))?;
        created(bin.get_entry(fingerprint, Some(&create))?)
    }

    /// Drop a retired slot from its bin; the caller holds the slot write lock
    fn unlink(&self, slot: &Arc<ValueSlot>, guard: &mut SlotWriteGuard<'_>) {
        guard.retire();
        let tree = self.tree.read_recursive();
        if let Some(bin) = tree.bin(slot.fingerprint()) {
            bin.remove_slot(slot);
        }
    }

    /// Write `request` to the value of `key`, creating it on first use.
    ///
    /// `None` clears the value. On an absent key it is a lookup and creates
    /// nothing; on a present key the slot is removed once its value reports
    /// it can be deleted.
    pub fn write_only(&self, key: &[u8], request: Option<&[u8]>) -> Result<()> {
        let factory = self.factory()?;
        let fingerprint = self.fingerprints.acquire_for(key);

        let Some(request) = request else {
            return self.clear(&fingerprint);
        };

        loop {
            let slot = self.slot_for_write(&fingerprint, &factory)?;
            let mut guard = slot.write();
            if guard.is_retired() {
                // removed between lookup and lock
                continue;
            }
            if let Err(e) = guard.write_only(Some(request), now_ms()) {
                // drop a slot whose first write failed
                if guard.is_pending() {
                    self.unlink(&slot, &mut guard);
                }
                return Err(e);
            }
            self.observer.written();
            if guard.can_delete()? {
                self.unlink(&slot, &mut guard);
            }
            return Ok(());
        }
    }

    fn clear(&self, fingerprint: &KeyFingerprint) -> Result<()> {
        let Some(slot) = self.lookup(fingerprint)? else {
            return Ok(());
        };
        let mut guard = slot.write();
        if guard.is_retired() {
            return Ok(());
        }
        guard.write_only(None, now_ms())?;
        self.observer.written();
        if guard.can_delete()? {
            self.unlink(&slot, &mut guard);
        }
        Ok(())
    }

    /// Read the value of `key`; absent keys yield `None` and create nothing
    pub fn read_only(&self, key: &[u8], request: &[u8]) -> Result<Option<Vec<u8>>> {
        self.factory()?;
        let fingerprint = self.fingerprints.acquire_for(key);

        let response = match self.lookup(&fingerprint)? {
            Some(slot) => {
                let guard = slot.read();
                if guard.is_retired() {
                    None
                } else {
                    guard.read_only(request)?
                }
            }
            None => None,
        };
        self.observer.read(response.is_some());
        Ok(response)
    }

    /// Remove `key` regardless of what its value reports; true when it existed
    pub fn delete(&self, key: &[u8]) -> bool {
        let fingerprint = self.fingerprints.acquire_for(key);
        let tree = self.tree.read();
        tree.bin(&fingerprint)
            .is_some_and(|bin| bin.delete_entry(&fingerprint))
    }

    /// Expire every value written `duration_ms` or longer ago. Returns the
    /// number of slots removed.
    pub fn flush(&self, duration_ms: u64) -> u64 {
        let now = now_ms();
        let horizon: Timestamp = now.saturating_sub(duration_ms);
        let flushed = self.for_each_bin(|bin| bin.flush(now, horizon) as usize) as u64;

        self.observer.flushed(flushed);
        info!(
            "Cache {} flushed {} entries older than {}ms",
            self.name, flushed, duration_ms
        );
        flushed
    }

    pub fn get_item_count(&self) -> u64 {
        let tree = self.tree.read();
        tree.buckets
            .iter()
            .flatten()
            .flat_map(|bucket| bucket.bins.iter())
            .map(|bin| bin.get_item_count() as u64)
            .sum()
    }

    /// Sweep every active bin once. Non-forced sweeps within the minimum
    /// interval of the previous one are skipped.
    pub fn do_maintenance(&self, request: &MaintenanceRequest) -> MaintenanceResponse {
        let mut response = MaintenanceResponse::default();

        if request.forced {
            self.last_sweep.store(request.now, Ordering::Release);
        } else {
            let min_interval = self.min_sweep_interval_ms.load(Ordering::Relaxed);
            let last = self.last_sweep.load(Ordering::Acquire);
            let due = last == 0 || request.now >= last.saturating_add(min_interval);
            // only one of several concurrent sweeps may claim the interval
            if !due
                || self
                    .last_sweep
                    .compare_exchange(last, request.now, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                response.skipped = 1;
                return response;
            }
        }

        let started = Instant::now();
        let (buckets, bins_per_bucket) = {
            let tree = self.tree.read();
            (tree.index.iter_active().collect::<Vec<_>>(), tree.bins_per_bucket)
        };

        let mut emptied = Vec::new();
        for bucket in buckets {
            let mut bucket_empty = true;
            for bin_no in 0..bins_per_bucket {
                let tree = self.tree.read();
                if let Some(bin) = tree.bin_at(bucket, bin_no) {
                    bin.do_maintenance(request, &mut response);
                    bucket_empty &= bin.is_empty();
                }
            }
            if bucket_empty {
                emptied.push(bucket);
            }
        }

        response.buckets_released = self.release_buckets(&emptied);
        self.retained_bytes
            .store(response.retained_bytes, Ordering::Relaxed);

        debug!(
            "Cache {} swept {} slots in {:?} (expired={}, evicted={}, released buckets={})",
            self.name,
            response.scanned,
            started.elapsed(),
            response.expired,
            response.evicted,
            response.buckets_released
        );
        response
    }

    /// Free buckets still empty under the tree write lock
    fn release_buckets(&self, candidates: &[usize]) -> u64 {
        if candidates.is_empty() {
            return 0;
        }
        let mut tree = self.tree.write();
        let mut released = 0;
        for &bucket in candidates {
            let empty = tree
                .buckets
                .get(bucket)
                .and_then(Option::as_ref)
                .is_some_and(Bucket::is_empty);
            if empty {
                tree.buckets[bucket] = None;
                tree.index.remove(bucket);
                released += 1;
            }
        }
        released
    }

    /// Change the bucket tree shape and re-route every live slot.
    ///
    /// Both counts are validated before anything changes.
    pub fn resize(&self, bucket_count: usize, bins_per_bucket: usize) -> Result<()> {
        validate_bins(bins_per_bucket)?;
        let mut tree = self.tree.write();
        let mut index = tree.index.clone();
        index.resize(bucket_count)?;

        let slots: Vec<Arc<ValueSlot>> = tree
            .buckets
            .iter()
            .flatten()
            .flat_map(|bucket| bucket.bins.iter().flat_map(Bin::drain))
            .collect();

        let previous = (tree.buckets.len(), tree.bins_per_bucket);
        let bin_capacity = tree.bin_capacity;
        tree.bins_per_bucket = bins_per_bucket;
        tree.buckets = (0..bucket_count)
            .map(|bucket| {
                index
                    .get(bucket)
                    .then(|| Bucket::new(bins_per_bucket, bin_capacity, &self.observer))
            })
            .collect();
        tree.index.set(&index);

        let moved = slots.len();
        for slot in slots {
            let (bucket, bin) = tree.route(slot.fingerprint());
            tree.activate(bucket, &self.observer);
            if let Some(bin) = tree.bin_at(bucket, bin) {
                bin.adopt(slot);
            }
        }

        info!(
            "Cache {} resized from {}x{} to {}x{} ({} slots moved)",
            self.name, previous.0, previous.1, bucket_count, bins_per_bucket, moved
        );
        Ok(())
    }

    /// Push new value settings to the factory and every live value. Returns
    /// the number of values that faulted.
    pub fn update_configuration(&self, config: &ValueConfig) -> Result<usize> {
        let factory = self.factory()?;
        factory.update_configuration(config);
        Ok(self.for_each_bin(|bin| bin.update_configuration(config)))
    }

    /// Apply a new engine shape and sweep interval
    pub fn reconfigure(&self, config: &EngineConfig) -> Result<()> {
        let (buckets, bins) = {
            let tree = self.tree.read();
            (tree.buckets.len(), tree.bins_per_bucket)
        };
        if buckets != config.buckets || bins != config.bins_per_bucket {
            self.resize(config.buckets, config.bins_per_bucket)?;
        }
        self.set_min_sweep_interval(config.min_sweep_interval_ms);
        Ok(())
    }

    /// Run `f` on every allocated bin, taking the tree lock per bin
    fn for_each_bin(&self, mut f: impl FnMut(&Bin) -> usize) -> usize {
        let bins = self.tree.read().active_bins();
        let mut total = 0;
        for (bucket, bin_no) in bins {
            let tree = self.tree.read();
            if let Some(bin) = tree.bin_at(bucket, bin_no) {
                total += f(bin);
            }
        }
        total
    }

    /// Live bytes measured now, without a sweep
    pub fn memory_bytes(&self) -> usize {
        self.for_each_bin(Bin::memory_bytes)
    }

    pub fn bucket_index_info(&self) -> BucketIndexInfo {
        self.tree.read().index.info()
    }

    pub fn stats(&self) -> EngineStats {
        let (bucket_count, active_buckets, previous_bucket_count, bins_per_bucket) = {
            let tree = self.tree.read();
            (
                tree.buckets.len(),
                tree.index.get_count_active(),
                tree.index.previous_count(),
                tree.bins_per_bucket,
            )
        };
        EngineStats {
            item_count: self.get_item_count() as usize,
            bucket_count,
            active_buckets,
            previous_bucket_count,
            bins_per_bucket,
            retained_bytes: self.retained_bytes.load(Ordering::Relaxed),
        }
    }

    /// Release the factory; later reads and writes fail with `NoFactory`
    pub fn close(&self) {
        self.set_factory(None);
        debug!("Cache {} closed", self.name);
    }
}

fn created(slot: Option<Arc<ValueSlot>>) -> Result<Arc<ValueSlot>> {
    slot.ok_or_else(|| CacheError::Internal("slot lookup with factory returned nothing".into()))
}
