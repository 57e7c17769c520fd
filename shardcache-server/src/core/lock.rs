use crate::metrics::CacheObserver;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// Reader-writer lock that reports contention to a [`CacheObserver`].
///
/// Acquisition first tries the lock without blocking; only when that fails is
/// the wait counted and the blocking acquire performed.
pub struct MeteredRwLock<T> {
    inner: RwLock<T>,
    observer: Arc<dyn CacheObserver>,
}

impl<T> MeteredRwLock<T> {
    pub fn new(value: T, observer: Arc<dyn CacheObserver>) -> Self {
        Self {
            inner: RwLock::new(value),
            observer,
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        if let Some(guard) = self.inner.try_read() {
            return guard;
        }
        self.observer.lock_contended(false);
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        if let Some(guard) = self.inner.try_write() {
            return guard;
        }
        self.observer.lock_contended(true);
        self.inner.write()
    }

    pub fn observer(&self) -> &Arc<dyn CacheObserver> {
        &self.observer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopObserver;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct WaitCounter {
        shared: AtomicU64,
        exclusive: AtomicU64,
    }

    impl CacheObserver for WaitCounter {
        fn item_count_delta(&self, _delta: i64) {}
        fn created(&self) {}
        fn written(&self) {}
        fn read(&self, _hit: bool) {}
        fn expired(&self, _count: u64) {}
        fn evicted(&self, _count: u64) {}
        fn flushed(&self, _count: u64) {}
        fn lock_contended(&self, exclusive: bool) {
            if exclusive {
                self.exclusive.fetch_add(1, Ordering::SeqCst);
            } else {
                self.shared.fetch_add(1, Ordering::SeqCst);
            }
        }
        fn fault(&self, _operation: &str) {}
    }

    #[test]
    fn test_uncontended_access_not_counted() {
        let counter = Arc::new(WaitCounter::default());
        let lock = MeteredRwLock::new(5u32, counter.clone());

        {
            let a = lock.read();
            let b = lock.read();
            assert_eq!(*a + *b, 10);
        }
        *lock.write() += 1;

        assert_eq!(*lock.read(), 6);
        assert_eq!(counter.shared.load(Ordering::SeqCst), 0);
        assert_eq!(counter.exclusive.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_contended_write_counted() {
        let counter = Arc::new(WaitCounter::default());
        let lock = Arc::new(MeteredRwLock::new(0u32, counter.clone()));

        let guard = lock.read();
        let writer = {
            let lock = lock.clone();
            thread::spawn(move || {
                *lock.write() += 1;
            })
        };
        thread::sleep(Duration::from_millis(50));
        drop(guard);
        writer.join().unwrap();

        assert_eq!(*lock.read(), 1);
        assert_eq!(counter.exclusive.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_noop_observer() {
        let lock = MeteredRwLock::new(vec![1, 2], Arc::new(NoopObserver));
        lock.write().push(3);
        assert_eq!(lock.read().len(), 3);
    }
}
