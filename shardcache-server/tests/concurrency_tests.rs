// Concurrency Tests
// Parallel writers, readers, maintenance and resize on one engine

use shardcache_server::core::types::now_ms;
use shardcache_server::core::{
    BytesFactory, CacheEngine, EngineConfig, MaintenanceRequest, ValueConfig, ValueFactory,
};
use shardcache_server::NoopObserver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn shared_engine(config: EngineConfig) -> Arc<CacheEngine> {
    let factory: Arc<dyn ValueFactory> = Arc::new(BytesFactory::new(ValueConfig::default()));
    Arc::new(CacheEngine::new("concurrent", &config, Some(factory), Arc::new(NoopObserver)).unwrap())
}

#[test]
fn test_parallel_writers_distinct_keys() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;
    let engine = shared_engine(EngineConfig::default());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = engine.clone();
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let key = format!("t{t}:k{i}");
                    engine.write_only(key.as_bytes(), Some(key.as_bytes())).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.get_item_count(), (THREADS * PER_THREAD) as u64);
    let key = format!("t3:k{}", PER_THREAD - 1);
    assert_eq!(
        engine.read_only(key.as_bytes(), &[]).unwrap(),
        Some(key.into_bytes())
    );
}

#[test]
fn test_same_key_first_access_creates_one_slot() {
    const THREADS: usize = 16;
    let engine = shared_engine(EngineConfig::default());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine
                    .write_only(b"hot", Some(format!("writer-{t}").as_bytes()))
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.get_item_count(), 1);
    let value = engine.read_only(b"hot", &[]).unwrap().unwrap();
    assert!(String::from_utf8(value).unwrap().starts_with("writer-"));
}

#[test]
fn test_sweeps_racing_first_writes_expire_nothing() {
    const WRITERS: usize = 4;
    let engine = shared_engine(EngineConfig {
        buckets: 2,
        bins_per_bucket: 2,
        ..Default::default()
    });
    let stop = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..WRITERS)
        .map(|t| {
            let engine = engine.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut round = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    let key = format!("fresh-{t}-{round}");
                    engine.write_only(key.as_bytes(), Some(b"v")).unwrap();
                    engine.write_only(key.as_bytes(), None).unwrap();
                    round += 1;
                }
            })
        })
        .collect();

    let sweeper = {
        let engine = engine.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut removed = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let response = engine.do_maintenance(&MaintenanceRequest::new(now_ms(), 100, true));
                removed += response.expired + response.evicted;
            }
            removed
        })
    };

    thread::sleep(std::time::Duration::from_millis(500));
    stop.store(true, Ordering::Relaxed);
    for writer in writers {
        writer.join().unwrap();
    }

    // nothing aged, so no sweep may claim a removal
    assert_eq!(sweeper.join().unwrap(), 0);
    assert_eq!(engine.get_item_count(), 0);
}

#[test]
fn test_traffic_during_maintenance_and_resize() {
    const WRITERS: usize = 4;
    const KEYS: usize = 200;
    let engine = shared_engine(EngineConfig {
        buckets: 4,
        bins_per_bucket: 2,
        ..Default::default()
    });
    let stop = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..WRITERS)
        .map(|t| {
            let engine = engine.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut round = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    let key = format!("w{t}:{}", round % KEYS);
                    if round % 7 == 0 {
                        engine.write_only(key.as_bytes(), None).unwrap();
                    } else {
                        engine.write_only(key.as_bytes(), Some(b"v")).unwrap();
                        engine.read_only(key.as_bytes(), &[]).unwrap();
                    }
                    round += 1;
                }
            })
        })
        .collect();

    let sweeper = {
        let engine = engine.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                engine.do_maintenance(&MaintenanceRequest::new(now_ms(), 100, true));
            }
        })
    };

    for (buckets, bins) in [(16, 4), (3, 3), (64, 1), (8, 8)] {
        thread::sleep(std::time::Duration::from_millis(20));
        engine.resize(buckets, bins).unwrap();
    }
    stop.store(true, Ordering::Relaxed);

    for writer in writers {
        writer.join().unwrap();
    }
    sweeper.join().unwrap();

    // every key ends in a known state: rewrite all and count
    for t in 0..WRITERS {
        for i in 0..KEYS {
            engine
                .write_only(format!("w{t}:{i}").as_bytes(), Some(b"final"))
                .unwrap();
        }
    }
    assert_eq!(engine.get_item_count(), (WRITERS * KEYS) as u64);
    assert_eq!(engine.stats().bucket_count, 8);
}
