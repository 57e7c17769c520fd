// Cache Engine Tests
// End-to-end scenarios against a single engine: write/read/delete/flush,
// randomized bulk traffic, maintenance scaling and live resize

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shardcache_server::core::{
    BytesFactory, CacheEngine, EngineConfig, KeyFingerprint, MaintenanceRequest, ValueConfig,
    ValueFactory,
};
use shardcache_server::core::types::now_ms;
use shardcache_server::NoopObserver;
use std::sync::Arc;

fn engine(max_age_ms: u64) -> CacheEngine {
    let factory: Arc<dyn ValueFactory> = Arc::new(BytesFactory::new(ValueConfig {
        max_age_ms,
        ..Default::default()
    }));
    CacheEngine::new(
        "engine-tests",
        &EngineConfig::default(),
        Some(factory),
        Arc::new(NoopObserver),
    )
    .unwrap()
}

#[test]
fn test_reference_scenario() {
    let cache = engine(60_000);

    cache.write_only(b"K1", Some(b"V1")).unwrap();
    assert_eq!(cache.get_item_count(), 1);

    // clearing an absent key creates nothing
    cache.write_only(b"K2", None).unwrap();
    assert_eq!(cache.get_item_count(), 1);

    cache.write_only(b"K2", Some(b"V1")).unwrap();
    assert_eq!(cache.get_item_count(), 2);

    cache.write_only(b"K2", Some(b"V2")).unwrap();
    assert_eq!(cache.get_item_count(), 2);
    assert_eq!(cache.read_only(b"K2", &[]).unwrap(), Some(b"V2".to_vec()));

    cache.write_only(b"K2", None).unwrap();
    assert_eq!(cache.get_item_count(), 1);

    cache.flush(0);
    assert_eq!(cache.get_item_count(), 0);
    assert_eq!(cache.read_only(b"K1", &[]).unwrap(), None);
}

#[test]
fn test_bulk_random_put_delete() {
    let cache = engine(60_000);
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for i in 0..1000 {
        let key = format!("Key-{}", i % 100);
        if rng.gen_bool(0.5) {
            cache
                .write_only(key.as_bytes(), Some(format!("value-{i}").as_bytes()))
                .unwrap();
        } else {
            cache.write_only(key.as_bytes(), None).unwrap();
        }
    }

    for i in 0..100 {
        let key = format!("Key-{i}");
        cache.write_only(key.as_bytes(), Some(b"final")).unwrap();
    }
    assert_eq!(cache.get_item_count(), 100);

    for i in 0..100 {
        let key = format!("Key-{i}");
        cache.write_only(key.as_bytes(), None).unwrap();
    }
    assert_eq!(cache.get_item_count(), 0);
}

#[test]
fn test_round_trip_binary_keys_and_values() {
    let cache = engine(60_000);
    let key = [0u8, 255, 1, 254, 0];
    let value: Vec<u8> = (0..=255).collect();

    cache.write_only(&key, Some(value.as_slice())).unwrap();
    assert_eq!(cache.read_only(&key, &[]).unwrap(), Some(value));
    // a prefix of the key is a different key
    assert_eq!(cache.read_only(&key[..4], &[]).unwrap(), None);
}

#[test]
fn test_delete_is_idempotent() {
    let cache = engine(60_000);
    assert!(!cache.delete(b"missing"));
    assert!(!cache.delete(b"missing"));

    cache.write_only(b"present", Some(b"v")).unwrap();
    cache.write_only(b"other", Some(b"v")).unwrap();
    assert!(cache.delete(b"present"));
    assert_eq!(cache.get_item_count(), 1);
    assert!(!cache.delete(b"present"));
    assert_eq!(cache.get_item_count(), 1);
}

#[test]
fn test_maintenance_scaling() {
    let max_age = 10_000;
    let cache = engine(max_age);
    cache.write_only(b"aging", Some(b"v")).unwrap();
    let written = now_ms();

    // normal level: still alive past half age
    let response = cache.do_maintenance(&MaintenanceRequest::new(written + max_age / 2 + 100, 100, true));
    assert_eq!(response.expired + response.evicted, 0);
    assert_eq!(cache.get_item_count(), 1);

    // level 50: gone at half age, counted as eviction
    let response = cache.do_maintenance(&MaintenanceRequest::new(written + max_age / 2 + 100, 50, true));
    assert_eq!(response.evicted, 1);
    assert_eq!(cache.get_item_count(), 0);

    cache.write_only(b"aging", Some(b"v")).unwrap();
    let response = cache.do_maintenance(&MaintenanceRequest::new(now_ms() + max_age, 100, true));
    assert_eq!(response.expired, 1);
    assert_eq!(response.evicted, 0);
}

#[test]
fn test_flush_horizon_spares_recent_writes() {
    let cache = engine(60_000);
    cache.write_only(b"fresh", Some(b"v")).unwrap();

    // only values written an hour or more ago are flushed
    assert_eq!(cache.flush(3_600_000), 0);
    assert_eq!(cache.get_item_count(), 1);
    assert_eq!(cache.read_only(b"fresh", &[]).unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_resize_grow_and_shrink() {
    let cache = engine(60_000);
    for i in 0..500 {
        cache
            .write_only(format!("k{i}").as_bytes(), Some(i.to_string().as_bytes()))
            .unwrap();
    }

    for (buckets, bins) in [(128, 32), (1, 1), (7, 3)] {
        cache.resize(buckets, bins).unwrap();
        assert_eq!(cache.get_item_count(), 500);
        for i in (0..500).step_by(37) {
            assert_eq!(
                cache.read_only(format!("k{i}").as_bytes(), &[]).unwrap(),
                Some(i.to_string().into_bytes())
            );
        }
    }

    let stats = cache.stats();
    assert_eq!(stats.bucket_count, 7);
    assert_eq!(stats.bins_per_bucket, 3);
    assert_eq!(stats.previous_bucket_count, 1);
}

#[test]
fn test_routing_coordinates_are_distinct() {
    let long_key = "0123456789".repeat(11);
    for key in [
        b"Normal key".as_slice(),
        b"X".as_slice(),
        b"Key".as_slice(),
        long_key.as_bytes(),
    ] {
        let fp = KeyFingerprint::new(key);
        let coords = [fp.bucket_index(), fp.bin_index(), fp.map_slot()];
        assert!(coords.iter().all(|&c| c > 0), "{key:?} -> {coords:?}");
        assert_ne!(coords[0], coords[1]);
        assert_ne!(coords[1], coords[2]);
        assert_ne!(coords[0], coords[2]);
    }
}
