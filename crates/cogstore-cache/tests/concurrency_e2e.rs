#![forbid(unsafe_code)]
//! The facade lock totally orders concurrent operations: mixed store and
//! retrieve traffic on distinct keys must terminate consistent, and racing
//! retrieves of one key must all see the same bytes.

use cogstore_cache::{Cache, CacheConfig};
use std::sync::Arc;
use std::thread;

const KIB: u64 = 1024;

#[test]
fn concurrent_traffic_on_distinct_keys_stays_consistent() {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = Arc::new(Cache::new(CacheConfig::new(KIB)).unwrap());
    cache.open(dir.path().join("cache.bin")).unwrap();

    let threads: Vec<_> = (0..4_u8)
        .map(|worker| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                let file = format!("/worker/{worker}");
                for index in 0..16_i64 {
                    let fill = worker.wrapping_mul(16).wrapping_add(index as u8);
                    cache.store(&file, index, &[fill; KIB as usize]).unwrap();
                }
                let mut out = vec![0_u8; KIB as usize];
                for index in 0..16_i64 {
                    let fill = worker.wrapping_mul(16).wrapping_add(index as u8);
                    assert!(cache.retrieve(&file, index, &mut out).unwrap());
                    assert_eq!(out, [fill; KIB as usize]);
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    assert_eq!(cache.lru_state().len(), 64);
    assert!(cache.free_blocks().is_empty());
    assert_eq!(cache.max_block(), 64);
    cache.close().unwrap();
}

#[test]
fn racing_retrieves_of_one_key_agree() {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = Arc::new(Cache::new(CacheConfig::new(KIB)).unwrap());
    cache.open(dir.path().join("cache.bin")).unwrap();

    let expected = vec![0xC7_u8; KIB as usize];
    cache.store("/shared", 0, &expected).unwrap();

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let expected = expected.clone();
            thread::spawn(move || {
                let mut out = vec![0_u8; KIB as usize];
                for _ in 0..32 {
                    assert!(cache.retrieve("/shared", 0, &mut out).unwrap());
                    assert_eq!(out, expected);
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    let stats = cache.stats();
    assert_eq!(stats.hits, 256);
    assert_eq!(stats.misses, 0);
    cache.close().unwrap();
}

#[test]
fn pinned_cache_survives_racing_close_attempts() {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = Arc::new(Cache::new(CacheConfig::new(KIB)).unwrap());
    cache.open(dir.path().join("cache.bin")).unwrap();
    cache.store("/f", 0, &[1_u8; KIB as usize]).unwrap();

    let pin = cache.ref_guard();
    let closer = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.close())
    };
    assert!(closer.join().unwrap().is_err());
    assert!(cache.is_open());

    drop(pin);
    cache.close().unwrap();
    assert!(!cache.is_open());
}
