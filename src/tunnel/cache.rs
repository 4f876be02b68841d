//! Copy-on-write cache of decrypted backend addresses
//!
//! Readers load the current snapshot with a single atomic operation and
//! never take a lock. Writers serialize on one mutex, build a fresh map and
//! publish it with a single atomic store. Once the cache holds `capacity`
//! entries the next insertion starts over from an empty map.

use crate::crypto::{AddressCipher, CryptoError};
use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Immutable view of the cache: ciphertext line -> `host:port`
pub type Snapshot = HashMap<Bytes, Bytes>;

/// Default number of entries kept before the cache is flushed
pub const DEFAULT_CACHE_CAPACITY: usize = 1024 * 1024;

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub decrypt_failures: u64,
    pub flushes: u64,
}

/// Shared address cache
pub struct AddressCache {
    current: ArcSwap<Snapshot>,
    write_lock: Mutex<()>,
    capacity: usize,
    cipher: Arc<dyn AddressCipher>,
    hits: AtomicU64,
    misses: AtomicU64,
    decrypt_failures: AtomicU64,
    flushes: AtomicU64,
}

impl AddressCache {
    /// Create an empty cache that decrypts misses with `cipher`
    ///
    /// A `capacity` of zero is treated as one.
    pub fn new(cipher: Arc<dyn AddressCipher>, capacity: usize) -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::new()),
            write_lock: Mutex::new(()),
            capacity: capacity.max(1),
            cipher,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            decrypt_failures: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Resolve a ciphertext line to its backend address
    ///
    /// Hits are served from the current snapshot without locking or
    /// decrypting. Misses are decrypted and, on success, inserted.
    /// Decryption failures are never cached.
    pub fn resolve(&self, line: &[u8]) -> Result<Bytes, CryptoError> {
        if let Some(addr) = self.current.load().get(line) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(addr.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let addr = match self.cipher.decrypt(line) {
            Ok(addr) => Bytes::from(addr),
            Err(e) => {
                self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        Ok(self.insert(Bytes::copy_from_slice(line), addr))
    }

    /// Insert an entry, returning the value now associated with `key`
    ///
    /// If another writer published `key` first, its value wins and is
    /// returned instead of `addr`.
    pub fn insert(&self, key: Bytes, addr: Bytes) -> Bytes {
        let _guard = self.write_lock.lock();

        let old = self.current.load_full();
        if let Some(existing) = old.get(&key) {
            trace!("Cache entry raced in by another writer");
            return existing.clone();
        }

        let mut next = if old.len() < self.capacity {
            let mut next = Snapshot::with_capacity(old.len() + 1);
            next.extend(old.iter().map(|(k, v)| (k.clone(), v.clone())));
            next
        } else {
            debug!("Address cache reached {} entries, flushing", old.len());
            self.flushes.fetch_add(1, Ordering::Relaxed);
            Snapshot::with_capacity(1)
        };
        next.insert(key, addr.clone());

        self.current.store(Arc::new(next));
        addr
    }

    /// Look up a line without decrypting
    pub fn get(&self, line: &[u8]) -> Option<Bytes> {
        self.current.load().get(line).cloned()
    }

    /// Current published snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PassphraseCipher;
    use std::sync::atomic::AtomicUsize;

    /// Cipher that "decrypts" `enc:<addr>` and counts calls
    #[derive(Default)]
    struct CountingCipher {
        calls: AtomicUsize,
    }

    impl AddressCipher for CountingCipher {
        fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ciphertext
                .strip_prefix(b"enc:")
                .map(|addr| addr.to_vec())
                .ok_or_else(|| CryptoError::Decryption("no prefix".to_string()))
        }
    }

    fn counting_cache(capacity: usize) -> (Arc<CountingCipher>, AddressCache) {
        let cipher = Arc::new(CountingCipher::default());
        let cache = AddressCache::new(cipher.clone(), capacity);
        (cipher, cache)
    }

    #[test]
    fn test_resolve_real_cipher() {
        let cipher = PassphraseCipher::new("secret");
        let line = cipher.encrypt(b"127.0.0.1:9000").unwrap();
        let cache = AddressCache::new(Arc::new(cipher), 16);

        assert_eq!(cache.resolve(&line).unwrap(), &b"127.0.0.1:9000"[..]);
        assert_eq!(cache.get(&line).unwrap(), &b"127.0.0.1:9000"[..]);
    }

    #[test]
    fn test_repeated_resolve_decrypts_once() {
        let (cipher, cache) = counting_cache(16);

        for _ in 0..10 {
            assert_eq!(cache.resolve(b"enc:a:1").unwrap(), &b"a:1"[..]);
        }

        assert_eq!(cipher.calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 9);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_decrypt_failure_not_cached() {
        let (cipher, cache) = counting_cache(16);

        assert!(cache.resolve(b"garbage").is_err());
        assert!(cache.resolve(b"garbage").is_err());

        assert_eq!(cipher.calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().decrypt_failures, 2);
    }

    #[test]
    fn test_flush_on_overflow() {
        let (_cipher, cache) = counting_cache(3);

        cache.resolve(b"enc:a:1").unwrap();
        cache.resolve(b"enc:b:2").unwrap();
        cache.resolve(b"enc:c:3").unwrap();
        assert_eq!(cache.len(), 3);

        cache.resolve(b"enc:d:4").unwrap();

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&b"enc:d:4"[..]).unwrap(), &b"d:4"[..]);
        assert_eq!(cache.stats().flushes, 1);
    }

    #[test]
    fn test_old_snapshot_unchanged_after_publish() {
        let (_cipher, cache) = counting_cache(16);
        cache.resolve(b"enc:a:1").unwrap();

        let before = cache.snapshot();
        cache.resolve(b"enc:b:2").unwrap();

        assert_eq!(before.len(), 1);
        assert!(before.get(&b"enc:b:2"[..]).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_insert_keeps_first_writer() {
        let (_cipher, cache) = counting_cache(16);

        let first = cache.insert(Bytes::from_static(b"k"), Bytes::from_static(b"one:1"));
        let second = cache.insert(Bytes::from_static(b"k"), Bytes::from_static(b"two:2"));

        assert_eq!(first, &b"one:1"[..]);
        assert_eq!(second, &b"one:1"[..]);
        assert_eq!(cache.get(b"k").unwrap(), &b"one:1"[..]);
    }

    #[test]
    fn test_zero_capacity_holds_latest() {
        let (_cipher, cache) = counting_cache(0);
        assert_eq!(cache.capacity(), 1);

        cache.resolve(b"enc:a:1").unwrap();
        cache.resolve(b"enc:b:2").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(b"enc:b:2").is_some());
    }

    #[test]
    fn test_concurrent_resolution() {
        let (cipher, cache) = counting_cache(1 << 16);
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let line = format!("enc:host{}-{}:{}", t, i, i);
                        let addr = cache.resolve(line.as_bytes()).unwrap();
                        assert_eq!(&addr[..], &line.as_bytes()[4..]);
                        assert!(cache.get(line.as_bytes()).is_some());

                        let shared = format!("enc:shared{}:1", i % 4);
                        let addr = cache.resolve(shared.as_bytes()).unwrap();
                        assert_eq!(&addr[..], &shared.as_bytes()[4..]);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 8 * 200 + 4);
        for t in 0..8 {
            for i in 0..200 {
                let line = format!("enc:host{}-{}:{}", t, i, i);
                assert!(cache.get(line.as_bytes()).is_some());
            }
        }
        // Each distinct key is decrypted at least once; the shared ones may race
        assert!(cipher.calls.load(Ordering::SeqCst) >= 8 * 200 + 4);
    }
}
