//! Cached pre-shared keys for resumption and 0-RTT.

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;
use trellis_core::ids::{CipherSuite, ProtocolVersion};

/// Provenance of a PSK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PskType {
    External,
    Resumption,
}

/// Resumption material cached from a prior connection (or provisioned
/// externally), keyed by peer identity.
#[derive(Debug, Clone)]
pub struct CachedPsk {
    pub secret: Bytes,
    pub psk_type: PskType,
    pub version: ProtocolVersion,
    pub cipher: CipherSuite,
    pub alpn: Option<String>,
    pub max_early_data_size: u32,
    pub issued_at: SystemTime,
}

impl CachedPsk {
    /// A resumption PSK with the parameters a prior connection negotiated.
    pub fn resumption(
        secret: impl Into<Bytes>,
        version: ProtocolVersion,
        cipher: CipherSuite,
    ) -> Self {
        Self {
            secret: secret.into(),
            psk_type: PskType::Resumption,
            version,
            cipher,
            alpn: None,
            max_early_data_size: 0,
            issued_at: SystemTime::now(),
        }
    }

    pub fn with_alpn(mut self, alpn: impl Into<String>) -> Self {
        self.alpn = Some(alpn.into());
        self
    }

    pub fn with_max_early_data(mut self, max: u32) -> Self {
        self.max_early_data_size = max;
        self
    }
}

/// PSK cache shared by the drivers of one context.
///
/// `remove` is the invalidate-on-reject hook: after any early-data rejection
/// the driver removes the PSK that initiated the 0-RTT attempt so the next
/// connection cannot repeat the failure.
pub trait PskCache: fmt::Debug {
    fn get(&self, identity: &str) -> Option<CachedPsk>;
    fn put(&self, identity: &str, psk: CachedPsk);
    fn remove(&self, identity: &str);
}

/// In-memory PSK cache with oldest-first eviction.
pub struct MemoryPskCache {
    entries: Mutex<HashMap<String, CachedPsk>>,
    capacity: usize,
}

impl MemoryPskCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn evict_oldest(entries: &mut HashMap<String, CachedPsk>) {
        let oldest = entries
            .iter()
            .min_by_key(|(_, psk)| psk.issued_at)
            .map(|(identity, _)| identity.clone());
        if let Some(identity) = oldest {
            entries.remove(&identity);
        }
    }
}

impl Default for MemoryPskCache {
    fn default() -> Self {
        MemoryPskCache::new(1024)
    }
}

impl PskCache for MemoryPskCache {
    fn get(&self, identity: &str) -> Option<CachedPsk> {
        self.entries.lock().get(identity).cloned()
    }

    fn put(&self, identity: &str, psk: CachedPsk) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(identity) {
            Self::evict_oldest(&mut entries);
        }
        entries.insert(identity.to_string(), psk);
    }

    fn remove(&self, identity: &str) {
        self.entries.lock().remove(identity);
    }
}

impl fmt::Debug for MemoryPskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPskCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn psk() -> CachedPsk {
        CachedPsk::resumption(
            &b"secret"[..],
            ProtocolVersion::Tls13,
            CipherSuite::Aes128GcmSha256,
        )
    }

    #[test]
    fn put_get_remove() {
        let cache = MemoryPskCache::default();
        cache.put("peer.example.com", psk().with_alpn("h2"));
        let cached = cache.get("peer.example.com").expect("cached");
        assert_eq!(cached.alpn.as_deref(), Some("h2"));
        assert_eq!(cached.psk_type, PskType::Resumption);
        cache.remove("peer.example.com");
        assert!(cache.get("peer.example.com").is_none());
    }

    #[test]
    fn capacity_evicts_oldest_entry() {
        let cache = MemoryPskCache::new(2);
        let mut old = psk();
        old.issued_at = SystemTime::now() - Duration::from_secs(60);
        cache.put("old", old);
        cache.put("new", psk());
        cache.put("newer", psk());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("old").is_none());
        assert!(cache.get("new").is_some());
        assert!(cache.get("newer").is_some());
    }

    #[test]
    fn replacing_existing_entry_does_not_evict() {
        let cache = MemoryPskCache::new(1);
        cache.put("peer", psk());
        cache.put("peer", psk().with_max_early_data(1000));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("peer").unwrap().max_early_data_size, 1000);
    }
}
