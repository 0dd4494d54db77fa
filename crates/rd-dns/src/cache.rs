//! Response cache: a fixed-capacity, TTL-bounded map from query
//! fingerprint to reply with FIFO eviction.
//!
//! A single mutex protects the map and the insertion-order queue; all
//! operations are short and never touch I/O, so the lock is a plain
//! synchronous one and the cache is usable from any task.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::packet::DnsMessage;
use crate::records::{RecordClass, RecordType};

/// Query fingerprint. The transport flag keeps truncated UDP replies from
/// being served to TCP clients and vice versa.
#[derive(Debug, Hash, PartialEq, Eq, Clone)]
pub struct CacheKey {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    pub tcp: bool,
}

impl CacheKey {
    pub fn new(name: &str, qtype: RecordType, qclass: RecordClass, tcp: bool) -> Self {
        Self {
            name: name.to_lowercase(),
            qtype: qtype.to_u16(),
            qclass: qclass.to_u16(),
            tcp,
        }
    }
}

struct CacheEntry {
    msg: DnsMessage,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    map: FxHashMap<CacheKey, CacheEntry>,
    /// Insertion order; front is evicted first.
    order: VecDeque<CacheKey>,
}

/// Thread-safe response cache. Capacity 0 disables it.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity,
            ttl,
        }
    }

    pub fn enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Look up a reply. Expired entries are deleted and reported as misses.
    /// The returned message is a copy; callers may rewrite its id freely.
    pub fn get(&self, key: &CacheKey) -> Option<DnsMessage> {
        if !self.enabled() {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.map.get(key) {
            Some(entry) => {
                if entry.expires_at > Instant::now() {
                    return Some(entry.msg.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            inner.map.remove(key);
        }
        None
    }

    /// Store a reply. The entry lives for the configured TTL, capped by the
    /// smallest answer-record TTL; a zero lifetime skips the insert.
    pub fn insert(&self, key: CacheKey, msg: &DnsMessage) {
        if !self.enabled() {
            return;
        }

        let mut ttl = self.ttl;
        if let Some(min_rr) = msg.answers.iter().map(|r| r.ttl).min() {
            ttl = ttl.min(Duration::from_secs(min_rr as u64));
        }
        if ttl.is_zero() {
            return;
        }

        let mut inner = self.inner.lock().unwrap();

        if inner.map.remove(&key).is_some() {
            if let Some(pos) = inner.order.iter().position(|k| k == &key) {
                inner.order.remove(pos);
            }
        }

        while inner.map.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.map.remove(&oldest);
                }
                None => break,
            }
        }

        inner.order.push_back(key.clone());
        inner.map.insert(
            key,
            CacheEntry {
                msg: msg.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn remove(&self, key: &CacheKey) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.remove(key);
        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            inner.order.remove(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
