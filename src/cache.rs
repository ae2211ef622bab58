//! Cost-bounded object cache
//!
//! Both cached-object kinds (price guides, pictures) share the [`Cached`]
//! record: identity, validity, fetch timestamp, update status, an explicit
//! reference count and the deferred-update flag. The cache maps keys to
//! `Arc<Mutex<Cached<P>>>` handles and accounts an integer cost per entry.
//! Eviction is manual and only ever removes entries whose reference count is
//! zero; a referenced entry can keep the cache over budget indefinitely.
//!
//! All reference counting and status transitions happen on the engine's
//! control thread; the mutex protects the payload during worker hand-off.

use crate::error::{Error, Result};
use crate::types::ItemKey;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64_with_seed;

const PATH_HASH_SEED: u64 = 42;

/// Disk-cache location of one object's file:
/// `data_dir/<type char>/<xx>/<item id>[/<color id>]/<file>`, where `<xx>` is
/// the low byte of the hashed item id. The bucket level bounds directory
/// fan-out on filesystems that degrade with huge directories.
pub fn data_file_path(data_dir: &Path, key: &CacheKey, file_name: &str) -> PathBuf {
    let bucket = xxh3_64_with_seed(key.item.id.as_bytes(), PATH_HASH_SEED) & 0xff;
    let mut path = data_dir.join(key.item.type_id.to_string());
    path.push(format!("{bucket:02x}"));
    path.push(&key.item.id);
    if let Some(color) = key.color {
        path.push(color.to_string());
    }
    path.push(file_name);
    path
}

/// Identity of one cached object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub item: ItemKey,
    /// `None` for colorless objects (large pictures)
    pub color: Option<u32>,
}

impl CacheKey {
    pub fn new(item: ItemKey, color: Option<u32>) -> Self {
        CacheKey { item, color }
    }
}

/// Lifecycle of one cached object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    /// created, no disk load attempted yet
    Ready,
    /// disk load in flight
    Loading,
    /// network refresh in flight
    Updating,
    /// last load/refresh succeeded
    Ok,
    /// last refresh failed; any previously cached payload stays visible
    UpdateFailed,
}

/// Shared state of one cached object
#[derive(Debug)]
pub struct Cached<P> {
    pub key: CacheKey,
    /// false until a disk load or network refresh produced a payload
    pub valid: bool,
    pub fetched: Option<DateTime<Utc>>,
    pub status: UpdateStatus,
    /// explicit count governing eviction eligibility, mutated only on the
    /// control thread
    pub refs: u32,
    /// a refresh was requested while the disk load was still in flight
    pub update_after_load: bool,
    pub payload: P,
}

impl<P> Cached<P> {
    pub fn new(key: CacheKey, payload: P) -> Self {
        Cached {
            key,
            valid: false,
            fetched: None,
            status: UpdateStatus::Ready,
            refs: 0,
            update_after_load: false,
            payload,
        }
    }

    /// Stale means never fetched, or fetched longer ago than the interval.
    pub fn is_stale(&self, interval_secs: i64) -> bool {
        match self.fetched {
            None => true,
            Some(fetched) => Utc::now() - fetched > Duration::seconds(interval_secs),
        }
    }
}

pub type CachedHandle<P> = Arc<Mutex<Cached<P>>>;

struct Entry<P> {
    object: CachedHandle<P>,
    cost: u64,
}

/// Keyed store with an integer cost budget
pub struct ObjectCache<P> {
    entries: HashMap<CacheKey, Entry<P>>,
    total_cost: u64,
    max_cost: u64,
}

impl<P> ObjectCache<P> {
    pub fn new(max_cost: u64) -> Self {
        ObjectCache {
            entries: HashMap::new(),
            total_cost: 0,
            max_cost,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedHandle<P>> {
        self.entries.get(key).map(|e| Arc::clone(&e.object))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert an object at the given cost. Refused outright when a single
    /// object's cost exceeds the budget; the caller proceeds uncached.
    pub fn insert(&mut self, key: CacheKey, object: CachedHandle<P>, cost: u64) -> Result<()> {
        if cost > self.max_cost {
            return Err(Error::Capacity {
                cost,
                max: self.max_cost,
            });
        }
        if let Some(old) = self.entries.insert(key, Entry { object, cost }) {
            self.total_cost -= old.cost;
        }
        self.total_cost += cost;
        self.evict_over_budget();
        Ok(())
    }

    /// Re-account an entry whose payload size changed.
    pub fn set_cost(&mut self, key: &CacheKey, cost: u64) -> Result<()> {
        if cost > self.max_cost {
            return Err(Error::Capacity {
                cost,
                max: self.max_cost,
            });
        }
        if let Some(entry) = self.entries.get_mut(key) {
            self.total_cost = self.total_cost - entry.cost + cost;
            entry.cost = cost;
            self.evict_over_budget();
        }
        Ok(())
    }

    /// Drop every unreferenced entry. Entries still referenced by callers
    /// survive and stay accounted.
    pub fn clear(&mut self) {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.object.lock().refs > 0);
        self.total_cost = self.entries.values().map(|e| e.cost).sum();
        debug!(
            evicted = before - self.entries.len(),
            retained = self.entries.len(),
            "cache cleared"
        );
    }

    /// Snapshot of every live handle, for control-thread sweeps.
    pub fn handles(&self) -> Vec<CachedHandle<P>> {
        self.entries
            .values()
            .map(|e| Arc::clone(&e.object))
            .collect()
    }

    pub fn total_cost(&self) -> u64 {
        self.total_cost
    }

    pub fn max_cost(&self) -> u64 {
        self.max_cost
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_over_budget(&mut self) {
        if self.total_cost <= self.max_cost {
            return;
        }
        let mut evictable: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.object.lock().refs == 0)
            .map(|(k, _)| k.clone())
            .collect();
        while self.total_cost > self.max_cost {
            let Some(key) = evictable.pop() else { break };
            if let Some(entry) = self.entries.remove(&key) {
                self.total_cost -= entry.cost;
            }
        }
        if self.total_cost > self.max_cost {
            debug!(
                total = self.total_cost,
                max = self.max_cost,
                "cache over budget, all remaining entries referenced"
            );
        }
    }
}
