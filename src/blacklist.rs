//! Expiring ban list: durable store plus a bounded in-memory cache.
//!
//! The durable store is the source of truth. The cache only short-circuits the
//! lookup for identities we already know are banned; a cached ban is re-checked
//! once it expires or once `revalidate_after_ms` has passed, and expired entries
//! are evicted by [`BlacklistStore::sweep`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Collaborator, CollaboratorError, StoreError};
use crate::timeout::CallTimeout;

/// One ban. Several entries may exist for an identity; it is banned while any of
/// them has `expires_at > now`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlacklistEntry {
    pub identity: String,
    pub reason: String,
    /// Epoch milliseconds.
    pub expires_at: u64,
}

impl BlacklistEntry {
    pub fn new(identity: impl Into<String>, reason: impl Into<String>, expires_at: u64) -> Self {
        Self { identity: identity.into(), reason: reason.into(), expires_at }
    }

    pub fn is_active(&self, now: u64) -> bool {
        self.expires_at > now
    }
}

/// Durable storage for ban entries.
#[async_trait]
pub trait BlacklistDurableStore: Send + Sync {
    /// The active entry with the latest expiry for `identity`, if any.
    async fn find(&self, identity: &str, now: u64) -> Result<Option<BlacklistEntry>, StoreError>;

    async fn insert(&self, entry: BlacklistEntry) -> Result<(), StoreError>;

    /// Delete every entry for `identity`; returns how many were removed.
    async fn delete_all(&self, identity: &str) -> Result<u64, StoreError>;

    /// Number of distinct identities with an active entry.
    async fn count_active(&self, now: u64) -> Result<u64, StoreError>;
}

/// Reference implementation holding rows in memory.
#[derive(Debug, Default)]
pub struct InMemoryBlacklistStore {
    rows: Mutex<Vec<BlacklistEntry>>,
}

impl InMemoryBlacklistStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows, expired ones included.
    pub fn rows(&self) -> Vec<BlacklistEntry> {
        self.rows.lock().map(|rows| rows.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BlacklistDurableStore for InMemoryBlacklistStore {
    async fn find(&self, identity: &str, now: u64) -> Result<Option<BlacklistEntry>, StoreError> {
        let rows = self.rows.lock().map_err(|_| "blacklist lock poisoned")?;
        Ok(rows
            .iter()
            .filter(|row| row.identity == identity && row.is_active(now))
            .max_by_key(|row| row.expires_at)
            .cloned())
    }

    async fn insert(&self, entry: BlacklistEntry) -> Result<(), StoreError> {
        self.rows.lock().map_err(|_| "blacklist lock poisoned")?.push(entry);
        Ok(())
    }

    async fn delete_all(&self, identity: &str) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().map_err(|_| "blacklist lock poisoned")?;
        let before = rows.len();
        rows.retain(|row| row.identity != identity);
        Ok((before - rows.len()) as u64)
    }

    async fn count_active(&self, now: u64) -> Result<u64, StoreError> {
        let rows = self.rows.lock().map_err(|_| "blacklist lock poisoned")?;
        let mut identities: Vec<&str> =
            rows.iter().filter(|row| row.is_active(now)).map(|row| row.identity.as_str()).collect();
        identities.sort_unstable();
        identities.dedup();
        Ok(identities.len() as u64)
    }
}

/// Answer to "is this identity banned?".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BanStatus {
    pub banned: bool,
    pub until: Option<u64>,
    pub reason: Option<String>,
}

impl BanStatus {
    fn banned(until: u64, reason: String) -> Self {
        Self { banned: true, until: Some(until), reason: Some(reason) }
    }
}

/// A [`BanStatus`] plus the store fault, if the durable lookup failed.
#[derive(Debug)]
pub struct BanLookup {
    pub status: BanStatus,
    pub fault: Option<CollaboratorError>,
}

#[derive(Debug, Clone)]
struct CachedBan {
    until: u64,
    reason: String,
    checked_at: u64,
}

/// Cached view over a [`BlacklistDurableStore`].
pub struct BlacklistStore {
    durable: Arc<dyn BlacklistDurableStore>,
    cache: DashMap<String, CachedBan>,
    /// Bumped under the cache entry lock by every ban and unban. A lookup only
    /// writes back what it read if no ban or unban happened in between.
    writes: AtomicU64,
    timeout: CallTimeout,
    revalidate_after_ms: u64,
}

impl fmt::Debug for BlacklistStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlacklistStore")
            .field("cached", &self.cache.len())
            .field("revalidate_after_ms", &self.revalidate_after_ms)
            .finish()
    }
}

impl BlacklistStore {
    pub fn new(
        durable: Arc<dyn BlacklistDurableStore>,
        timeout: CallTimeout,
        revalidate_after_ms: u64,
    ) -> Self {
        Self {
            durable,
            cache: DashMap::new(),
            writes: AtomicU64::new(0),
            timeout,
            revalidate_after_ms,
        }
    }

    /// Cache first, durable store on miss or when the cached ban needs re-checking.
    ///
    /// If the store fails, an unexpired cached ban is still honoured; without one
    /// the lookup fails open.
    pub async fn is_banned(&self, identity: &str, now: u64) -> BanLookup {
        let seen = self.writes.load(Ordering::Acquire);
        let cached = self.cache.get(identity).map(|entry| entry.value().clone());
        if let Some(hit) = &cached {
            let fresh = now.saturating_sub(hit.checked_at) < self.revalidate_after_ms;
            if hit.until > now && fresh {
                return BanLookup {
                    status: BanStatus::banned(hit.until, hit.reason.clone()),
                    fault: None,
                };
            }
        }

        match self.timeout.call(Collaborator::BlacklistStore, self.durable.find(identity, now)).await
        {
            Ok(Some(entry)) if entry.is_active(now) => {
                let hit =
                    CachedBan { until: entry.expires_at, reason: entry.reason.clone(), checked_at: now };
                self.write_back(identity, seen, Some(hit));
                BanLookup { status: BanStatus::banned(entry.expires_at, entry.reason), fault: None }
            }
            Ok(_) => {
                if cached.is_some() {
                    self.write_back(identity, seen, None);
                }
                BanLookup { status: BanStatus::default(), fault: None }
            }
            Err(fault) => {
                let status = match cached {
                    Some(hit) if hit.until > now => BanStatus::banned(hit.until, hit.reason),
                    _ => BanStatus::default(),
                };
                BanLookup { status, fault: Some(fault) }
            }
        }
    }

    /// Store what a durable lookup found, unless a ban or unban ran since `seen`.
    fn write_back(&self, identity: &str, seen: u64, found: Option<CachedBan>) {
        let slot = self.cache.entry(identity.to_string());
        if self.writes.load(Ordering::Acquire) != seen {
            return;
        }
        match (slot, found) {
            (Entry::Occupied(mut slot), Some(hit)) => {
                slot.insert(hit);
            }
            (Entry::Occupied(slot), None) => {
                slot.remove();
            }
            (Entry::Vacant(slot), Some(hit)) => {
                slot.insert(hit);
            }
            (Entry::Vacant(_), None) => {}
        }
    }

    /// Drop the cached ban and invalidate lookups already in flight.
    fn forget(&self, identity: &str) {
        let slot = self.cache.entry(identity.to_string());
        self.writes.fetch_add(1, Ordering::AcqRel);
        if let Entry::Occupied(slot) = slot {
            slot.remove();
        }
    }

    /// Write `entry` durably and cache it.
    ///
    /// The cache is updated even when the durable write fails, so this process
    /// enforces the ban regardless; the fault is returned to the caller.
    pub async fn ban(&self, entry: BlacklistEntry, now: u64) -> Result<(), CollaboratorError> {
        {
            let slot = self.cache.entry(entry.identity.clone());
            self.writes.fetch_add(1, Ordering::AcqRel);
            slot.and_modify(|hit| {
                if entry.expires_at > hit.until {
                    hit.until = entry.expires_at;
                    hit.reason = entry.reason.clone();
                }
                hit.checked_at = now;
            })
            .or_insert_with(|| CachedBan {
                until: entry.expires_at,
                reason: entry.reason.clone(),
                checked_at: now,
            });
        }
        self.timeout.call(Collaborator::BlacklistStore, self.durable.insert(entry)).await
    }

    /// Remove every ban for `identity`. Unbanning an identity that was never
    /// banned is a no-op.
    pub async fn unban(&self, identity: &str) -> Result<(), CollaboratorError> {
        self.forget(identity);
        let removed =
            self.timeout.call(Collaborator::BlacklistStore, self.durable.delete_all(identity)).await;
        // A lookup may have read the row before it was deleted.
        self.forget(identity);
        let removed = removed?;
        tracing::debug!(target: "gatekeeper::blacklist", identity, removed, "unbanned");
        Ok(())
    }

    pub async fn count_active(&self, now: u64) -> Result<u64, CollaboratorError> {
        self.timeout.call(Collaborator::BlacklistStore, self.durable.count_active(now)).await
    }

    /// Evict cached bans that have expired; returns how many were evicted.
    pub fn sweep(&self, now: u64) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, hit| hit.until > now);
        before.saturating_sub(self.cache.len())
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}
