//! Item lock table.
//!
//! Locks are advisory for edits and mandatory for deletes. Acquisition never
//! blocks: a held lock fails fast with the time left until it expires.

use crate::{error::Result, Error, ItemId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default lock lifetime: five minutes.
pub const DEFAULT_LOCK_TTL_MS: u64 = 5 * 60 * 1000;

/// A lock held on one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemLock {
    pub item_id: ItemId,
    pub holder: UserId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl ItemLock {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Milliseconds until the lock lapses.
    pub fn remaining(&self, now: Timestamp) -> u64 {
        self.expires_at.saturating_sub(now)
    }
}

#[derive(Debug, Clone)]
pub struct LockTable {
    locks: HashMap<ItemId, ItemLock>,
    ttl_ms: u64,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL_MS)
    }
}

impl LockTable {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            locks: HashMap::new(),
            ttl_ms,
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    /// Acquire or refresh a lock.
    ///
    /// Fails with [`Error::LockHeld`] if another user holds an unexpired lock.
    pub fn acquire(&mut self, item_id: &str, user_id: &str, now: Timestamp) -> Result<ItemLock> {
        if let Some(existing) = self.holder(item_id, now) {
            if existing.holder != user_id {
                return Err(Error::LockHeld {
                    item_id: item_id.to_string(),
                    holder: existing.holder.clone(),
                    retry_after_ms: existing.remaining(now),
                });
            }
        }

        let lock = ItemLock {
            item_id: item_id.to_string(),
            holder: user_id.to_string(),
            acquired_at: now,
            expires_at: now.saturating_add(self.ttl_ms),
        };
        self.locks.insert(item_id.to_string(), lock.clone());
        Ok(lock)
    }

    /// Release a lock held by `user_id`. Returns false if they did not hold it.
    pub fn release(&mut self, item_id: &str, user_id: &str) -> bool {
        match self.locks.get(item_id) {
            Some(lock) if lock.holder == user_id => {
                self.locks.remove(item_id);
                true
            }
            _ => false,
        }
    }

    /// The unexpired lock on an item, if any.
    pub fn holder(&self, item_id: &str, now: Timestamp) -> Option<&ItemLock> {
        self.locks.get(item_id).filter(|lock| !lock.is_expired(now))
    }

    /// Release every lock held by `user_id`.
    pub fn release_all(&mut self, user_id: &str) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| lock.holder != user_id);
        before - self.locks.len()
    }

    /// Drop expired locks.
    pub fn purge_expired(&mut self, now: Timestamp) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| !lock.is_expired(now));
        before - self.locks.len()
    }

    pub fn clear(&mut self) {
        self.locks.clear();
    }

    /// Unexpired locks, sorted by item id.
    pub fn active(&self, now: Timestamp) -> Vec<&ItemLock> {
        let mut locks: Vec<_> = self
            .locks
            .values()
            .filter(|lock| !lock.is_expired(now))
            .collect();
        locks.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_refresh() {
        let mut locks = LockTable::new(1000);
        let lock = locks.acquire("cs101", "alice", 0).unwrap();
        assert_eq!(lock.expires_at, 1000);

        let refreshed = locks.acquire("cs101", "alice", 500).unwrap();
        assert_eq!(refreshed.expires_at, 1500);
    }

    #[test]
    fn other_user_fails_fast_with_wait() {
        let mut locks = LockTable::new(1000);
        locks.acquire("cs101", "alice", 0).unwrap();

        let err = locks.acquire("cs101", "bob", 400).unwrap_err();
        assert_eq!(
            err,
            Error::LockHeld {
                item_id: "cs101".into(),
                holder: "alice".into(),
                retry_after_ms: 600,
            }
        );
    }

    #[test]
    fn expired_lock_can_be_taken() {
        let mut locks = LockTable::new(1000);
        locks.acquire("cs101", "alice", 0).unwrap();
        assert!(locks.holder("cs101", 1000).is_none());
        let lock = locks.acquire("cs101", "bob", 1000).unwrap();
        assert_eq!(lock.holder, "bob");
    }

    #[test]
    fn release_only_by_holder() {
        let mut locks = LockTable::new(1000);
        locks.acquire("cs101", "alice", 0).unwrap();
        assert!(!locks.release("cs101", "bob"));
        assert!(locks.release("cs101", "alice"));
        assert!(locks.holder("cs101", 0).is_none());
    }

    #[test]
    fn release_all_and_purge() {
        let mut locks = LockTable::new(1000);
        locks.acquire("a", "alice", 0).unwrap();
        locks.acquire("b", "alice", 0).unwrap();
        locks.acquire("c", "bob", 500).unwrap();

        assert_eq!(locks.release_all("alice"), 2);
        assert_eq!(locks.active(0).len(), 1);
        assert_eq!(locks.purge_expired(2000), 1);
        assert!(locks.active(0).is_empty());
    }
}
