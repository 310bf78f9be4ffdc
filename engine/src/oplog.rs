//! Append-only log of committed operations.
//!
//! The log keeps every committed operation together with the item state it
//! produced, indexed per item. The conflict detector asks it what happened to
//! an item since a given version; the resolver asks it what the item looked
//! like at that version.

use crate::{
    ItemId, OpStatus, OpType, Operation, OperationId, ScheduleItem, Timestamp, UserId,
    VectorClock, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One committed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub operation: Operation,
    /// Item version produced by this operation
    pub version: Version,
    /// Item state right after the operation
    pub item_after: ScheduleItem,
    pub applied_at: Timestamp,
}

/// Audit view of a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    pub operation_id: OperationId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub op_type: OpType,
    pub item_id: ItemId,
    pub status: OpStatus,
    pub version: Version,
    pub timestamp: Timestamp,
    pub vector_clock: VectorClock,
}

impl From<&LogEntry> for ChangeLogEntry {
    fn from(entry: &LogEntry) -> Self {
        Self {
            operation_id: entry.operation.op_id.clone(),
            user_id: entry.operation.user_id.clone(),
            op_type: entry.operation.op_type(),
            item_id: entry.operation.target_item_id().clone(),
            status: entry.operation.status,
            version: entry.version,
            timestamp: entry.applied_at,
            vector_clock: entry.operation.clock.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    entries: Vec<LogEntry>,
    by_item: HashMap<ItemId, Vec<usize>>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a committed operation.
    pub fn append(&mut self, operation: Operation, item_after: ScheduleItem, applied_at: Timestamp) {
        let index = self.entries.len();
        self.by_item
            .entry(operation.target_item_id().clone())
            .or_default()
            .push(index);
        self.entries.push(LogEntry {
            version: item_after.version,
            operation,
            item_after,
            applied_at,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in commit order.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Entries for one item, in commit order.
    pub fn for_item<'a>(&'a self, item_id: &str) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.by_item
            .get(item_id)
            .into_iter()
            .flatten()
            .map(move |&index| &self.entries[index])
    }

    /// Entries that moved `item_id` past `base_version`.
    pub fn applied_since(&self, item_id: &str, base_version: Version) -> Vec<&LogEntry> {
        self.for_item(item_id)
            .filter(|entry| entry.version > base_version)
            .collect()
    }

    /// Logged state of `item_id` at exactly `version`.
    pub fn state_at(&self, item_id: &str, version: Version) -> Option<&ScheduleItem> {
        self.for_item(item_id)
            .find(|entry| entry.version == version)
            .map(|entry| &entry.item_after)
    }

    /// Find an entry by operation id.
    pub fn find(&self, op_id: &str) -> Option<&LogEntry> {
        self.entries.iter().find(|entry| entry.operation.op_id == op_id)
    }

    /// Up to `limit` most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ChangeLogEntry> {
        self.entries
            .iter()
            .rev()
            .take(limit)
            .map(ChangeLogEntry::from)
            .collect()
    }
}
