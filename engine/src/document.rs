//! ScheduleDocument - the in-memory timetable.
//!
//! The document maps item ids to items and applies committed operations.
//! It performs the structural checks an apply needs (existence, tombstones,
//! version match) but no conflict classification; that is the detector's job.

use crate::{
    error::Result, Error, ItemId, OpKind, Operation, OperationId, ScheduleItem, TimeSlot,
    VectorClock, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Result of applying an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    /// The operation ID that was applied
    pub op_id: OperationId,
    /// The item affected
    pub item_id: ItemId,
    /// The new version of the item
    pub version: Version,
}

/// A versioned timetable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDocument {
    /// Items by id, tombstones included
    items: BTreeMap<ItemId, ScheduleItem>,
    /// Pointwise max of every stamp applied to this document
    clock: VectorClock,
}

impl ScheduleDocument {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a document from existing items. The clock covers all item stamps.
    pub fn from_items(items: impl IntoIterator<Item = ScheduleItem>) -> Self {
        let mut document = Self::new();
        for item in items {
            document.upsert(item);
        }
        document
    }

    /// Pointwise max of every stamp applied to this document.
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Get a live item by id.
    pub fn get(&self, id: &str) -> Option<&ScheduleItem> {
        self.items.get(id).filter(|item| item.is_active())
    }

    /// Get an item including tombstones.
    pub fn get_including_deleted(&self, id: &str) -> Option<&ScheduleItem> {
        self.items.get(id)
    }

    /// Check if an id is taken (tombstones included).
    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// Live items in id order.
    pub fn items(&self) -> impl Iterator<Item = &ScheduleItem> {
        self.items.values().filter(|item| item.is_active())
    }

    /// All items including tombstones, in id order.
    pub fn all_items(&self) -> impl Iterator<Item = &ScheduleItem> {
        self.items.values()
    }

    /// Count of live items.
    pub fn len(&self) -> usize {
        self.items().count()
    }

    /// Check if the document has no live items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace an item as-is, folding its stamp into the clock.
    ///
    /// Used by reconciliation and snapshot import; edits go through [`apply`].
    ///
    /// [`apply`]: ScheduleDocument::apply
    pub fn upsert(&mut self, item: ScheduleItem) {
        self.clock.merge(&item.clock);
        self.items.insert(item.id.clone(), item);
    }

    /// Replace the document clock. Used by snapshot import.
    pub(crate) fn set_clock(&mut self, clock: VectorClock) {
        self.clock = clock;
    }

    /// Live items booking `room` at a time overlapping `slot`, except `exclude`.
    pub fn room_occupants<'a>(
        &'a self,
        slot: &'a TimeSlot,
        room: &'a str,
        exclude: Option<&'a str>,
    ) -> impl Iterator<Item = &'a ScheduleItem> + 'a {
        self.items()
            .filter(move |item| Some(item.id.as_str()) != exclude)
            .filter(move |item| item.occupies(slot, room))
    }

    /// Live items booking `faculty_id` at a time overlapping `slot`, except `exclude`.
    pub fn faculty_bookings<'a>(
        &'a self,
        slot: &'a TimeSlot,
        faculty_id: &'a str,
        exclude: Option<&'a str>,
    ) -> impl Iterator<Item = &'a ScheduleItem> + 'a {
        self.items()
            .filter(move |item| Some(item.id.as_str()) != exclude)
            .filter(move |item| item.books_faculty(slot, faculty_id))
    }

    /// Ids of live items that list `id` as a dependency.
    pub fn dependents_of(&self, id: &str) -> Vec<ItemId> {
        self.items()
            .filter(|item| item.depends_on.iter().any(|dep| dep == id))
            .map(|item| item.id.clone())
            .collect()
    }

    /// Rooms used by live items.
    pub fn rooms(&self) -> BTreeSet<&str> {
        self.items().map(|item| item.room.as_str()).collect()
    }

    /// Apply a committed operation.
    ///
    /// The item is stamped with the operation's clock and credited per
    /// [`Operation::attribution`].
    pub fn apply(&mut self, op: &Operation) -> Result<ApplyResult> {
        let version = match &op.kind {
            OpKind::Insert(insert) => {
                if self.items.contains_key(&insert.item.id) {
                    return Err(Error::ItemAlreadyExists(insert.item.id.clone()));
                }
                let attribution = op.attribution();
                let item = ScheduleItem::from_draft(
                    insert.item.clone(),
                    attribution.at,
                    attribution.site_id,
                    op.clock.clone(),
                );
                let version = item.version;
                self.items.insert(item.id.clone(), item);
                version
            }
            OpKind::Update(update) => {
                let item = self.live_item_mut(&update.item_id, Some(update.base_version))?;
                item.apply_patch(&update.patch, op.attribution(), op.clock.clone());
                item.version
            }
            OpKind::Delete(delete) => {
                let item = self.live_item_mut(&delete.item_id, delete.base_version)?;
                item.mark_deleted(op.attribution(), op.clock.clone());
                item.version
            }
            OpKind::Move(relocate) => {
                let item = self.live_item_mut(&relocate.item_id, relocate.base_version)?;
                item.relocate(
                    relocate.time_slot,
                    relocate.room.clone(),
                    op.attribution(),
                    op.clock.clone(),
                );
                item.version
            }
        };

        self.clock.merge(&op.clock);

        Ok(ApplyResult {
            op_id: op.op_id.clone(),
            item_id: op.target_item_id().clone(),
            version,
        })
    }

    fn live_item_mut(&mut self, id: &str, base_version: Option<Version>) -> Result<&mut ScheduleItem> {
        let item = self
            .items
            .get_mut(id)
            .ok_or_else(|| Error::ItemNotFound(id.to_string()))?;

        if item.deleted {
            return Err(Error::OperationOnDeleted(id.to_string()));
        }

        if let Some(expected) = base_version {
            if item.version != expected {
                return Err(Error::VersionMismatch {
                    expected,
                    actual: item.version,
                });
            }
        }

        Ok(item)
    }
}
