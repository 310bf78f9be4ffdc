//! Conflict records produced by detection and consumed by resolution.

use crate::{Field, ItemId, OperationId, TimeSlot, Timestamp, UserId, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// How serious a conflict is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Strategy the resolver applies to a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Replay concurrent field deltas into one merged update
    OperationalMerge,
    /// Propose alternative slots or rooms; the caller decides
    SuggestAlternatives,
    /// Give the incoming item a fresh id
    RegenerateId,
    /// Retry once the item lock is released or expires
    WaitForUnlock,
    /// Needs a human decision
    ManualIntervention,
}

impl ResolutionStrategy {
    /// True for strategies the resolver completes without the caller.
    pub fn is_automatic(&self) -> bool {
        matches!(
            self,
            ResolutionStrategy::OperationalMerge | ResolutionStrategy::RegenerateId
        )
    }
}

/// One field written differently by two concurrent edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldClash {
    pub field: Field,
    pub incoming: Value,
    pub current: Value,
}

/// What went wrong, with the data needed to resolve it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ConflictKind {
    /// The item changed after the edit's base version.
    ConcurrentEdit {
        item_id: ItemId,
        base_version: Version,
        current_version: Version,
    },
    /// A stale edit writes fields that changed since its base, to other values.
    DataConflict {
        item_id: ItemId,
        clashes: Vec<FieldClash>,
    },
    /// The inserted id is already taken.
    DuplicateId { item_id: ItemId },
    /// The room is booked at an overlapping time.
    TimeRoomConflict {
        item_id: ItemId,
        time_slot: TimeSlot,
        room: String,
        existing_item: ItemId,
    },
    /// The faculty member teaches elsewhere at an overlapping time.
    FacultyConflict {
        item_id: ItemId,
        time_slot: TimeSlot,
        faculty_id: String,
        existing_item: ItemId,
    },
    /// Another participant holds the item lock.
    LockedItem {
        item_id: ItemId,
        holder: UserId,
        expires_at: Timestamp,
    },
    /// Live items depend on the item being deleted.
    DependencyConflict {
        item_id: ItemId,
        dependents: Vec<ItemId>,
    },
    /// The move destination is occupied.
    PositionOccupied {
        item_id: ItemId,
        time_slot: TimeSlot,
        room: String,
        occupant: ItemId,
    },
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::ConcurrentEdit { .. } => "concurrent_edit",
            ConflictKind::DataConflict { .. } => "data_conflict",
            ConflictKind::DuplicateId { .. } => "duplicate_id",
            ConflictKind::TimeRoomConflict { .. } => "time_room_conflict",
            ConflictKind::FacultyConflict { .. } => "faculty_conflict",
            ConflictKind::LockedItem { .. } => "locked_item",
            ConflictKind::DependencyConflict { .. } => "dependency_conflict",
            ConflictKind::PositionOccupied { .. } => "position_occupied",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ConflictKind::ConcurrentEdit { .. } | ConflictKind::DuplicateId { .. } => Severity::Low,
            ConflictKind::DataConflict { .. }
            | ConflictKind::LockedItem { .. }
            | ConflictKind::PositionOccupied { .. } => Severity::Medium,
            ConflictKind::TimeRoomConflict { .. }
            | ConflictKind::FacultyConflict { .. }
            | ConflictKind::DependencyConflict { .. } => Severity::High,
        }
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        match self {
            ConflictKind::ConcurrentEdit { .. } | ConflictKind::DataConflict { .. } => {
                ResolutionStrategy::OperationalMerge
            }
            ConflictKind::DuplicateId { .. } => ResolutionStrategy::RegenerateId,
            ConflictKind::TimeRoomConflict { .. } | ConflictKind::FacultyConflict { .. } => {
                ResolutionStrategy::SuggestAlternatives
            }
            ConflictKind::LockedItem { .. } => ResolutionStrategy::WaitForUnlock,
            ConflictKind::DependencyConflict { .. } | ConflictKind::PositionOccupied { .. } => {
                ResolutionStrategy::ManualIntervention
            }
        }
    }

    /// The item the conflicting operation targets.
    pub fn item_id(&self) -> &ItemId {
        match self {
            ConflictKind::ConcurrentEdit { item_id, .. }
            | ConflictKind::DataConflict { item_id, .. }
            | ConflictKind::DuplicateId { item_id }
            | ConflictKind::TimeRoomConflict { item_id, .. }
            | ConflictKind::FacultyConflict { item_id, .. }
            | ConflictKind::LockedItem { item_id, .. }
            | ConflictKind::DependencyConflict { item_id, .. }
            | ConflictKind::PositionOccupied { item_id, .. } => item_id,
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    #[serde(flatten)]
    pub kind: ConflictKind,
    pub severity: Severity,
    pub involved_operations: Vec<OperationId>,
    pub suggested_resolution: ResolutionStrategy,
}

impl ConflictRecord {
    pub fn new(kind: ConflictKind, involved_operations: Vec<OperationId>) -> Self {
        Self {
            severity: kind.severity(),
            suggested_resolution: kind.strategy(),
            kind,
            involved_operations,
        }
    }

    pub fn item_id(&self) -> &ItemId {
        self.kind.item_id()
    }
}
