//! Operation types for expressing edits.
//!
//! Edits are expressed as operations, not direct mutations. Every operation
//! targets one item and carries the vector clock of the site that made it,
//! which is what conflict detection and reconciliation reason about.

use crate::{
    Attribution, ItemDraft, ItemId, ItemPatch, OperationId, SessionId, TimeSlot, Timestamp,
    UserId, VectorClock, Version,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of an operation inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    /// Submitted, not yet committed
    #[default]
    Pending,
    /// Committed as submitted
    Applied,
    /// Refused (validation failure or unresolved conflict)
    Rejected,
    /// Committed as the result of merging concurrent edits
    Merged,
}

impl OpStatus {
    /// Applied and merged operations are immutable.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OpStatus::Pending)
    }
}

/// Discriminant of [`OpKind`], used in change logs and audit trails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Insert,
    Update,
    Delete,
    Move,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "insert",
            OpType::Update => "update",
            OpType::Delete => "delete",
            OpType::Move => "move",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Add a new item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertOp {
    pub item: ItemDraft,
}

/// Change fields of an existing item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOp {
    pub item_id: ItemId,
    /// Version this update is based on
    pub base_version: Version,
    pub patch: ItemPatch,
    /// Credit for merged updates; plain updates are credited to the submitter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<Attribution>,
}

/// Tombstone an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOp {
    pub item_id: ItemId,
    /// Checked against the current version when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<Version>,
}

/// Relocate an item to another time slot and room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveOp {
    pub item_id: ItemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<Version>,
    pub time_slot: TimeSlot,
    pub room: String,
}

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OpKind {
    Insert(InsertOp),
    Update(UpdateOp),
    Delete(DeleteOp),
    Move(MoveOp),
}

impl OpKind {
    pub fn insert(item: ItemDraft) -> Self {
        OpKind::Insert(InsertOp { item })
    }

    pub fn update(item_id: impl Into<ItemId>, base_version: Version, patch: ItemPatch) -> Self {
        OpKind::Update(UpdateOp {
            item_id: item_id.into(),
            base_version,
            patch,
            attribution: None,
        })
    }

    pub fn delete(item_id: impl Into<ItemId>, base_version: Option<Version>) -> Self {
        OpKind::Delete(DeleteOp {
            item_id: item_id.into(),
            base_version,
        })
    }

    pub fn relocate(
        item_id: impl Into<ItemId>,
        base_version: Option<Version>,
        time_slot: TimeSlot,
        room: impl Into<String>,
    ) -> Self {
        OpKind::Move(MoveOp {
            item_id: item_id.into(),
            base_version,
            time_slot,
            room: room.into(),
        })
    }

    pub fn op_type(&self) -> OpType {
        match self {
            OpKind::Insert(_) => OpType::Insert,
            OpKind::Update(_) => OpType::Update,
            OpKind::Delete(_) => OpType::Delete,
            OpKind::Move(_) => OpType::Move,
        }
    }

    /// The item this operation targets.
    pub fn item_id(&self) -> &ItemId {
        match self {
            OpKind::Insert(op) => &op.item.id,
            OpKind::Update(op) => &op.item_id,
            OpKind::Delete(op) => &op.item_id,
            OpKind::Move(op) => &op.item_id,
        }
    }

    /// The version the edit was based on, if it declares one.
    pub fn base_version(&self) -> Option<Version> {
        match self {
            OpKind::Insert(_) => None,
            OpKind::Update(op) => Some(op.base_version),
            OpKind::Delete(op) => op.base_version,
            OpKind::Move(op) => op.base_version,
        }
    }

    /// Field delta this operation writes to an existing item.
    ///
    /// Moves write time slot and room; inserts and deletes write none.
    pub fn field_delta(&self) -> Option<ItemPatch> {
        match self {
            OpKind::Update(op) => Some(op.patch.clone()),
            OpKind::Move(op) => Some(
                ItemPatch::default()
                    .with_time_slot(op.time_slot)
                    .with_room(op.room.clone()),
            ),
            OpKind::Insert(_) | OpKind::Delete(_) => None,
        }
    }
}

/// An edit submitted to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Filled in by the server when empty
    #[serde(default)]
    pub op_id: OperationId,
    #[serde(default)]
    pub session_id: SessionId,
    /// Submitting participant; also its vector clock site
    #[serde(default)]
    pub user_id: UserId,
    #[serde(flatten)]
    pub kind: OpKind,
    /// Causal context on submission, stamp once committed
    #[serde(default)]
    pub clock: VectorClock,
    #[serde(default)]
    pub created_at: Timestamp,
    #[serde(default)]
    pub status: OpStatus,
    /// Operations folded into this one by a merge
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<OperationId>,
}

impl Operation {
    /// Create a pending operation. Session and user are assigned on submission.
    pub fn new(op_id: impl Into<OperationId>, kind: OpKind, created_at: Timestamp) -> Self {
        Self {
            op_id: op_id.into(),
            session_id: SessionId::new(),
            user_id: UserId::new(),
            kind,
            clock: VectorClock::new(),
            created_at,
            status: OpStatus::Pending,
            merged_from: Vec::new(),
        }
    }

    /// Attach the causal context the submitter had observed.
    pub fn with_clock(mut self, clock: VectorClock) -> Self {
        self.clock = clock;
        self
    }

    /// Set the submitting user.
    pub fn by(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn op_type(&self) -> OpType {
        self.kind.op_type()
    }

    pub fn target_item_id(&self) -> &ItemId {
        self.kind.item_id()
    }

    pub fn base_version(&self) -> Option<Version> {
        self.kind.base_version()
    }

    /// Credit for this operation's mutation.
    pub fn attribution(&self) -> Attribution {
        match &self.kind {
            OpKind::Update(UpdateOp {
                attribution: Some(attribution),
                ..
            }) => attribution.clone(),
            _ => Attribution {
                site_id: self.user_id.clone(),
                at: self.created_at,
            },
        }
    }
}
