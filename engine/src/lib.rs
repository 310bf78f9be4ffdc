//! # Timetable Engine
//!
//! A deterministic core for collaborative editing of a shared timetable.
//!
//! This crate holds the logic that lets many participants edit one schedule
//! document at the same time without a central lock: causality tracking,
//! an operation log, scheduling-aware conflict detection, conflict
//! resolution and replica reconciliation. The same inputs always produce the
//! same outputs, so two sites computing a merge independently converge.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine knows nothing about files, sockets or wall clocks.
//!   Time is passed in as millisecond [`Timestamp`]s.
//! - **Deterministic**: no randomness; ties are broken by site id.
//! - **Testable**: pure logic, no mocks needed.
//!
//! ## Core Concepts
//!
//! ### Items and documents
//!
//! A [`ScheduleDocument`] maps item ids to [`ScheduleItem`]s (time slot, room,
//! faculty, subject). Each item carries a version that increases on every
//! mutation and the [`VectorClock`] stamp of its last edit.
//!
//! ### Operations
//!
//! Edits are expressed as [`Operation`]s carrying one [`OpKind`]:
//! - [`InsertOp`] - add a new item
//! - [`UpdateOp`] - change fields of an item (based on a version)
//! - [`DeleteOp`] - tombstone an item
//! - [`MoveOp`] - relocate an item to another time slot and room
//!
//! ### Conflicts
//!
//! The [`ConflictDetector`] classifies a candidate operation against the
//! document, the [`OperationLog`] and the [`LockTable`]. The
//! [`ConflictResolver`] then merges concurrent edits, regenerates duplicate
//! ids, proposes alternative slots, or escalates.
//!
//! ### Sessions
//!
//! A [`Session`] owns one document and runs the edit pipeline
//! (validate, stamp, detect, resolve, apply, log) for its participants.
//!
//! ### Reconciliation
//!
//! The [`SyncEngine`] merges two independently evolved replicas and reports
//! which conflicts it resolved and which need a decision.
//!
//! ## Quick Start
//!
//! ```rust
//! use timetable_engine::{ItemDraft, ItemPatch, OpKind, Operation, Session, SessionConfig};
//!
//! let mut session = Session::new("s-1", "timetable-1", Default::default(), SessionConfig::default(), 0);
//! session.join("alice", "Alice", "coordinator", 0).unwrap();
//!
//! let draft = ItemDraft::new("cs101", "09:00-10:00".parse().unwrap(), "Room101", "f-1", "Algorithms");
//! let insert = Operation::new("op-1", OpKind::insert(draft), 1_000);
//! let report = session.apply_edit("alice", insert, 1_000).unwrap();
//! assert!(report.is_success());
//!
//! let update = Operation::new("op-2", OpKind::update("cs101", 1, ItemPatch::default().with_room("Room102")), 2_000);
//! session.apply_edit("alice", update, 2_000).unwrap();
//! assert_eq!(session.document().get("cs101").unwrap().room, "Room102");
//! ```

pub mod clock;
pub mod conflict;
pub mod detect;
pub mod document;
pub mod error;
pub mod item;
pub mod locks;
pub mod operation;
pub mod oplog;
pub mod reconcile;
pub mod resolve;
pub mod session;
pub mod snapshot;
pub mod validation;

// Re-export main types at crate root
pub use clock::{CausalOrder, VectorClock};
pub use conflict::{ConflictKind, ConflictRecord, FieldClash, ResolutionStrategy, Severity};
pub use detect::{ConflictDetector, DetectionContext};
pub use document::{ApplyResult, ScheduleDocument};
pub use error::{Error, ErrorKind};
pub use item::{Attribution, Field, ItemDraft, ItemPatch, ScheduleItem, TimeSlot};
pub use locks::{ItemLock, LockTable};
pub use operation::{DeleteOp, InsertOp, MoveOp, OpKind, OpStatus, OpType, Operation, UpdateOp};
pub use oplog::{ChangeLogEntry, LogEntry, OperationLog};
pub use reconcile::{resolution_ops, ItemSyncReport, ItemSyncStatus, MergedDocument, SyncEngine};
pub use resolve::{ConflictResolver, ResolutionResult, ResolverConfig, Suggestion, SuggestionKind};
pub use session::{
    AuditEntry, AuditOutcome, BatchReport, CursorPosition, EditReport, EditStatus, Participant,
    Session, SessionConfig, SessionState, SessionStatus, TickReport,
};
pub use snapshot::{DocumentSnapshot, SNAPSHOT_FORMAT_VERSION};

/// Type aliases for clarity
pub type ItemId = String;
pub type SiteId = String;
pub type UserId = String;
pub type SessionId = String;
pub type DocumentId = String;
pub type OperationId = String;
pub type Version = u64;
pub type Timestamp = u64;
