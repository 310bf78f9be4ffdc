//! Conflict detection.
//!
//! Detection classifies a candidate operation against the current document,
//! the operation log and the lock table. It is read-only: nothing it touches
//! is mutated, and the same inputs always give the same records in the same
//! order.

use crate::{
    ConflictKind, ConflictRecord, FieldClash, ItemPatch, LockTable, OpKind, Operation,
    OperationLog, ScheduleDocument, ScheduleItem, Timestamp, Version,
};

/// The state an operation is checked against.
#[derive(Debug, Clone, Copy)]
pub struct DetectionContext<'a> {
    pub document: &'a ScheduleDocument,
    pub log: &'a OperationLog,
    pub locks: &'a LockTable,
    pub now: Timestamp,
}

/// Classifies conflicts by operation type.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    /// All conflicts `op` would cause if applied now.
    pub fn detect(ctx: &DetectionContext<'_>, op: &Operation) -> Vec<ConflictRecord> {
        match &op.kind {
            OpKind::Insert(insert) => {
                let draft = &insert.item;
                let mut conflicts = Vec::new();
                if ctx.document.contains(&draft.id) {
                    conflicts.push(ConflictRecord::new(
                        ConflictKind::DuplicateId {
                            item_id: draft.id.clone(),
                        },
                        vec![op.op_id.clone()],
                    ));
                }
                for existing in ctx.document.room_occupants(&draft.time_slot, &draft.room, None) {
                    conflicts.push(ConflictRecord::new(
                        ConflictKind::TimeRoomConflict {
                            item_id: draft.id.clone(),
                            time_slot: draft.time_slot,
                            room: draft.room.clone(),
                            existing_item: existing.id.clone(),
                        },
                        vec![op.op_id.clone()],
                    ));
                }
                for existing in
                    ctx.document
                        .faculty_bookings(&draft.time_slot, &draft.faculty_id, None)
                {
                    conflicts.push(ConflictRecord::new(
                        ConflictKind::FacultyConflict {
                            item_id: draft.id.clone(),
                            time_slot: draft.time_slot,
                            faculty_id: draft.faculty_id.clone(),
                            existing_item: existing.id.clone(),
                        },
                        vec![op.op_id.clone()],
                    ));
                }
                conflicts
            }
            OpKind::Update(update) => {
                Self::detect_stale(ctx, op, update.base_version, &update.patch)
            }
            OpKind::Delete(delete) => {
                let mut conflicts = Vec::new();
                if let Some(lock) = ctx.locks.holder(&delete.item_id, ctx.now) {
                    if lock.holder != op.user_id {
                        conflicts.push(ConflictRecord::new(
                            ConflictKind::LockedItem {
                                item_id: delete.item_id.clone(),
                                holder: lock.holder.clone(),
                                expires_at: lock.expires_at,
                            },
                            vec![op.op_id.clone()],
                        ));
                    }
                }
                let dependents = ctx.document.dependents_of(&delete.item_id);
                if !dependents.is_empty() {
                    conflicts.push(ConflictRecord::new(
                        ConflictKind::DependencyConflict {
                            item_id: delete.item_id.clone(),
                            dependents,
                        },
                        vec![op.op_id.clone()],
                    ));
                }
                conflicts
            }
            // Moves are never merged. A stale base version fails on apply.
            OpKind::Move(relocate) => {
                let mut conflicts = Vec::new();
                let occupants = ctx.document.room_occupants(
                    &relocate.time_slot,
                    &relocate.room,
                    Some(relocate.item_id.as_str()),
                );
                for occupant in occupants {
                    conflicts.push(ConflictRecord::new(
                        ConflictKind::PositionOccupied {
                            item_id: relocate.item_id.clone(),
                            time_slot: relocate.time_slot,
                            room: relocate.room.clone(),
                            occupant: occupant.id.clone(),
                        },
                        vec![op.op_id.clone()],
                    ));
                }
                conflicts
            }
        }
    }

    /// `concurrent_edit` and `data_conflict` for an edit based on an old version.
    fn detect_stale(
        ctx: &DetectionContext<'_>,
        op: &Operation,
        base_version: Version,
        patch: &ItemPatch,
    ) -> Vec<ConflictRecord> {
        let item_id = op.target_item_id();
        let current = match ctx.document.get(item_id) {
            Some(item) if item.version > base_version => item,
            _ => return Vec::new(),
        };

        let mut involved: Vec<_> = ctx
            .log
            .applied_since(item_id, base_version)
            .into_iter()
            .map(|entry| entry.operation.op_id.clone())
            .collect();
        involved.push(op.op_id.clone());

        let mut conflicts = vec![ConflictRecord::new(
            ConflictKind::ConcurrentEdit {
                item_id: item_id.clone(),
                base_version,
                current_version: current.version,
            },
            involved.clone(),
        )];

        let clashes = field_clashes(ctx.log.state_at(item_id, base_version), current, patch);
        if !clashes.is_empty() {
            conflicts.push(ConflictRecord::new(
                ConflictKind::DataConflict {
                    item_id: item_id.clone(),
                    clashes,
                },
                involved,
            ));
        }
        conflicts
    }
}

/// Fields the patch writes that changed since `base` and differ from `current`.
///
/// Without a logged base state every differing written field counts.
fn field_clashes(
    base: Option<&ScheduleItem>,
    current: &ScheduleItem,
    patch: &ItemPatch,
) -> Vec<FieldClash> {
    patch
        .fields()
        .into_iter()
        .filter_map(|field| {
            let incoming = patch.value_of(field)?;
            let now = current.value_of(field);
            let changed_since_base = base.map_or(true, |base| base.value_of(field) != now);
            (incoming != now && changed_since_base).then(|| FieldClash {
                field,
                incoming,
                current: now,
            })
        })
        .collect()
}
