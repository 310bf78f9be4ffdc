//! Reconciliation of two independently evolved replicas.
//!
//! This is the core of convergence. Given a local and a remote copy of the
//! same document, this module produces one merged copy and reports which
//! conflicts it settled and which need a decision.
//!
//! # Algorithm
//!
//! For every item id present in either replica (tombstones included):
//!
//! 1. Present on one side only: take it (`local_only` / `remote_only`)
//! 2. Same content on both sides: keep it (`identical`)
//! 3. One item clock dominates: take the dominating side
//!    (`local_newer` / `remote_newer`); equal clocks fall back to version
//! 4. Otherwise the edits were concurrent: classify them like the detector
//!    does and merge. A deletion beats an edit; between two edits, the side
//!    whose `last_modified_by` sorts first wins every diverging field.
//!
//! Finally, room and faculty collisions that exist in the merged data but in
//! neither input are reported as unresolved, with suggestions.
//!
//! Reconciling the merged data with the same remote again changes nothing
//! and reports no conflicts.

use crate::{
    error::Result, Attribution, CausalOrder, ConflictKind, ConflictRecord, ConflictResolver,
    Error, FieldClash, ItemId, ItemPatch, OpKind, Operation, ResolverConfig, ScheduleDocument,
    ScheduleItem, Suggestion, Timestamp, UpdateOp, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How one item was reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSyncStatus {
    LocalOnly,
    RemoteOnly,
    Identical,
    LocalNewer,
    RemoteNewer,
    /// Concurrent edits merged automatically
    Merged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSyncReport {
    pub item_id: ItemId,
    pub status: ItemSyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_version: Option<Version>,
    pub merged_version: Version,
}

/// Result of reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedDocument {
    /// The merged replica
    pub data: ScheduleDocument,
    /// Conflicts settled automatically
    pub conflicts_resolved: Vec<ConflictRecord>,
    /// Conflicts the caller must decide
    pub conflicts_unresolved: Vec<ConflictRecord>,
    /// Alternatives for the unresolved collisions
    pub suggestions: Vec<Suggestion>,
    /// Per-item outcome, in id order
    pub items: Vec<ItemSyncReport>,
}

impl MergedDocument {
    /// True if nothing is left for the caller to decide.
    pub fn is_converged(&self) -> bool {
        self.conflicts_unresolved.is_empty()
    }

    /// Fail with the unresolved conflicts, if any.
    pub fn ensure_converged(&self, applied: usize) -> Result<()> {
        if self.is_converged() {
            Ok(())
        } else {
            Err(Error::SyncDivergence {
                conflicts: self.conflicts_unresolved.clone(),
                applied,
            })
        }
    }

    /// Count of items with the given status.
    pub fn count(&self, status: ItemSyncStatus) -> usize {
        self.items.iter().filter(|item| item.status == status).count()
    }
}

/// Merges replicas.
#[derive(Debug, Clone, Default)]
pub struct SyncEngine {
    resolver: ConflictResolver,
}

impl SyncEngine {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            resolver: ConflictResolver::new(config),
        }
    }

    /// Reconcile two replicas of the same document.
    pub fn reconcile(&self, local: &ScheduleDocument, remote: &ScheduleDocument) -> MergedDocument {
        let mut data = ScheduleDocument::new();
        data.set_clock(local.clock().merged(remote.clock()));

        let mut conflicts_resolved = Vec::new();
        let mut items = Vec::new();

        let ids: BTreeSet<&ItemId> = local
            .all_items()
            .chain(remote.all_items())
            .map(|item| &item.id)
            .collect();

        for id in ids {
            let local_item = local.get_including_deleted(id);
            let remote_item = remote.get_including_deleted(id);

            let (merged, status) = match (local_item, remote_item) {
                (Some(l), None) => (l.clone(), ItemSyncStatus::LocalOnly),
                (None, Some(r)) => (r.clone(), ItemSyncStatus::RemoteOnly),
                (Some(l), Some(r)) => {
                    let (merged, status, conflicts) = merge_item(l, r);
                    conflicts_resolved.extend(conflicts);
                    (merged, status)
                }
                (None, None) => continue,
            };

            items.push(ItemSyncReport {
                item_id: id.clone(),
                status,
                local_version: local_item.map(|item| item.version),
                remote_version: remote_item.map(|item| item.version),
                merged_version: merged.version,
            });
            data.upsert(merged);
        }

        let (conflicts_unresolved, suggestions) = self.new_collisions(&data, local, remote);

        MergedDocument {
            data,
            conflicts_resolved,
            conflicts_unresolved,
            suggestions,
            items,
        }
    }

    /// Room and faculty collisions in `merged` that neither input had.
    ///
    /// For each colliding pair the item with the greater id is the one asked
    /// to move.
    fn new_collisions(
        &self,
        merged: &ScheduleDocument,
        local: &ScheduleDocument,
        remote: &ScheduleDocument,
    ) -> (Vec<ConflictRecord>, Vec<Suggestion>) {
        let mut conflicts = Vec::new();
        let mut suggestions: Vec<Suggestion> = Vec::new();

        for item in merged.items() {
            let room_clash = merged
                .room_occupants(&item.time_slot, &item.room, Some(item.id.as_str()))
                .filter(|other| other.id < item.id)
                .filter(|other| !collides_in(local, &item.id, &other.id, Clash::Room))
                .filter(|other| !collides_in(remote, &item.id, &other.id, Clash::Room))
                .map(|other| ConflictKind::TimeRoomConflict {
                    item_id: item.id.clone(),
                    time_slot: item.time_slot,
                    room: item.room.clone(),
                    existing_item: other.id.clone(),
                });
            let faculty_clash = merged
                .faculty_bookings(&item.time_slot, &item.faculty_id, Some(item.id.as_str()))
                .filter(|other| other.id < item.id)
                .filter(|other| !collides_in(local, &item.id, &other.id, Clash::Faculty))
                .filter(|other| !collides_in(remote, &item.id, &other.id, Clash::Faculty))
                .map(|other| ConflictKind::FacultyConflict {
                    item_id: item.id.clone(),
                    time_slot: item.time_slot,
                    faculty_id: item.faculty_id.clone(),
                    existing_item: other.id.clone(),
                });

            let found: Vec<ConflictKind> = room_clash.chain(faculty_clash).collect();
            if found.is_empty() {
                continue;
            }

            conflicts.extend(
                found
                    .into_iter()
                    .map(|kind| ConflictRecord::new(kind, Vec::new())),
            );
            for suggestion in self.resolver.suggest(
                merged,
                &item.id,
                item.time_slot,
                &item.room,
                &item.faculty_id,
                Some(item.id.as_str()),
            ) {
                if !suggestions.contains(&suggestion) {
                    suggestions.push(suggestion);
                }
            }
        }

        (conflicts, suggestions)
    }
}

#[derive(Clone, Copy)]
enum Clash {
    Room,
    Faculty,
}

fn collides_in(document: &ScheduleDocument, a: &str, b: &str, clash: Clash) -> bool {
    match (document.get(a), document.get(b)) {
        (Some(a), Some(b)) => match clash {
            Clash::Room => a.occupies(&b.time_slot, &b.room),
            Clash::Faculty => a.books_faculty(&b.time_slot, &b.faculty_id),
        },
        _ => false,
    }
}

/// Merge two copies of one item.
fn merge_item(
    local: &ScheduleItem,
    remote: &ScheduleItem,
) -> (ScheduleItem, ItemSyncStatus, Vec<ConflictRecord>) {
    if local.same_content(remote) {
        let mut merged = local.clone();
        merged.version = local.version.max(remote.version);
        merged.clock = local.clock.merged(&remote.clock);
        return (merged, ItemSyncStatus::Identical, Vec::new());
    }

    let order = match local.clock.compare(&remote.clock) {
        CausalOrder::Equal => local.version.cmp(&remote.version).into(),
        order => order,
    };
    match order {
        CausalOrder::Greater => return (local.clone(), ItemSyncStatus::LocalNewer, Vec::new()),
        CausalOrder::Less => return (remote.clone(), ItemSyncStatus::RemoteNewer, Vec::new()),
        CausalOrder::Equal | CausalOrder::Concurrent => {}
    }

    let winner = match (local.deleted, remote.deleted) {
        (true, false) => local,
        (false, true) => remote,
        _ if remote.last_modified_by < local.last_modified_by => remote,
        _ => local,
    };

    let mut merged = winner.clone();
    merged.version = local.version.max(remote.version) + 1;
    merged.clock = local.clock.merged(&remote.clock);
    merged.last_modified = local.last_modified.max(remote.last_modified);

    let mut conflicts = vec![ConflictRecord::new(
        ConflictKind::ConcurrentEdit {
            item_id: local.id.clone(),
            base_version: local.version.min(remote.version),
            current_version: merged.version,
        },
        Vec::new(),
    )];
    let clashes: Vec<FieldClash> = local
        .differing_fields(remote)
        .into_iter()
        .map(|field| FieldClash {
            field,
            incoming: remote.value_of(field),
            current: local.value_of(field),
        })
        .collect();
    if !clashes.is_empty() {
        conflicts.push(ConflictRecord::new(
            ConflictKind::DataConflict {
                item_id: local.id.clone(),
                clashes,
            },
            Vec::new(),
        ));
    }

    (merged, ItemSyncStatus::Merged, conflicts)
}

/// Operations that turn `live` into `merged`.
///
/// The batch is meant for [`Session::apply_batch`], so sync results reach the
/// live document through the edit pipeline. Updates are based on the live
/// versions and credited to the merge winner. Tombstones the live side never
/// saw are not inserted, and live tombstones are never revived.
///
/// [`Session::apply_batch`]: crate::Session::apply_batch
pub fn resolution_ops(
    live: &ScheduleDocument,
    merged: &ScheduleDocument,
    op_prefix: &str,
    now: Timestamp,
) -> Vec<Operation> {
    let mut ops = Vec::new();
    for target in merged.all_items() {
        let kind = match live.get_including_deleted(&target.id) {
            None if target.is_active() => OpKind::insert(target.to_draft()),
            None => continue,
            Some(current) if current.deleted => continue,
            Some(current) if target.deleted => OpKind::delete(target.id.clone(), Some(current.version)),
            Some(current) => {
                let patch = ItemPatch::between(current, target);
                if patch.is_empty() {
                    continue;
                }
                OpKind::Update(UpdateOp {
                    item_id: target.id.clone(),
                    base_version: current.version,
                    patch,
                    attribution: Some(Attribution {
                        site_id: target.last_modified_by.clone(),
                        at: target.last_modified,
                    }),
                })
            }
        };
        let op_id = format!("{op_prefix}-{}", ops.len() + 1);
        ops.push(Operation::new(op_id, kind, now).with_clock(target.clock.clone()));
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ItemDraft, OpStatus, TimeSlot, VectorClock};

    fn slot(s: &str) -> TimeSlot {
        s.parse().unwrap()
    }

    fn item(id: &str, time: &str, room: &str, faculty: &str, site: &str, counter: u64) -> ScheduleItem {
        ScheduleItem::from_draft(
            ItemDraft::new(id, slot(time), room, faculty, "Subject"),
            counter * 1000,
            site,
            VectorClock::from_entries([(site, counter)]),
        )
    }

    #[test]
    fn one_sided_items_are_kept() {
        let local = ScheduleDocument::from_items([item("a", "09:00-10:00", "R1", "f-1", "l", 1)]);
        let remote = ScheduleDocument::from_items([item("b", "11:00-12:00", "R2", "f-2", "r", 1)]);

        let merged = SyncEngine::default().reconcile(&local, &remote);
        assert_eq!(merged.data.len(), 2);
        assert!(merged.conflicts_unresolved.is_empty());
        assert!(merged.conflicts_resolved.is_empty());
        assert_eq!(merged.count(ItemSyncStatus::LocalOnly), 1);
        assert_eq!(merged.count(ItemSyncStatus::RemoteOnly), 1);
        assert_eq!(merged.data.clock().get("l"), 1);
        assert_eq!(merged.data.clock().get("r"), 1);
    }

    #[test]
    fn dominating_side_wins() {
        let base = item("a", "09:00-10:00", "R1", "f-1", "l", 1);
        let mut newer = base.clone();
        newer.room = "R9".into();
        newer.version = 2;
        newer.clock = VectorClock::from_entries([("l", 1), ("r", 1)]);

        let local = ScheduleDocument::from_items([base]);
        let remote = ScheduleDocument::from_items([newer]);
        let merged = SyncEngine::default().reconcile(&local, &remote);
        assert_eq!(merged.items[0].status, ItemSyncStatus::RemoteNewer);
        assert_eq!(merged.data.get("a").unwrap().room, "R9");
        assert!(merged.conflicts_resolved.is_empty());
    }

    #[test]
    fn concurrent_edits_lowest_site_wins() {
        let base = item("a", "09:00-10:00", "R1", "f-1", "origin", 1);
        let mut by_zed = base.clone();
        by_zed.room = "R2".into();
        by_zed.version = 2;
        by_zed.last_modified_by = "zed".into();
        by_zed.clock = VectorClock::from_entries([("origin", 1), ("zed", 1)]);
        let mut by_amy = base.clone();
        by_amy.room = "R3".into();
        by_amy.version = 3;
        by_amy.last_modified_by = "amy".into();
        by_amy.clock = VectorClock::from_entries([("origin", 1), ("amy", 2)]);

        let local = ScheduleDocument::from_items([by_zed]);
        let remote = ScheduleDocument::from_items([by_amy]);
        let merged = SyncEngine::default().reconcile(&local, &remote);

        let result = merged.data.get("a").unwrap();
        assert_eq!(result.room, "R3");
        assert_eq!(result.version, 4);
        assert_eq!(
            result.clock,
            VectorClock::from_entries([("origin", 1), ("zed", 1), ("amy", 2)])
        );
        assert_eq!(merged.items[0].status, ItemSyncStatus::Merged);
        let kinds: Vec<_> = merged
            .conflicts_resolved
            .iter()
            .map(|c| c.kind.as_str())
            .collect();
        assert_eq!(kinds, vec!["concurrent_edit", "data_conflict"]);
        assert!(merged.is_converged());
    }

    #[test]
    fn deletion_beats_concurrent_edit() {
        let base = item("a", "09:00-10:00", "R1", "f-1", "origin", 1);
        let mut deleted = base.clone();
        deleted.deleted = true;
        deleted.version = 2;
        deleted.last_modified_by = "zed".into();
        deleted.clock = VectorClock::from_entries([("origin", 1), ("zed", 1)]);
        let mut edited = base.clone();
        edited.subject = "Other".into();
        edited.version = 2;
        edited.last_modified_by = "amy".into();
        edited.clock = VectorClock::from_entries([("origin", 1), ("amy", 1)]);

        let merged = SyncEngine::default().reconcile(
            &ScheduleDocument::from_items([edited]),
            &ScheduleDocument::from_items([deleted]),
        );
        assert!(merged.data.get("a").is_none());
        assert!(merged.data.get_including_deleted("a").unwrap().deleted);
    }

    #[test]
    fn new_collisions_are_unresolved_with_suggestions() {
        let local = ScheduleDocument::from_items([item("a", "10:00-11:00", "R2", "f-1", "l", 1)]);
        let remote = ScheduleDocument::from_items([item("b", "10:00-11:00", "R2", "f-2", "r", 1)]);

        let engine = SyncEngine::new(ResolverConfig::default().with_rooms(["R3"]));
        let merged = engine.reconcile(&local, &remote);
        assert_eq!(merged.data.len(), 2);
        assert_eq!(merged.conflicts_unresolved.len(), 1);
        assert_eq!(merged.conflicts_unresolved[0].item_id(), "b");
        assert_eq!(merged.suggestions.len(), 2);
        assert!(matches!(
            merged.ensure_converged(0),
            Err(Error::SyncDivergence { .. })
        ));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let base = item("a", "09:00-10:00", "R1", "f-1", "origin", 1);
        let mut by_zed = base.clone();
        by_zed.room = "R2".into();
        by_zed.version = 2;
        by_zed.last_modified_by = "zed".into();
        by_zed.clock = VectorClock::from_entries([("origin", 1), ("zed", 1)]);
        let mut by_amy = base;
        by_amy.subject = "Other".into();
        by_amy.version = 2;
        by_amy.last_modified_by = "amy".into();
        by_amy.clock = VectorClock::from_entries([("origin", 1), ("amy", 1)]);

        let local = ScheduleDocument::from_items([
            by_zed,
            item("b", "12:00-13:00", "R5", "f-5", "l", 1),
        ]);
        let remote = ScheduleDocument::from_items([
            by_amy,
            item("c", "12:00-13:00", "R5", "f-6", "r", 1),
        ]);

        let engine = SyncEngine::default();
        let first = engine.reconcile(&local, &remote);
        let second = engine.reconcile(&first.data, &remote);
        assert_eq!(second.data, first.data);
        assert!(second.conflicts_resolved.is_empty());
        assert!(second.conflicts_unresolved.is_empty());
    }

    #[test]
    fn resolution_ops_cover_insert_update_delete() {
        let keep = item("a", "09:00-10:00", "R1", "f-1", "l", 1);
        let gone = item("b", "10:00-11:00", "R1", "f-1", "l", 2);
        let live = ScheduleDocument::from_items([keep.clone(), gone.clone()]);

        let mut moved = keep;
        moved.room = "R7".into();
        moved.version = 2;
        moved.last_modified_by = "r".into();
        let mut tomb = gone;
        tomb.deleted = true;
        tomb.version = 2;
        let fresh = item("c", "13:00-14:00", "R1", "f-2", "r", 1);
        let merged = ScheduleDocument::from_items([moved, tomb, fresh]);

        let ops = resolution_ops(&live, &merged, "sync", 5000);
        let summary: Vec<_> = ops
            .iter()
            .map(|op| (op.op_id.as_str(), op.op_type().as_str(), op.target_item_id().as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("sync-1", "update", "a"),
                ("sync-2", "delete", "b"),
                ("sync-3", "insert", "c"),
            ]
        );
        assert_eq!(ops[0].base_version(), Some(1));
        assert_eq!(ops[0].attribution().site_id, "r");
        assert!(ops.iter().all(|op| op.status == OpStatus::Pending));

        assert!(resolution_ops(&merged, &merged, "sync", 5000).is_empty());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        const ROOMS: [&str; 3] = ["R1", "R2", "R3"];
        const SITES: [&str; 3] = ["amy", "bob", "zed"];

        /// One replica: items a..d, each maybe present, edited by some site.
        fn arb_replica() -> impl Strategy<Value = ScheduleDocument> {
            prop::collection::vec(
                (any::<bool>(), 0usize..3, 8u16..12, 0usize..3, 1u64..4, any::<bool>()),
                4,
            )
            .prop_map(|specs| {
                let items = specs.into_iter().enumerate().filter_map(
                    |(i, (present, room, hour, site, counter, deleted))| {
                        if !present {
                            return None;
                        }
                        let id = ["a", "b", "c", "d"][i];
                        let slot = TimeSlot::new(hour * 60, hour * 60 + 60).ok()?;
                        let mut item = ScheduleItem::from_draft(
                            ItemDraft::new(id, slot, ROOMS[room], format!("f-{i}"), "S"),
                            counter * 1000,
                            SITES[site],
                            VectorClock::from_entries([(SITES[site], counter)]),
                        );
                        item.version = counter;
                        item.deleted = deleted && counter > 1;
                        Some(item)
                    },
                );
                ScheduleDocument::from_items(items)
            })
        }

        proptest! {
            #[test]
            fn prop_reconcile_is_idempotent(local in arb_replica(), remote in arb_replica()) {
                let engine = SyncEngine::default();
                let first = engine.reconcile(&local, &remote);
                let second = engine.reconcile(&first.data, &remote);
                prop_assert_eq!(&second.data, &first.data);
                prop_assert!(second.conflicts_resolved.is_empty());
                prop_assert!(second.conflicts_unresolved.is_empty());
            }

            #[test]
            fn prop_reconcile_keeps_every_item(local in arb_replica(), remote in arb_replica()) {
                let merged = SyncEngine::default().reconcile(&local, &remote);
                for item in local.all_items().chain(remote.all_items()) {
                    prop_assert!(merged.data.contains(&item.id));
                }
            }
        }
    }
}
