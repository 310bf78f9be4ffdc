//! End-to-end scenarios for timetable-engine
//!
//! These tests drive sessions and the sync engine the way the server does.

use timetable_engine::{
    resolution_ops, CausalOrder, ConflictKind, DocumentSnapshot, EditStatus, Error, ItemDraft,
    ItemPatch, ItemSyncStatus, OpKind, OpStatus, Operation, ResolverConfig, ScheduleDocument,
    Session, SessionConfig, SuggestionKind, SyncEngine, TimeSlot, VectorClock,
};

fn slot(s: &str) -> TimeSlot {
    s.parse().unwrap()
}

fn session_with(users: &[&str]) -> Session {
    let mut session = Session::new(
        "s-1",
        "timetable-1",
        ScheduleDocument::new(),
        SessionConfig::default(),
        0,
    );
    for user in users {
        session.join(*user, user.to_uppercase(), "coordinator", 0).unwrap();
    }
    session
}

fn insert(op_id: &str, id: &str, time: &str, room: &str, faculty: &str) -> Operation {
    Operation::new(
        op_id,
        OpKind::insert(ItemDraft::new(id, slot(time), room, faculty, "Subject")),
        0,
    )
}

fn set_room(op_id: &str, id: &str, base: u64, room: &str) -> Operation {
    Operation::new(
        op_id,
        OpKind::update(id, base, ItemPatch::default().with_room(room)),
        0,
    )
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn scenario_concurrent_room_updates_merge_deterministically() {
    let mut session = session_with(&["site-a", "site-b", "setup"]);
    session
        .apply_edit("setup", insert("op-0", "item_1", "09:00-10:00", "Room100", "f-1"), 10)
        .unwrap();

    session
        .apply_edit("site-b", set_room("op-b", "item_1", 1, "Room102"), 20)
        .unwrap();
    let report = session
        .apply_edit("site-a", set_room("op-a", "item_1", 1, "Room101"), 30)
        .unwrap();

    assert!(report.is_success());
    let merged = report.applied_operation.unwrap();
    assert_eq!(merged.status, OpStatus::Merged);
    assert_eq!(merged.merged_from, vec!["op-a".to_string(), "op-b".to_string()]);

    let item = session.document().get("item_1").unwrap();
    assert_eq!(item.room, "Room101");
    assert_eq!(item.version, 3);
    assert_eq!(item.last_modified_by, "site-a");
}

#[test]
fn scenario_duplicate_id_is_regenerated() {
    let mut session = session_with(&["alice", "bob"]);
    session
        .apply_edit("alice", insert("op-1", "item_1", "13:00-14:00", "Room300", "f-9"), 10)
        .unwrap();

    let report = session
        .apply_edit("bob", insert("op-2", "item_1", "09:00-10:00", "Room101", "f-1"), 20)
        .unwrap();

    assert!(report.is_success());
    assert!(matches!(report.conflicts[0].kind, ConflictKind::DuplicateId { .. }));
    let applied = report.applied_operation.unwrap();
    assert_eq!(applied.target_item_id(), "item_1-2");

    let regenerated = session.document().get("item_1-2").unwrap();
    assert_eq!(regenerated.room, "Room101");
    assert_eq!(session.document().get("item_1").unwrap().room, "Room300");
}

#[test]
fn scenario_time_room_collision_offers_two_alternatives() {
    let mut session = Session::new(
        "s-1",
        "timetable-1",
        ScheduleDocument::new(),
        SessionConfig {
            resolver: ResolverConfig::default().with_rooms(["Room101", "Room102", "Room103"]),
            ..SessionConfig::default()
        },
        0,
    );
    session.join("alice", "Alice", "coordinator", 0).unwrap();
    session.join("bob", "Bob", "coordinator", 0).unwrap();
    session
        .apply_edit("alice", insert("op-1", "cs101", "10:00-11:00", "Room102", "f-1"), 10)
        .unwrap();

    let report = session
        .apply_edit("bob", insert("op-2", "cs102", "10:00-11:00", "Room102", "f-2"), 20)
        .unwrap();

    assert_eq!(report.status, EditStatus::Conflict);
    assert!(matches!(
        report.conflicts[0].kind,
        ConflictKind::TimeRoomConflict { .. }
    ));
    let resolution = report.resolution.unwrap();
    assert!(!resolution.resolved);
    let kinds: Vec<_> = resolution.suggestions.iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![SuggestionKind::ShiftTime, SuggestionKind::ReassignRoom]);
    assert_eq!(resolution.suggestions[0].time_slot, slot("11:00-12:00"));
    assert_eq!(resolution.suggestions[1].room, "Room101");
    assert!(session.document().get("cs102").is_none());

    // Taking a suggestion goes through cleanly.
    let retry = resolution.suggestions[1]
        .apply_to(&insert("op-3", "cs102", "10:00-11:00", "Room102", "f-2"))
        .unwrap();
    assert!(session.apply_edit("bob", retry, 30).unwrap().is_success());
}

#[test]
fn scenario_reconcile_one_sided_replicas() {
    let mut local = session_with(&["local"]);
    local
        .apply_edit("local", insert("l-1", "local_item", "09:00-10:00", "Room101", "f-1"), 10)
        .unwrap();
    let mut remote = session_with(&["remote"]);
    remote
        .apply_edit("remote", insert("r-1", "remote_item", "11:00-12:00", "Room102", "f-2"), 10)
        .unwrap();

    let merged = SyncEngine::default().reconcile(local.document(), remote.document());
    assert_eq!(merged.data.len(), 2);
    assert!(merged.conflicts_unresolved.is_empty());
    assert_eq!(merged.count(ItemSyncStatus::LocalOnly), 1);
    assert_eq!(merged.count(ItemSyncStatus::RemoteOnly), 1);
}

// ============================================================================
// Properties
// ============================================================================

#[test]
fn same_actor_operations_are_causally_ordered() {
    let mut session = session_with(&["alice", "bob"]);
    let mut clocks = Vec::new();
    let ops = [
        insert("op-1", "cs101", "09:00-10:00", "Room101", "f-1"),
        set_room("op-2", "cs101", 1, "Room102"),
        set_room("op-3", "cs101", 2, "Room103"),
    ];
    for op in ops {
        let report = session.apply_edit("alice", op, 10).unwrap();
        clocks.push(report.applied_operation.unwrap().clock);
    }
    for pair in clocks.windows(2) {
        assert_eq!(pair[0].compare(&pair[1]), CausalOrder::Less);
    }
}

#[test]
fn merge_is_identical_in_both_submission_orders() {
    let run = |first: (&str, Operation), second: (&str, Operation)| {
        let mut session = session_with(&["alice", "bob", "setup"]);
        session
            .apply_edit("setup", insert("op-0", "cs101", "09:00-10:00", "Room100", "f-1"), 10)
            .unwrap();
        session.apply_edit(first.0, first.1, 20).unwrap();
        session.apply_edit(second.0, second.1, 30).unwrap();
        serde_json::to_string(session.document().get("cs101").unwrap()).unwrap()
    };

    let mut a = set_room("op-a", "cs101", 1, "Room101");
    a.created_at = 15;
    let b = Operation::new(
        "op-b",
        OpKind::update(
            "cs101",
            1,
            ItemPatch::default().with_room("Room102").with_subject("Graphs"),
        ),
        25,
    );

    let ab = run(("alice", a.clone()), ("bob", b.clone()));
    let ba = run(("bob", b), ("alice", a));
    assert_eq!(ab, ba);
    assert!(ab.contains(r#""room":"Room101""#));
    assert!(ab.contains(r#""subject":"Graphs""#));
}

#[test]
fn operations_on_different_items_are_not_conflicts() {
    let mut session = session_with(&["alice", "bob", "setup"]);
    session
        .apply_edit("setup", insert("op-1", "cs101", "09:00-10:00", "Room101", "f-1"), 10)
        .unwrap();
    session
        .apply_edit("setup", insert("op-2", "cs102", "09:00-10:00", "Room102", "f-2"), 10)
        .unwrap();

    let a = Operation::new(
        "op-a",
        OpKind::update("cs101", 1, ItemPatch::default().with_time_slot(slot("13:00-14:00"))),
        0,
    );
    let b = Operation::new(
        "op-b",
        OpKind::update("cs102", 1, ItemPatch::default().with_time_slot(slot("15:00-16:00"))),
        0,
    );
    let ra = session.apply_edit("alice", a, 20).unwrap();
    let rb = session.apply_edit("bob", b, 20).unwrap();

    assert!(ra.conflicts.is_empty());
    assert!(rb.conflicts.is_empty());
    assert_eq!(session.document().get("cs101").unwrap().time_slot, slot("13:00-14:00"));
    assert_eq!(session.document().get("cs102").unwrap().time_slot, slot("15:00-16:00"));
    assert!(ra
        .applied_operation
        .unwrap()
        .clock
        .is_concurrent_with(&rb.applied_operation.unwrap().clock));
}

#[test]
fn locked_item_cannot_be_deleted_by_others() {
    let mut session = session_with(&["alice", "bob"]);
    session
        .apply_edit("alice", insert("op-1", "cs101", "09:00-10:00", "Room101", "f-1"), 10)
        .unwrap();
    session.acquire_lock("alice", "cs101", 20).unwrap();
    let before = session.document().clone();

    let report = session
        .apply_edit("bob", Operation::new("op-2", OpKind::delete("cs101", None), 0), 30)
        .unwrap();

    assert_eq!(report.status, EditStatus::Conflict);
    assert!(matches!(report.conflicts[0].kind, ConflictKind::LockedItem { .. }));
    assert!(report.resolution.unwrap().estimated_wait_ms.is_some());
    assert_eq!(session.document(), &before);

    // The holder can still delete.
    let report = session
        .apply_edit("alice", Operation::new("op-3", OpKind::delete("cs101", None), 0), 40)
        .unwrap();
    assert!(report.is_success());
}

#[test]
fn stale_move_is_rejected_not_merged() {
    let mut session = session_with(&["alice", "bob", "zed"]);
    session
        .apply_edit("alice", insert("op-1", "cs101", "09:00-10:00", "Room101", "f-1"), 10)
        .unwrap();
    session
        .apply_edit("alice", insert("op-2", "cs200", "11:00-12:00", "Room105", "f-2"), 20)
        .unwrap();
    session
        .apply_edit("bob", set_room("op-3", "cs101", 1, "Room105"), 30)
        .unwrap();
    let before = session.document().clone();
    let change_count = session.log().len();

    // The destination is free, but the move is based on a version bob replaced.
    let stale_move = Operation::new(
        "op-4",
        OpKind::relocate("cs101", Some(1), slot("11:00-12:00"), "Room102"),
        0,
    );
    let err = session.apply_edit("zed", stale_move, 40).unwrap_err();

    assert!(matches!(err, Error::VersionMismatch { expected: 1, actual: 2 }));
    assert_eq!(session.document(), &before);
    assert_eq!(session.log().len(), change_count);
    let cs101 = session.document().get("cs101").unwrap();
    assert_eq!(cs101.time_slot, slot("09:00-10:00"));
    assert_eq!(cs101.room, "Room105");

    // Rebased on the current version, the same move goes through.
    let rebased = Operation::new(
        "op-5",
        OpKind::relocate("cs101", Some(2), slot("11:00-12:00"), "Room102"),
        0,
    );
    let report = session.apply_edit("zed", rebased, 50).unwrap();
    assert!(report.is_success());
    assert_eq!(report.version, Some(3));
    let evening = slot("11:00-12:00");
    let sharing_cs200 = session
        .document()
        .room_occupants(&evening, "Room105", Some("cs200"))
        .count();
    assert_eq!(sharing_cs200, 0);
}

#[test]
fn reconcile_then_apply_through_pipeline() {
    let mut live = session_with(&["alice"]);
    live.apply_edit("alice", insert("op-1", "cs101", "09:00-10:00", "Room101", "f-1"), 10)
        .unwrap();

    // An offline replica forked from the live copy and kept working.
    let snapshot = DocumentSnapshot::from_document(live.document(), "timetable-1", "laptop", 20);
    let mut offline = Session::new(
        "s-offline",
        "timetable-1",
        snapshot.into_document().unwrap(),
        SessionConfig::default(),
        20,
    );
    offline.join("bob", "Bob", "faculty", 20).unwrap();
    offline
        .apply_edit("bob", set_room("op-b", "cs101", 1, "Room202"), 30)
        .unwrap();
    offline
        .apply_edit("bob", insert("op-c", "cs102", "11:00-12:00", "Room202", "f-2"), 40)
        .unwrap();

    let engine = SyncEngine::default();
    let merged = engine.reconcile(live.document(), offline.document());
    assert!(merged.is_converged());

    let ops = resolution_ops(live.document(), &merged.data, "sync-laptop", 50);
    assert_eq!(ops.len(), 2);
    let batch = live.apply_batch("laptop", ops, 50).unwrap();
    assert_eq!(batch.applied.len(), 2);
    assert!(batch.failed.is_empty());

    assert_eq!(live.document().get("cs101").unwrap().room, "Room202");
    assert!(live.document().get("cs102").is_some());
    assert_eq!(live.change_log(10).len(), 3);

    // Nothing left to do on a second pass.
    let again = engine.reconcile(live.document(), offline.document());
    assert!(again.conflicts_resolved.is_empty());
    assert!(resolution_ops(live.document(), &again.data, "sync-laptop", 60).is_empty());
}

#[test]
fn unresolved_sync_surfaces_divergence() {
    let local = ScheduleDocument::from_items([timetable_engine::ScheduleItem::from_draft(
        ItemDraft::new("a", slot("10:00-11:00"), "Room1", "f-1", "S"),
        0,
        "l",
        VectorClock::from_entries([("l", 1)]),
    )]);
    let remote = ScheduleDocument::from_items([timetable_engine::ScheduleItem::from_draft(
        ItemDraft::new("b", slot("10:30-11:30"), "Room1", "f-2", "S"),
        0,
        "r",
        VectorClock::from_entries([("r", 1)]),
    )]);

    let merged = SyncEngine::default().reconcile(&local, &remote);
    match merged.ensure_converged(2) {
        Err(Error::SyncDivergence { conflicts, applied }) => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(applied, 2);
        }
        other => panic!("expected divergence, got {other:?}"),
    }
}
