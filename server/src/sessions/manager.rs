//! Concurrent registry of live sessions.
//!
//! Each session sits behind its own async mutex, so edits within a session
//! are serialized while different sessions proceed in parallel. Events are
//! published while the mutex is held, which keeps every participant's view
//! in commit order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use timetable_engine::{
    resolution_ops, CausalOrder, ChangeLogEntry, ConflictRecord, CursorPosition, DocumentId,
    DocumentSnapshot, EditReport, ItemLock, ItemSyncReport, Operation, OperationId, Participant,
    ScheduleDocument, Session, SessionConfig, SessionId, SessionState, SessionStatus, SiteId,
    Suggestion, SyncEngine, Timestamp, VectorClock,
};

use super::{now_ms, Broadcaster};
use crate::db::DocumentStore;
use crate::error::{AppError, Result};
use crate::websocket::ServerMessage;

type SessionHandle = Arc<Mutex<Session>>;

/// How the two replicas related before a reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteSyncStatus {
    UpToDate,
    LocalAhead,
    RemoteAhead,
    Diverged,
}

impl From<CausalOrder> for SiteSyncStatus {
    fn from(order: CausalOrder) -> Self {
        match order {
            CausalOrder::Equal => SiteSyncStatus::UpToDate,
            CausalOrder::Greater => SiteSyncStatus::LocalAhead,
            CausalOrder::Less => SiteSyncStatus::RemoteAhead,
            CausalOrder::Concurrent => SiteSyncStatus::Diverged,
        }
    }
}

/// Clock comparison with one remote site.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteSyncResult {
    pub site_id: SiteId,
    pub local_clock: VectorClock,
    pub remote_clock: VectorClock,
    /// Per-site `remote - local`
    pub clock_difference: BTreeMap<SiteId, i64>,
    pub sync_status: SiteSyncStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileStatus {
    Success,
    Partial,
}

/// Outcome of [`SessionManager::reconcile`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub status: ReconcileStatus,
    pub sync_results: Vec<SiteSyncResult>,
    pub applied_operations: Vec<Operation>,
    pub failed_operations: Vec<OperationId>,
    pub conflicts_resolved: Vec<ConflictRecord>,
    pub conflicts_unresolved: Vec<ConflictRecord>,
    pub suggestions: Vec<Suggestion>,
    pub items: Vec<ItemSyncReport>,
}

/// What one reaper pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub idled: Vec<SessionId>,
    pub closed: Vec<SessionId>,
    pub removed_participants: usize,
    pub expired_locks: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.idled.is_empty()
            && self.closed.is_empty()
            && self.removed_participants == 0
            && self.expired_locks == 0
    }
}

/// Registry of live sessions.
pub struct SessionManager {
    sessions: DashMap<SessionId, SessionHandle>,
    store: DocumentStore,
    broadcaster: Arc<dyn Broadcaster>,
    session_config: SessionConfig,
    site_id: SiteId,
    sync: SyncEngine,
}

impl SessionManager {
    pub fn new(
        store: DocumentStore,
        broadcaster: Arc<dyn Broadcaster>,
        session_config: SessionConfig,
        site_id: impl Into<SiteId>,
    ) -> Self {
        let sync = SyncEngine::new(session_config.resolver.clone());
        Self {
            sessions: DashMap::new(),
            store,
            broadcaster,
            session_config,
            site_id: site_id.into(),
            sync,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Open a session on a document, loading its last saved state, with the
    /// creator as first participant.
    pub async fn create_session(
        &self,
        document_id: Option<DocumentId>,
        user_id: &str,
        user_name: &str,
        role: &str,
        now: Timestamp,
    ) -> Result<SessionStatus> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let document_id = document_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let document = match self.store.load(&document_id, &self.site_id).await? {
            Some(snapshot) => snapshot.into_document()?,
            None => ScheduleDocument::new(),
        };

        let mut session = Session::new(
            session_id.clone(),
            document_id.clone(),
            document,
            self.session_config.clone(),
            now,
        );
        session.join(user_id, user_name, role, now)?;
        let status = session.status(now);

        self.sessions
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));

        tracing::info!(
            session_id = %session_id,
            document_id = %document_id,
            user_id = %user_id,
            items = status.item_count,
            "Session created"
        );

        Ok(status)
    }

    pub async fn join_session(
        &self,
        session_id: &str,
        user_id: &str,
        user_name: &str,
        role: &str,
        now: Timestamp,
    ) -> Result<SessionStatus> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock().await;

        let participant = session.join(user_id, user_name, role, now)?;
        self.broadcaster.publish(
            session_id,
            Some(user_id),
            ServerMessage::ParticipantJoined { participant },
        );

        tracing::info!(session_id = %session_id, user_id = %user_id, "Participant joined");
        Ok(session.status(now))
    }

    pub async fn leave_session(
        &self,
        session_id: &str,
        user_id: &str,
        now: Timestamp,
    ) -> Result<Participant> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock().await;

        let participant = session.leave(user_id, now)?;
        self.broadcaster.publish(
            session_id,
            Some(user_id),
            ServerMessage::ParticipantLeft {
                user_id: user_id.to_string(),
            },
        );

        tracing::info!(session_id = %session_id, user_id = %user_id, "Participant left");
        Ok(participant)
    }

    /// Run an edit through the session pipeline and announce the outcome.
    pub async fn apply_edit(
        &self,
        session_id: &str,
        user_id: &str,
        mut operation: Operation,
        now: Timestamp,
    ) -> Result<EditReport> {
        if operation.op_id.is_empty() {
            operation.op_id = uuid::Uuid::new_v4().to_string();
        }
        let op_id = operation.op_id.clone();

        let handle = self.session(session_id)?;
        let mut session = handle.lock().await;

        let report = session.apply_edit(user_id, operation, now).map_err(|e| {
            tracing::warn!(
                session_id = %session_id,
                user_id = %user_id,
                op_id = %op_id,
                error = %e,
                "Edit rejected"
            );
            e
        })?;

        tracing::info!(
            session_id = %session_id,
            user_id = %user_id,
            op_id = %op_id,
            status = ?report.status,
            conflicts = report.conflicts.len(),
            "Edit processed"
        );

        if let (Some(operation), Some(version)) = (&report.applied_operation, report.version) {
            self.broadcaster.publish(
                session_id,
                Some(user_id),
                ServerMessage::OperationApplied {
                    operation: operation.clone(),
                    version,
                },
            );
        }

        if report.requires_manual_intervention() {
            let suggestions = report
                .resolution
                .as_ref()
                .map(|resolution| resolution.suggestions.clone())
                .unwrap_or_default();
            self.broadcaster.publish(
                session_id,
                None,
                ServerMessage::ManualInterventionRequired {
                    user_id: user_id.to_string(),
                    op_id,
                    conflicts: report.conflicts.clone(),
                    suggestions,
                },
            );
        }

        Ok(report)
    }

    pub async fn update_cursor(
        &self,
        session_id: &str,
        user_id: &str,
        cursor: CursorPosition,
        now: Timestamp,
    ) -> Result<()> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock().await;

        session.update_cursor(user_id, cursor.clone(), now)?;
        self.broadcaster.publish(
            session_id,
            Some(user_id),
            ServerMessage::CursorMoved {
                user_id: user_id.to_string(),
                cursor,
            },
        );
        Ok(())
    }

    pub async fn acquire_lock(
        &self,
        session_id: &str,
        user_id: &str,
        item_id: &str,
        now: Timestamp,
    ) -> Result<ItemLock> {
        let handle = self.session(session_id)?;
        let lock = handle.lock().await.acquire_lock(user_id, item_id, now)?;

        tracing::debug!(
            session_id = %session_id,
            user_id = %user_id,
            item_id = %item_id,
            expires_at = lock.expires_at,
            "Lock acquired"
        );
        Ok(lock)
    }

    pub async fn release_lock(
        &self,
        session_id: &str,
        user_id: &str,
        item_id: &str,
        now: Timestamp,
    ) -> Result<bool> {
        let handle = self.session(session_id)?;
        let released = handle.lock().await.release_lock(user_id, item_id, now)?;

        tracing::debug!(
            session_id = %session_id,
            user_id = %user_id,
            item_id = %item_id,
            released,
            "Lock release"
        );
        Ok(released)
    }

    pub async fn get_status(&self, session_id: &str, now: Timestamp) -> Result<SessionStatus> {
        let handle = self.session(session_id)?;
        let status = handle.lock().await.status(now);
        Ok(status)
    }

    pub async fn get_change_log(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChangeLogEntry>> {
        let handle = self.session(session_id)?;
        let changes = handle.lock().await.change_log(limit);
        Ok(changes)
    }

    /// Record that a participant is still connected.
    pub async fn touch(&self, session_id: &str, user_id: &str, now: Timestamp) -> Result<()> {
        let handle = self.session(session_id)?;
        handle.lock().await.touch(user_id, now)?;
        Ok(())
    }

    /// True if `user_id` currently participates in the session.
    pub async fn is_participant(&self, session_id: &str, user_id: &str) -> Result<bool> {
        let handle = self.session(session_id)?;
        let present = handle.lock().await.is_participant(user_id);
        Ok(present)
    }

    /// Merge a remote replica into the session's document.
    ///
    /// The replica is taken from `snapshot` when given, else loaded from the
    /// store under `remote_site_id`. The merge runs on a copy without holding
    /// the session; the resulting operations then go through the normal edit
    /// pipeline, so edits committed in between are merged, not overwritten.
    pub async fn reconcile(
        &self,
        session_id: &str,
        remote_site_id: &str,
        snapshot: Option<DocumentSnapshot>,
        now: Timestamp,
    ) -> Result<ReconcileReport> {
        let handle = self.session(session_id)?;
        let (local, document_id) = {
            let session = handle.lock().await;
            (session.document().clone(), session.document_id().clone())
        };

        let remote_snapshot = match snapshot {
            Some(snapshot) => {
                snapshot.validate()?;
                if snapshot.document_id != document_id {
                    return Err(AppError::BadRequest(format!(
                        "snapshot is of document {}, session edits {}",
                        snapshot.document_id, document_id
                    )));
                }
                snapshot
            }
            None => self
                .store
                .load(&document_id, remote_site_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "no replica of document {document_id} for site {remote_site_id}"
                    ))
                })?,
        };
        let remote = remote_snapshot.into_document()?;

        let merged = self.sync.reconcile(&local, &remote);
        let prefix = format!("sync-{}", uuid::Uuid::new_v4().simple());
        let ops = resolution_ops(&local, &merged.data, &prefix, now);

        let (batch, snapshot) = {
            let mut session = handle.lock().await;
            let batch = session.apply_batch(remote_site_id, ops, now)?;
            for (operation, version) in &batch.applied {
                self.broadcaster.publish(
                    session_id,
                    None,
                    ServerMessage::OperationApplied {
                        operation: operation.clone(),
                        version: *version,
                    },
                );
            }
            let snapshot = DocumentSnapshot::from_document(
                session.document(),
                document_id.clone(),
                self.site_id.clone(),
                now,
            );
            (batch, snapshot)
        };
        self.store.save(&snapshot).await?;

        let mut conflicts_unresolved = merged.conflicts_unresolved.clone();
        conflicts_unresolved.extend(batch.conflicts.iter().cloned());

        let status = match merged.ensure_converged(batch.applied.len()) {
            Ok(()) if batch.failed.is_empty() => ReconcileStatus::Success,
            Ok(()) => ReconcileStatus::Partial,
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    remote_site_id = %remote_site_id,
                    error = %e,
                    "Reconcile left conflicts"
                );
                ReconcileStatus::Partial
            }
        };

        tracing::info!(
            session_id = %session_id,
            remote_site_id = %remote_site_id,
            applied = batch.applied.len(),
            failed = batch.failed.len(),
            resolved = merged.conflicts_resolved.len(),
            unresolved = conflicts_unresolved.len(),
            "Reconcile finished"
        );

        Ok(ReconcileReport {
            status,
            sync_results: vec![SiteSyncResult {
                site_id: remote_site_id.to_string(),
                sync_status: local.clock().compare(remote.clock()).into(),
                clock_difference: local.clock().difference(remote.clock()),
                local_clock: local.clock().clone(),
                remote_clock: remote.clock().clone(),
            }],
            applied_operations: batch
                .applied
                .into_iter()
                .map(|(operation, _)| operation)
                .collect(),
            failed_operations: batch.failed,
            conflicts_resolved: merged.conflicts_resolved,
            conflicts_unresolved,
            suggestions: merged.suggestions,
            items: merged.items,
        })
    }

    /// Persist the session's document now.
    pub async fn checkpoint(&self, session_id: &str, now: Timestamp) -> Result<DocumentSnapshot> {
        let handle = self.session(session_id)?;
        let snapshot = {
            let session = handle.lock().await;
            DocumentSnapshot::from_document(
                session.document(),
                session.document_id().clone(),
                self.site_id.clone(),
                now,
            )
        };
        self.store.save(&snapshot).await?;

        tracing::info!(
            session_id = %session_id,
            document_id = %snapshot.document_id,
            items = snapshot.active_item_count(),
            "Checkpoint saved"
        );
        Ok(snapshot)
    }

    /// Advance every session's timeouts. Sessions that go idle or close are
    /// checkpointed; closed ones leave the registry.
    pub async fn sweep(&self, now: Timestamp) -> SweepReport {
        let handles: Vec<(SessionId, SessionHandle)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut report = SweepReport::default();
        for (session_id, handle) in handles {
            let (tick, snapshot) = {
                let mut session = handle.lock().await;
                let tick = session.tick(now);

                for user_id in &tick.removed_participants {
                    self.broadcaster.publish(
                        &session_id,
                        None,
                        ServerMessage::ParticipantLeft {
                            user_id: user_id.clone(),
                        },
                    );
                }
                if tick.transitions.contains(&SessionState::Closed) {
                    self.broadcaster.publish(
                        &session_id,
                        None,
                        ServerMessage::SessionClosed {
                            session_id: session_id.clone(),
                        },
                    );
                }

                let snapshot = (!tick.transitions.is_empty()).then(|| {
                    DocumentSnapshot::from_document(
                        session.document(),
                        session.document_id().clone(),
                        self.site_id.clone(),
                        now,
                    )
                });
                (tick, snapshot)
            };

            if let Some(snapshot) = snapshot {
                if let Err(e) = self.store.save(&snapshot).await {
                    tracing::error!(session_id = %session_id, error = %e, "Checkpoint failed");
                }
            }

            report.removed_participants += tick.removed_participants.len();
            report.expired_locks += tick.expired_locks;
            for state in &tick.transitions {
                match state {
                    SessionState::Idle => {
                        tracing::info!(session_id = %session_id, "Session idle");
                        report.idled.push(session_id.clone());
                    }
                    SessionState::Closed => {
                        tracing::info!(session_id = %session_id, "Session closed");
                        self.sessions.remove(&session_id);
                        report.closed.push(session_id.clone());
                    }
                    _ => {}
                }
            }
        }

        report
    }

    /// Sweep on a fixed interval until the task is aborted.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = manager.sweep(now_ms()).await;
                if !report.is_empty() {
                    tracing::debug!(
                        idled = report.idled.len(),
                        closed = report.closed.len(),
                        removed_participants = report.removed_participants,
                        expired_locks = report.expired_locks,
                        "Sweep finished"
                    );
                }
            }
        })
    }

    fn session(&self, session_id: &str) -> Result<SessionHandle> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| timetable_engine::Error::SessionNotFound(session_id.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use timetable_engine::{ItemDraft, ItemPatch, OpKind, SessionState, Version};

    #[derive(Default)]
    struct RecordingBroadcaster {
        sent: StdMutex<Vec<(String, Option<String>, ServerMessage)>>,
    }

    impl RecordingBroadcaster {
        fn kinds(&self) -> Vec<&'static str> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(_, _, message)| message.kind())
                .collect()
        }
    }

    impl Broadcaster for RecordingBroadcaster {
        fn publish(&self, session_id: &str, origin: Option<&str>, message: ServerMessage) -> usize {
            self.sent.lock().unwrap().push((
                session_id.to_string(),
                origin.map(str::to_string),
                message,
            ));
            1
        }
    }

    fn manager() -> (Arc<SessionManager>, Arc<RecordingBroadcaster>) {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let config = SessionConfig {
            idle_timeout_ms: 1_000,
            close_timeout_ms: 5_000,
            ..SessionConfig::default()
        };
        let manager = SessionManager::new(
            DocumentStore::memory(),
            broadcaster.clone(),
            config,
            "server",
        );
        (Arc::new(manager), broadcaster)
    }

    fn insert(id: &str, time: &str, room: &str) -> Operation {
        Operation::new(
            "",
            OpKind::insert(ItemDraft::new(id, time.parse().unwrap(), room, "f-1", "Subject")),
            0,
        )
    }

    #[tokio::test]
    async fn test_create_join_edit() {
        let (manager, broadcaster) = manager();
        let status = manager
            .create_session(Some("doc-1".into()), "alice", "Alice", "coordinator", 0)
            .await
            .unwrap();
        let session_id = status.session_id.clone();
        assert_eq!(status.participant_count, 1);

        manager
            .join_session(&session_id, "bob", "Bob", "faculty", 10)
            .await
            .unwrap();

        let report = manager
            .apply_edit(&session_id, "alice", insert("cs101", "09:00-10:00", "Room101"), 20)
            .await
            .unwrap();
        assert!(report.is_success());
        assert!(!report.applied_operation.unwrap().op_id.is_empty());

        let status = manager.get_status(&session_id, 30).await.unwrap();
        assert_eq!(status.state, SessionState::Active);
        assert_eq!(status.change_count, 1);
        assert_eq!(
            manager.get_change_log(&session_id, 10).await.unwrap().len(),
            1
        );

        assert_eq!(
            broadcaster.kinds(),
            vec!["participant_joined", "operation_applied"]
        );
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (manager, _) = manager();
        let err = manager.get_status("missing", 0).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Engine(timetable_engine::Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_move_onto_occupied_slot_requires_manual_intervention() {
        let (manager, broadcaster) = manager();
        let session_id = manager
            .create_session(None, "alice", "Alice", "coordinator", 0)
            .await
            .unwrap()
            .session_id;
        manager
            .join_session(&session_id, "bob", "Bob", "coordinator", 0)
            .await
            .unwrap();
        manager
            .apply_edit(&session_id, "alice", insert("cs101", "10:00-11:00", "Room102"), 10)
            .await
            .unwrap();
        manager
            .apply_edit(&session_id, "alice", insert("cs102", "11:00-12:00", "Room102"), 10)
            .await
            .unwrap();

        let relocate = Operation::new(
            "",
            OpKind::relocate("cs102", None, "10:00-11:00".parse().unwrap(), "Room102"),
            0,
        );
        let report = manager
            .apply_edit(&session_id, "bob", relocate, 20)
            .await
            .unwrap();
        assert!(!report.is_success());
        assert!(report.requires_manual_intervention());

        let sent = broadcaster.sent.lock().unwrap();
        let (_, origin, message) = sent.last().unwrap();
        assert!(origin.is_none());
        match message {
            ServerMessage::ManualInterventionRequired {
                user_id,
                suggestions,
                ..
            } => {
                assert_eq!(user_id, "bob");
                assert!(!suggestions.is_empty());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_locks() {
        let (manager, _) = manager();
        let session_id = manager
            .create_session(None, "alice", "Alice", "coordinator", 0)
            .await
            .unwrap()
            .session_id;
        manager
            .join_session(&session_id, "bob", "Bob", "coordinator", 0)
            .await
            .unwrap();
        manager
            .apply_edit(&session_id, "alice", insert("cs101", "10:00-11:00", "Room102"), 10)
            .await
            .unwrap();

        manager
            .acquire_lock(&session_id, "alice", "cs101", 20)
            .await
            .unwrap();
        let err = manager
            .acquire_lock(&session_id, "bob", "cs101", 30)
            .await
            .unwrap_err();
        assert_eq!(err.classify().0, axum::http::StatusCode::LOCKED);

        assert!(manager
            .release_lock(&session_id, "alice", "cs101", 40)
            .await
            .unwrap());
        manager
            .acquire_lock(&session_id, "bob", "cs101", 50)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_idles_then_closes_and_checkpoints() {
        let (manager, broadcaster) = manager();
        let session_id = manager
            .create_session(Some("doc-1".into()), "alice", "Alice", "coordinator", 0)
            .await
            .unwrap()
            .session_id;
        manager
            .apply_edit(&session_id, "alice", insert("cs101", "09:00-10:00", "Room101"), 100)
            .await
            .unwrap();

        assert!(manager.sweep(500).await.is_empty());

        let report = manager.sweep(1_200).await;
        assert_eq!(report.idled, vec![session_id.clone()]);
        assert_eq!(report.removed_participants, 1);

        let report = manager.sweep(5_200).await;
        assert_eq!(report.closed, vec![session_id.clone()]);
        assert_eq!(manager.session_count(), 0);
        assert!(broadcaster.kinds().contains(&"session_closed"));

        // The document survives the session.
        let status = manager
            .create_session(Some("doc-1".into()), "carol", "Carol", "coordinator", 6_000)
            .await
            .unwrap();
        assert_eq!(status.item_count, 1);
    }

    #[tokio::test]
    async fn test_reconcile_with_stored_replica() {
        let (manager, broadcaster) = manager();
        let session_id = manager
            .create_session(Some("doc-1".into()), "alice", "Alice", "coordinator", 0)
            .await
            .unwrap()
            .session_id;
        manager
            .apply_edit(&session_id, "alice", insert("cs101", "09:00-10:00", "Room101"), 10)
            .await
            .unwrap();

        // An offline replica that moved cs101 and added cs102.
        let base = manager.checkpoint(&session_id, 20).await.unwrap();
        let mut offline = Session::new(
            "offline",
            "doc-1",
            base.into_document().unwrap(),
            SessionConfig::default(),
            20,
        );
        offline.join("laptop", "Laptop", "faculty", 20).unwrap();
        offline
            .apply_edit(
                "laptop",
                Operation::new(
                    "l-1",
                    OpKind::update("cs101", 1, ItemPatch::default().with_room("Room202")),
                    0,
                ),
                30,
            )
            .unwrap();
        offline
            .apply_edit(
                "laptop",
                Operation::new(
                    "l-2",
                    OpKind::insert(ItemDraft::new(
                        "cs102",
                        "11:00-12:00".parse().unwrap(),
                        "Room202",
                        "f-2",
                        "Subject",
                    )),
                    0,
                ),
                40,
            )
            .unwrap();
        let replica = DocumentSnapshot::from_document(offline.document(), "doc-1", "laptop", 50);
        manager.store.save(&replica).await.unwrap();

        let report = manager
            .reconcile(&session_id, "laptop", None, 60)
            .await
            .unwrap();
        assert_eq!(report.status, ReconcileStatus::Success);
        assert_eq!(report.applied_operations.len(), 2);
        assert_eq!(report.sync_results[0].sync_status, SiteSyncStatus::RemoteAhead);

        // Each broadcast carries the version its commit produced.
        let mut published: Vec<(String, Version)> = broadcaster
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, origin, message)| match message {
                ServerMessage::OperationApplied { operation, version } if origin.is_none() => {
                    Some((operation.target_item_id().clone(), *version))
                }
                _ => None,
            })
            .collect();
        published.sort();
        assert_eq!(
            published,
            vec![("cs101".to_string(), 2), ("cs102".to_string(), 1)]
        );

        let status = manager.get_status(&session_id, 70).await.unwrap();
        assert_eq!(status.item_count, 2);

        let err = manager
            .reconcile(&session_id, "phone", None, 80)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
