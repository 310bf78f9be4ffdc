//! Collaborative sessions.
//!
//! A [`Session`] owns one document together with its operation log, lock
//! table and vector clocks, and runs every edit through the same pipeline:
//!
//! 1. validate the operation's shape,
//! 2. stamp it with the submitting site's clock,
//! 3. detect conflicts against the document, log and locks,
//! 4. resolve them, re-detecting any rewritten operation,
//! 5. apply, log and advance the clocks.
//!
//! Sessions are plain values. Callers that share one between threads wrap it
//! in a mutex, which also serializes the clock increments per site.

use crate::{
    error::Result, validation::validate_operation, ChangeLogEntry, ConflictDetector,
    ConflictRecord, ConflictResolver, DetectionContext, DocumentId, Error, Field, ItemId,
    ItemLock, LockTable, OpKind, OpStatus, Operation, OperationId, OperationLog, ResolutionResult,
    ResolutionStrategy, ResolverConfig, ScheduleDocument, SessionId, SiteId, Timestamp, UserId,
    VectorClock, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No operation applied yet
    Created,
    Active,
    /// No activity for the idle timeout
    Idle,
    /// Locks and participants discarded; the log stays readable
    Closed,
}

/// Where a participant is looking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<ItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Also the participant's vector clock site
    pub user_id: UserId,
    pub user_name: String,
    pub role: String,
    pub joined_at: Timestamp,
    pub last_seen: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
}

/// Session timeouts and pipeline limits, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub idle_timeout_ms: u64,
    /// Measured from the last activity; must exceed the idle timeout
    pub close_timeout_ms: u64,
    pub lock_ttl_ms: u64,
    /// Rewrites (merge, regenerated id) allowed per edit
    pub max_resubmits: usize,
    pub resolver: ResolverConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30 * 60 * 1000,
            close_timeout_ms: 2 * 60 * 60 * 1000,
            lock_ttl_ms: crate::locks::DEFAULT_LOCK_TTL_MS,
            max_resubmits: 3,
            resolver: ResolverConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditStatus {
    Success,
    Conflict,
}

/// Outcome of [`Session::apply_edit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditReport {
    pub status: EditStatus,
    /// The operation as committed, after any rewrite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_operation: Option<Operation>,
    /// New version of the target item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Every conflict met on the way, resolved or not
    pub conflicts: Vec<ConflictRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionResult>,
}

impl EditReport {
    pub fn is_success(&self) -> bool {
        self.status == EditStatus::Success
    }

    pub fn requires_manual_intervention(&self) -> bool {
        self.resolution
            .as_ref()
            .is_some_and(|resolution| resolution.requires_manual_intervention)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Applied,
    Merged,
    Regenerated,
    Rejected,
}

/// One resolution attempt kept after its conflicts are gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub op_id: OperationId,
    pub user_id: UserId,
    pub item_id: ItemId,
    pub at: Timestamp,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ResolutionStrategy>,
    pub conflicts: Vec<ConflictRecord>,
}

/// Summary of a session for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub document_id: DocumentId,
    pub state: SessionState,
    pub participant_count: usize,
    pub participants: Vec<Participant>,
    pub created_at: Timestamp,
    pub last_activity: Timestamp,
    pub vector_clock: VectorClock,
    pub change_count: usize,
    pub item_count: usize,
    pub locks: Vec<ItemLock>,
}

/// Outcome of [`Session::apply_batch`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Committed operations with the item version each produced
    pub applied: Vec<(Operation, Version)>,
    /// Conflicts left by operations that could not be applied
    pub conflicts: Vec<ConflictRecord>,
    pub failed: Vec<OperationId>,
}

/// What a [`Session::tick`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// States entered, in order
    pub transitions: Vec<SessionState>,
    pub removed_participants: Vec<UserId>,
    pub expired_locks: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.removed_participants.is_empty() && self.expired_locks == 0
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    session_id: SessionId,
    document_id: DocumentId,
    state: SessionState,
    participants: BTreeMap<UserId, Participant>,
    document: ScheduleDocument,
    clock: VectorClock,
    /// What each site had observed when it last committed or joined
    site_clocks: HashMap<SiteId, VectorClock>,
    locks: LockTable,
    log: OperationLog,
    audit: Vec<AuditEntry>,
    resolver: ConflictResolver,
    config: SessionConfig,
    created_at: Timestamp,
    last_activity: Timestamp,
}

impl Session {
    pub fn new(
        session_id: impl Into<SessionId>,
        document_id: impl Into<DocumentId>,
        document: ScheduleDocument,
        config: SessionConfig,
        now: Timestamp,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            document_id: document_id.into(),
            state: SessionState::Created,
            participants: BTreeMap::new(),
            clock: document.clock().clone(),
            document,
            site_clocks: HashMap::new(),
            locks: LockTable::new(config.lock_ttl_ms),
            log: OperationLog::new(),
            audit: Vec::new(),
            resolver: ConflictResolver::new(config.resolver.clone()),
            config,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn document(&self) -> &ScheduleDocument {
        &self.document
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn audit_trail(&self) -> &[AuditEntry] {
        &self.audit
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn last_activity(&self) -> Timestamp {
        self.last_activity
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participants.contains_key(user_id)
    }

    /// Add a participant. Rejects a user id already in the session.
    pub fn join(
        &mut self,
        user_id: impl Into<UserId>,
        user_name: impl Into<String>,
        role: impl Into<String>,
        now: Timestamp,
    ) -> Result<Participant> {
        self.ensure_open()?;
        let user_id = user_id.into();
        if self.participants.contains_key(&user_id) {
            return Err(Error::DuplicateParticipant {
                session_id: self.session_id.clone(),
                user_id,
            });
        }

        let participant = Participant {
            user_id: user_id.clone(),
            user_name: user_name.into(),
            role: role.into(),
            joined_at: now,
            last_seen: now,
            cursor: None,
        };
        self.participants.insert(user_id.clone(), participant.clone());
        self.site_clocks
            .entry(user_id)
            .or_default()
            .merge(&self.clock);
        self.mark_activity(now);
        Ok(participant)
    }

    /// Remove a participant and release their locks.
    pub fn leave(&mut self, user_id: &str, now: Timestamp) -> Result<Participant> {
        let participant = self
            .participants
            .remove(user_id)
            .ok_or_else(|| self.not_in_session(user_id))?;
        self.locks.release_all(user_id);
        self.last_activity = self.last_activity.max(now);
        Ok(participant)
    }

    pub fn update_cursor(
        &mut self,
        user_id: &str,
        cursor: CursorPosition,
        now: Timestamp,
    ) -> Result<()> {
        let participant = self.participant_mut(user_id)?;
        participant.cursor = Some(cursor);
        participant.last_seen = now;
        Ok(())
    }

    /// Record that a participant is still connected.
    pub fn touch(&mut self, user_id: &str, now: Timestamp) -> Result<()> {
        self.participant_mut(user_id)?.last_seen = now;
        Ok(())
    }

    /// Take or refresh the lock on a live item. Fails fast if someone else holds it.
    pub fn acquire_lock(&mut self, user_id: &str, item_id: &str, now: Timestamp) -> Result<ItemLock> {
        self.ensure_open()?;
        self.touch(user_id, now)?;
        if self.document.get(item_id).is_none() {
            return Err(Error::ItemNotFound(item_id.to_string()));
        }
        self.locks.acquire(item_id, user_id, now)
    }

    /// Release a lock. Returns false if the user did not hold it.
    pub fn release_lock(&mut self, user_id: &str, item_id: &str, now: Timestamp) -> Result<bool> {
        self.touch(user_id, now)?;
        Ok(self.locks.release(item_id, user_id))
    }

    /// Run a participant's edit through the pipeline.
    ///
    /// Validation failures and apply failures are errors. Conflicts that
    /// cannot be resolved automatically are reported with
    /// [`EditStatus::Conflict`] and leave the document untouched.
    pub fn apply_edit(&mut self, user_id: &str, op: Operation, now: Timestamp) -> Result<EditReport> {
        self.ensure_open()?;
        self.touch(user_id, now)?;
        self.submit(user_id, op, now)
    }

    /// Apply a batch of operations from a sync peer.
    ///
    /// Each operation goes through the same pipeline as an edit, stamped with
    /// `site_id`'s clock. Failures do not stop the batch.
    pub fn apply_batch(&mut self, site_id: &str, ops: Vec<Operation>, now: Timestamp) -> Result<BatchReport> {
        self.ensure_open()?;
        let mut report = BatchReport::default();
        for op in ops {
            let op_id = op.op_id.clone();
            match self.submit(site_id, op, now) {
                Ok(edit) if edit.is_success() => {
                    if let (Some(operation), Some(version)) = (edit.applied_operation, edit.version) {
                        report.applied.push((operation, version));
                    }
                }
                Ok(edit) => {
                    report.conflicts.extend(edit.conflicts);
                    report.failed.push(op_id);
                }
                Err(_) => report.failed.push(op_id),
            }
        }
        Ok(report)
    }

    /// Summary for status queries.
    pub fn status(&self, now: Timestamp) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id.clone(),
            document_id: self.document_id.clone(),
            state: self.state,
            participant_count: self.participants.len(),
            participants: self.participants.values().cloned().collect(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            vector_clock: self.clock.clone(),
            change_count: self.log.len(),
            item_count: self.document.len(),
            locks: self.locks.active(now).into_iter().cloned().collect(),
        }
    }

    /// Up to `limit` committed operations, newest first.
    pub fn change_log(&self, limit: usize) -> Vec<ChangeLogEntry> {
        self.log.recent(limit)
    }

    /// Advance timeouts: expire locks, drop silent participants and move
    /// between active, idle and closed.
    ///
    /// A session only closes once it has no participants left.
    pub fn tick(&mut self, now: Timestamp) -> TickReport {
        let mut report = TickReport::default();
        if self.state == SessionState::Closed {
            return report;
        }

        report.expired_locks = self.locks.purge_expired(now);

        let idle_timeout = self.config.idle_timeout_ms;
        let silent: Vec<UserId> = self
            .participants
            .values()
            .filter(|p| now.saturating_sub(p.last_seen) >= idle_timeout)
            .map(|p| p.user_id.clone())
            .collect();
        for user_id in &silent {
            self.participants.remove(user_id);
            self.locks.release_all(user_id);
        }
        report.removed_participants = silent;

        let inactive_for = now.saturating_sub(self.last_activity);
        if self.state != SessionState::Idle && inactive_for >= idle_timeout {
            self.state = SessionState::Idle;
            report.transitions.push(SessionState::Idle);
        }
        // Connected participants keep an idle session open.
        if self.state == SessionState::Idle
            && self.participants.is_empty()
            && inactive_for >= self.config.close_timeout_ms
        {
            self.close();
            report.transitions.push(SessionState::Closed);
        }
        report
    }

    /// Close now, discarding locks and participants.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.locks.clear();
        self.participants.clear();
        self.site_clocks.clear();
    }

    fn submit(&mut self, site_id: &str, mut op: Operation, now: Timestamp) -> Result<EditReport> {
        op.user_id = site_id.to_string();
        op.session_id = self.session_id.clone();
        op.status = OpStatus::Pending;
        op.merged_from.clear();
        if op.created_at == 0 {
            op.created_at = now;
        }
        validate_operation(&op)?;

        op.clock = self.prospective_stamp(site_id, &op.clock);

        let mut candidate = op;
        let mut seen = Vec::new();
        let mut last_resolution = None;
        let mut rewrites = 0;

        loop {
            let ctx = DetectionContext {
                document: &self.document,
                log: &self.log,
                locks: &self.locks,
                now,
            };
            let conflicts = ConflictDetector::detect(&ctx, &candidate);
            if conflicts.is_empty() {
                break;
            }

            let resolution = self.resolver.resolve(&ctx, &candidate, &conflicts);
            seen.extend(conflicts);

            if !resolution.resolved {
                self.audit.push(AuditEntry {
                    op_id: candidate.op_id.clone(),
                    user_id: candidate.user_id.clone(),
                    item_id: candidate.target_item_id().clone(),
                    at: now,
                    outcome: AuditOutcome::Rejected,
                    strategy: resolution.strategy,
                    conflicts: resolution.unresolved.clone(),
                });
                return Ok(EditReport {
                    status: EditStatus::Conflict,
                    applied_operation: None,
                    version: None,
                    conflicts: seen,
                    resolution: Some(resolution),
                });
            }

            rewrites += 1;
            if rewrites > self.config.max_resubmits {
                return Err(Error::UnresolvedConflict {
                    op_id: candidate.op_id.clone(),
                    attempts: rewrites - 1,
                });
            }
            match resolution.applied_ops.first() {
                Some(rewritten) => candidate = rewritten.clone(),
                None => {
                    return Err(Error::UnresolvedConflict {
                        op_id: candidate.op_id.clone(),
                        attempts: rewrites,
                    })
                }
            }
            last_resolution = Some(resolution);
        }

        let version = self.commit(&mut candidate, now)?;

        if let Some(resolution) = &last_resolution {
            self.audit.push(AuditEntry {
                op_id: candidate.op_id.clone(),
                user_id: candidate.user_id.clone(),
                item_id: candidate.target_item_id().clone(),
                at: now,
                outcome: match resolution.strategy {
                    Some(ResolutionStrategy::RegenerateId) => AuditOutcome::Regenerated,
                    _ => AuditOutcome::Merged,
                },
                strategy: resolution.strategy,
                conflicts: seen.clone(),
            });
        }

        Ok(EditReport {
            status: EditStatus::Success,
            applied_operation: Some(candidate),
            version: Some(version),
            conflicts: seen,
            resolution: last_resolution,
        })
    }

    /// Apply, log and advance the clocks.
    fn commit(&mut self, op: &mut Operation, now: Timestamp) -> Result<Version> {
        op.status = if op.merged_from.is_empty() {
            OpStatus::Applied
        } else {
            OpStatus::Merged
        };

        let item_id = op.target_item_id().clone();
        let implicit_lock = matches!(op.kind, OpKind::Delete(_))
            && self.locks.holder(&item_id, now).is_none();
        if matches!(op.kind, OpKind::Delete(_)) {
            self.locks.acquire(&item_id, &op.user_id, now)?;
        }

        let applied = self.document.apply(op);
        if implicit_lock {
            self.locks.release(&item_id, &op.user_id);
        }
        let applied = applied?;

        let item_after = self
            .document
            .get_including_deleted(&item_id)
            .cloned()
            .ok_or_else(|| Error::ItemNotFound(item_id.clone()))?;
        self.log.append(op.clone(), item_after, now);

        self.site_clocks
            .entry(op.user_id.clone())
            .or_default()
            .merge(&op.clock);
        self.clock.merge(&op.clock);
        self.mark_activity(now);

        Ok(applied.version)
    }

    /// The stamp a commit by `site_id` would carry. Nothing is advanced until
    /// the commit succeeds.
    fn prospective_stamp(&self, site_id: &str, context: &VectorClock) -> VectorClock {
        let mut stamp = self.site_clocks.get(site_id).cloned().unwrap_or_default();
        stamp.merge(context);
        stamp.increment(site_id);
        stamp
    }

    fn mark_activity(&mut self, now: Timestamp) {
        self.last_activity = self.last_activity.max(now);
        match self.state {
            SessionState::Idle => self.state = SessionState::Active,
            SessionState::Created if !self.log.is_empty() => self.state = SessionState::Active,
            _ => {}
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == SessionState::Closed {
            Err(Error::SessionClosed(self.session_id.clone()))
        } else {
            Ok(())
        }
    }

    fn participant_mut(&mut self, user_id: &str) -> Result<&mut Participant> {
        let session_id = self.session_id.clone();
        self.participants
            .get_mut(user_id)
            .ok_or_else(|| Error::UserNotInSession {
                session_id,
                user_id: user_id.to_string(),
            })
    }

    fn not_in_session(&self, user_id: &str) -> Error {
        Error::UserNotInSession {
            session_id: self.session_id.clone(),
            user_id: user_id.to_string(),
        }
    }
}
