//! Conflict resolution.
//!
//! Given the conflicts detected for an operation, the resolver picks one
//! strategy for the whole set. Escalation beats waiting, waiting beats
//! suggestions, and suggestions beat the automatic strategies:
//!
//! - concurrent edits are merged by replaying field deltas from the common
//!   base in a deterministic causal order,
//! - duplicate ids are regenerated,
//! - room and faculty collisions get alternative slots or rooms,
//! - locked items report how long to wait,
//! - everything else is flagged for manual intervention.
//!
//! Resolution never mutates its inputs. The operations it returns still have
//! to go through detection and apply.

use crate::{
    item::parse_time_of_day, Attribution, ConflictKind, ConflictRecord, DetectionContext, Field,
    ItemId, ItemPatch, OpKind, OpStatus, Operation, ResolutionStrategy, ScheduleDocument,
    ScheduleItem, TimeSlot, UserId, VectorClock,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default end of the teaching day: 22:00.
pub const DEFAULT_DAY_END: u16 = 22 * 60;

/// Tunables for suggestion search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverConfig {
    /// Room catalogue offered for reassignment, in addition to rooms in use
    pub rooms: Vec<String>,
    /// Suggested slots must end by this minute of the day
    pub day_end: u16,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            rooms: Vec::new(),
            day_end: DEFAULT_DAY_END,
        }
    }
}

impl ResolverConfig {
    pub fn with_rooms<I, S>(mut self, rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rooms = rooms.into_iter().map(Into::into).collect();
        self
    }

    /// Set the day end from `"HH:MM"`.
    pub fn with_day_end(mut self, day_end: &str) -> crate::error::Result<Self> {
        self.day_end = parse_time_of_day(day_end)?;
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    /// Same room, later time
    ShiftTime,
    /// Same time, other room
    ReassignRoom,
}

/// An alternative position for an item the caller may choose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub item_id: ItemId,
    pub time_slot: TimeSlot,
    pub room: String,
}

impl Suggestion {
    /// Rewrite an insert or move to use this position.
    pub fn apply_to(&self, op: &Operation) -> Option<Operation> {
        let mut rewritten = op.clone();
        match &mut rewritten.kind {
            OpKind::Insert(insert) if insert.item.id == self.item_id => {
                insert.item.time_slot = self.time_slot;
                insert.item.room = self.room.clone();
            }
            OpKind::Move(relocate) if relocate.item_id == self.item_id => {
                relocate.time_slot = self.time_slot;
                relocate.room = self.room.clone();
            }
            _ => return None,
        }
        Some(rewritten)
    }
}

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    pub resolved: bool,
    /// Operations to submit in place of the original
    pub applied_ops: Vec<Operation>,
    pub unresolved: Vec<ConflictRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<Suggestion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_wait_ms: Option<u64>,
    pub requires_manual_intervention: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ResolutionStrategy>,
}

impl ResolutionResult {
    fn passthrough(op: &Operation) -> Self {
        Self {
            resolved: true,
            applied_ops: vec![op.clone()],
            unresolved: Vec::new(),
            suggestions: Vec::new(),
            estimated_wait_ms: None,
            requires_manual_intervention: false,
            strategy: None,
        }
    }

    fn resolved_with(strategy: ResolutionStrategy, op: Operation) -> Self {
        Self {
            resolved: true,
            applied_ops: vec![op],
            unresolved: Vec::new(),
            suggestions: Vec::new(),
            estimated_wait_ms: None,
            requires_manual_intervention: false,
            strategy: Some(strategy),
        }
    }

    fn unresolved(strategy: ResolutionStrategy, conflicts: &[ConflictRecord]) -> Self {
        Self {
            resolved: false,
            applied_ops: Vec::new(),
            unresolved: conflicts.to_vec(),
            suggestions: Vec::new(),
            estimated_wait_ms: None,
            requires_manual_intervention: strategy == ResolutionStrategy::ManualIntervention,
            strategy: Some(strategy),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    config: ResolverConfig,
}

impl ConflictResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve the conflicts detected for `op`.
    pub fn resolve(
        &self,
        ctx: &DetectionContext<'_>,
        op: &Operation,
        conflicts: &[ConflictRecord],
    ) -> ResolutionResult {
        if conflicts.is_empty() {
            return ResolutionResult::passthrough(op);
        }

        let needs = |strategy: ResolutionStrategy| {
            conflicts
                .iter()
                .any(|conflict| conflict.suggested_resolution == strategy)
        };

        if needs(ResolutionStrategy::ManualIntervention) {
            let mut result =
                ResolutionResult::unresolved(ResolutionStrategy::ManualIntervention, conflicts);
            result.suggestions = self.suggestions_for(ctx.document, op);
            return result;
        }

        if needs(ResolutionStrategy::WaitForUnlock) {
            let mut result =
                ResolutionResult::unresolved(ResolutionStrategy::WaitForUnlock, conflicts);
            result.estimated_wait_ms = conflicts
                .iter()
                .filter_map(|conflict| match &conflict.kind {
                    ConflictKind::LockedItem { expires_at, .. } => {
                        Some(expires_at.saturating_sub(ctx.now))
                    }
                    _ => None,
                })
                .max();
            return result;
        }

        if needs(ResolutionStrategy::SuggestAlternatives) {
            let mut result =
                ResolutionResult::unresolved(ResolutionStrategy::SuggestAlternatives, conflicts);
            result.suggestions = self.suggestions_for(ctx.document, op);
            return result;
        }

        if needs(ResolutionStrategy::RegenerateId) {
            if let OpKind::Insert(insert) = &op.kind {
                let mut regenerated = op.clone();
                let fresh = regenerate_id(ctx.document, &insert.item.id);
                if let OpKind::Insert(insert) = &mut regenerated.kind {
                    insert.item.id = fresh;
                }
                return ResolutionResult::resolved_with(
                    ResolutionStrategy::RegenerateId,
                    regenerated,
                );
            }
        }

        if needs(ResolutionStrategy::OperationalMerge) {
            if let Some(merged) = merge_concurrent(ctx, op) {
                return ResolutionResult::resolved_with(
                    ResolutionStrategy::OperationalMerge,
                    merged,
                );
            }
        }

        ResolutionResult::unresolved(ResolutionStrategy::ManualIntervention, conflicts)
    }

    /// Alternative positions for the item an insert or move would place.
    pub fn suggestions_for(&self, document: &ScheduleDocument, op: &Operation) -> Vec<Suggestion> {
        match &op.kind {
            OpKind::Insert(insert) => self.suggest(
                document,
                &insert.item.id,
                insert.item.time_slot,
                &insert.item.room,
                &insert.item.faculty_id,
                None,
            ),
            OpKind::Move(relocate) => match document.get(&relocate.item_id) {
                Some(item) => self.suggest(
                    document,
                    &relocate.item_id,
                    relocate.time_slot,
                    &relocate.room,
                    &item.faculty_id,
                    Some(relocate.item_id.as_str()),
                ),
                None => Vec::new(),
            },
            OpKind::Update(_) | OpKind::Delete(_) => Vec::new(),
        }
    }

    /// Up to two alternatives for placing `item_id` at `slot` in `room`.
    ///
    /// The time shift steps forward by the slot's own duration until both the
    /// room and the faculty are free. The room reassignment is only offered
    /// when the faculty is free at the original slot.
    pub fn suggest(
        &self,
        document: &ScheduleDocument,
        item_id: &str,
        slot: TimeSlot,
        room: &str,
        faculty_id: &str,
        exclude: Option<&str>,
    ) -> Vec<Suggestion> {
        let mut suggestions = Vec::new();

        if let Some(time_slot) = self.next_free_slot(document, slot, room, faculty_id, exclude) {
            suggestions.push(Suggestion {
                kind: SuggestionKind::ShiftTime,
                item_id: item_id.to_string(),
                time_slot,
                room: room.to_string(),
            });
        }

        let faculty_free = document
            .faculty_bookings(&slot, faculty_id, exclude)
            .next()
            .is_none();
        if faculty_free {
            if let Some(free_room) = self.free_room(document, slot, room, exclude) {
                suggestions.push(Suggestion {
                    kind: SuggestionKind::ReassignRoom,
                    item_id: item_id.to_string(),
                    time_slot: slot,
                    room: free_room,
                });
            }
        }

        suggestions
    }

    fn next_free_slot(
        &self,
        document: &ScheduleDocument,
        slot: TimeSlot,
        room: &str,
        faculty_id: &str,
        exclude: Option<&str>,
    ) -> Option<TimeSlot> {
        let step = slot.duration();
        let mut candidate = slot;
        loop {
            candidate = candidate.shifted(step)?;
            if candidate.end() > self.config.day_end {
                return None;
            }
            let room_free = document
                .room_occupants(&candidate, room, exclude)
                .next()
                .is_none();
            let faculty_free = document
                .faculty_bookings(&candidate, faculty_id, exclude)
                .next()
                .is_none();
            if room_free && faculty_free {
                return Some(candidate);
            }
        }
    }

    fn free_room(
        &self,
        document: &ScheduleDocument,
        slot: TimeSlot,
        current_room: &str,
        exclude: Option<&str>,
    ) -> Option<String> {
        let mut rooms: BTreeSet<&str> = self.config.rooms.iter().map(String::as_str).collect();
        rooms.extend(document.rooms());
        rooms
            .into_iter()
            .filter(|room| *room != current_room)
            .find(|room| document.room_occupants(&slot, room, exclude).next().is_none())
            .map(str::to_string)
    }
}

/// First unused id of the form `<id>-2`, `<id>-3`, ...
pub fn regenerate_id(document: &ScheduleDocument, id: &str) -> ItemId {
    (2u64..)
        .map(|n| format!("{id}-{n}"))
        .find(|candidate| !document.contains(candidate))
        .unwrap_or_else(|| format!("{id}-{}", document.all_items().count() + 2))
}

/// One edit taking part in a merge.
struct Competitor<'a> {
    op_id: &'a str,
    site: &'a UserId,
    clock: &'a VectorClock,
    attribution: Attribution,
    delta: Option<ItemPatch>,
}

/// Merge a stale edit with everything applied since its base version.
///
/// Returns `None` when the item is gone or the edit writes no fields.
fn merge_concurrent(ctx: &DetectionContext<'_>, op: &Operation) -> Option<Operation> {
    let item_id = op.target_item_id();
    let current = ctx.document.get(item_id)?;
    let base_version = op.base_version().unwrap_or(current.version);
    let base = ctx
        .log
        .state_at(item_id, base_version)
        .unwrap_or(current)
        .clone();

    let mut competitors: Vec<Competitor<'_>> = ctx
        .log
        .applied_since(item_id, base_version)
        .into_iter()
        .map(|entry| Competitor {
            op_id: &entry.operation.op_id,
            site: &entry.operation.user_id,
            clock: &entry.operation.clock,
            attribution: entry.operation.attribution(),
            delta: entry.operation.kind.field_delta(),
        })
        .collect();
    competitors.push(Competitor {
        op_id: &op.op_id,
        site: &op.user_id,
        clock: &op.clock,
        attribution: op.attribution(),
        delta: Some(op.kind.field_delta()?),
    });

    let ordered = causal_order(competitors);

    let mut merged_state: ScheduleItem = base;
    let mut written: BTreeSet<Field> = BTreeSet::new();
    for competitor in &ordered {
        if let Some(delta) = &competitor.delta {
            delta.apply_fields(&mut merged_state);
            written.extend(delta.fields());
        }
    }

    let winner = ordered.last()?;
    let at = ordered
        .iter()
        .map(|competitor| competitor.attribution.at)
        .max()
        .unwrap_or(op.created_at);
    let clock = ordered
        .iter()
        .fold(VectorClock::new(), |acc, competitor| acc.merged(competitor.clock));
    let mut merged_from: Vec<_> = ordered
        .iter()
        .map(|competitor| competitor.op_id.to_string())
        .collect();
    merged_from.sort();

    let patch = project(&merged_state, &written);
    let attribution = Attribution {
        site_id: winner.attribution.site_id.clone(),
        at,
    };

    let mut kind = OpKind::update(item_id.clone(), current.version, patch);
    if let OpKind::Update(update) = &mut kind {
        update.attribution = Some(attribution);
    }

    Some(Operation {
        op_id: op.op_id.clone(),
        session_id: op.session_id.clone(),
        user_id: op.user_id.clone(),
        kind,
        clock,
        created_at: at,
        status: OpStatus::Merged,
        merged_from,
    })
}

/// Deterministic linear extension of happened-before.
///
/// Among the edits no remaining edit happened before, the one with the highest
/// site id (then op id) goes first, so the lowest site id is replayed last.
fn causal_order(mut pending: Vec<Competitor<'_>>) -> Vec<Competitor<'_>> {
    let mut ordered = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let next = (0..pending.len())
            .filter(|&i| {
                !pending
                    .iter()
                    .enumerate()
                    .any(|(j, other)| j != i && other.clock.happened_before(pending[i].clock))
            })
            .max_by(|&a, &b| {
                (pending[a].site, pending[a].op_id).cmp(&(pending[b].site, pending[b].op_id))
            })
            .unwrap_or(0);
        ordered.push(pending.remove(next));
    }
    ordered
}

/// Patch writing `fields` with their values in `state`.
fn project(state: &ScheduleItem, fields: &BTreeSet<Field>) -> ItemPatch {
    let mut patch = ItemPatch::default();
    for field in fields {
        match field {
            Field::TimeSlot => patch.time_slot = Some(state.time_slot),
            Field::Room => patch.room = Some(state.room.clone()),
            Field::FacultyId => patch.faculty_id = Some(state.faculty_id.clone()),
            Field::Subject => patch.subject = Some(state.subject.clone()),
            Field::StudentCount => patch.student_count = Some(state.student_count),
            Field::DependsOn => patch.depends_on = Some(state.depends_on.clone()),
        }
    }
    patch
}
