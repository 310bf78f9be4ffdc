//! Schedule items and the field-level deltas applied to them.

use crate::{error::Result, Error, ItemId, SiteId, Timestamp, UserId, VectorClock, Version};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// A time interval within one day, written `"HH:MM-HH:MM"`.
///
/// Start is strictly before end. Slots are half-open, so `09:00-10:00` and
/// `10:00-11:00` do not overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeSlot {
    start: u16,
    end: u16,
}

impl TimeSlot {
    /// Create a slot from minutes after midnight.
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start >= end || end > MINUTES_PER_DAY {
            return Err(Error::InvalidTimeSlot(format!(
                "start {start} must be before end {end} within one day"
            )));
        }
        Ok(Self { start, end })
    }

    /// Start, in minutes after midnight.
    pub fn start(&self) -> u16 {
        self.start
    }

    /// End, in minutes after midnight.
    pub fn end(&self) -> u16 {
        self.end
    }

    /// Length in minutes.
    pub fn duration(&self) -> u16 {
        self.end - self.start
    }

    /// True if the two intervals share any minute.
    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The same slot moved later by `minutes`, if it still fits in the day.
    pub fn shifted(&self, minutes: u16) -> Option<TimeSlot> {
        let start = self.start.checked_add(minutes)?;
        let end = self.end.checked_add(minutes)?;
        (end <= MINUTES_PER_DAY).then_some(TimeSlot { start, end })
    }
}

fn parse_clock_time(s: &str) -> Option<u16> {
    let (hours, minutes) = s.trim().split_once(':')?;
    let hours: u16 = hours.parse().ok()?;
    let minutes: u16 = minutes.parse().ok()?;
    if minutes > 59 || hours > 24 || (hours == 24 && minutes > 0) {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// Parse `"HH:MM"` into minutes after midnight.
pub fn parse_time_of_day(s: &str) -> Result<u16> {
    parse_clock_time(s).ok_or_else(|| Error::InvalidTimeSlot(s.to_string()))
}

impl FromStr for TimeSlot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidTimeSlot(s.to_string());
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let start = parse_clock_time(start).ok_or_else(invalid)?;
        let end = parse_clock_time(end).ok_or_else(invalid)?;
        TimeSlot::new(start, end).map_err(|_| invalid())
    }
}

impl TryFrom<String> for TimeSlot {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimeSlot> for String {
    fn from(slot: TimeSlot) -> Self {
        slot.to_string()
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start / 60,
            self.start % 60,
            self.end / 60,
            self.end % 60
        )
    }
}

/// Editable fields of a schedule item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    TimeSlot,
    Room,
    FacultyId,
    Subject,
    StudentCount,
    DependsOn,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::TimeSlot,
        Field::Room,
        Field::FacultyId,
        Field::Subject,
        Field::StudentCount,
        Field::DependsOn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::TimeSlot => "timeSlot",
            Field::Room => "room",
            Field::FacultyId => "facultyId",
            Field::Subject => "subject",
            Field::StudentCount => "studentCount",
            Field::DependsOn => "dependsOn",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a mutation is credited to, and when.
///
/// Plain edits are credited to their submitter. Merged updates carry an
/// explicit attribution so the result does not depend on submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribution {
    pub site_id: SiteId,
    pub at: Timestamp,
}

/// The caller-supplied content of a new item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDraft {
    pub id: ItemId,
    pub time_slot: TimeSlot,
    pub room: String,
    pub faculty_id: String,
    pub subject: String,
    #[serde(default)]
    pub student_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<ItemId>,
}

impl ItemDraft {
    pub fn new(
        id: impl Into<ItemId>,
        time_slot: TimeSlot,
        room: impl Into<String>,
        faculty_id: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            time_slot,
            room: room.into(),
            faculty_id: faculty_id.into(),
            subject: subject.into(),
            student_count: 0,
            depends_on: Vec::new(),
        }
    }

    pub fn with_student_count(mut self, student_count: u32) -> Self {
        self.student_count = student_count;
        self
    }

    pub fn with_dependencies<I, S>(mut self, depends_on: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        self.depends_on = depends_on.into_iter().map(Into::into).collect();
        self
    }
}

/// A field-level delta. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_slot: Option<TimeSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faculty_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<ItemId>>,
}

impl ItemPatch {
    pub fn with_time_slot(mut self, time_slot: TimeSlot) -> Self {
        self.time_slot = Some(time_slot);
        self
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn with_faculty(mut self, faculty_id: impl Into<String>) -> Self {
        self.faculty_id = Some(faculty_id.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_student_count(mut self, student_count: u32) -> Self {
        self.student_count = Some(student_count);
        self
    }

    pub fn with_dependencies(mut self, depends_on: Vec<ItemId>) -> Self {
        self.depends_on = Some(depends_on);
        self
    }

    /// True if the patch sets no field.
    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Fields this patch writes, in declaration order.
    pub fn fields(&self) -> Vec<Field> {
        Field::ALL
            .into_iter()
            .filter(|field| self.value_of(*field).is_some())
            .collect()
    }

    /// JSON value written to `field`, if any.
    pub fn value_of(&self, field: Field) -> Option<Value> {
        match field {
            Field::TimeSlot => self.time_slot.map(|slot| json!(slot.to_string())),
            Field::Room => self.room.as_ref().map(|room| json!(room)),
            Field::FacultyId => self.faculty_id.as_ref().map(|faculty| json!(faculty)),
            Field::Subject => self.subject.as_ref().map(|subject| json!(subject)),
            Field::StudentCount => self.student_count.map(|count| json!(count)),
            Field::DependsOn => self.depends_on.as_ref().map(|deps| json!(deps)),
        }
    }

    /// Write the set fields into `item` without touching version or metadata.
    pub fn apply_fields(&self, item: &mut ScheduleItem) {
        if let Some(slot) = self.time_slot {
            item.time_slot = slot;
        }
        if let Some(room) = &self.room {
            item.room = room.clone();
        }
        if let Some(faculty) = &self.faculty_id {
            item.faculty_id = faculty.clone();
        }
        if let Some(subject) = &self.subject {
            item.subject = subject.clone();
        }
        if let Some(count) = self.student_count {
            item.student_count = count;
        }
        if let Some(deps) = &self.depends_on {
            item.depends_on = deps.clone();
        }
    }

    /// The patch that turns `from`'s fields into `to`'s.
    pub fn between(from: &ScheduleItem, to: &ScheduleItem) -> Self {
        let mut patch = ItemPatch::default();
        if from.time_slot != to.time_slot {
            patch.time_slot = Some(to.time_slot);
        }
        if from.room != to.room {
            patch.room = Some(to.room.clone());
        }
        if from.faculty_id != to.faculty_id {
            patch.faculty_id = Some(to.faculty_id.clone());
        }
        if from.subject != to.subject {
            patch.subject = Some(to.subject.clone());
        }
        if from.student_count != to.student_count {
            patch.student_count = Some(to.student_count);
        }
        if from.depends_on != to.depends_on {
            patch.depends_on = Some(to.depends_on.clone());
        }
        patch
    }
}

/// One timetable entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleItem {
    pub id: ItemId,
    pub time_slot: TimeSlot,
    pub room: String,
    pub faculty_id: String,
    pub subject: String,
    pub student_count: u32,
    /// Items this one requires; they cannot be deleted while this is live
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<ItemId>,
    /// Incremented on every successful mutation
    pub version: Version,
    pub last_modified: Timestamp,
    pub last_modified_by: SiteId,
    /// Vector clock stamp of the last mutation
    #[serde(default)]
    pub clock: VectorClock,
    /// Soft delete flag (tombstone)
    #[serde(default)]
    pub deleted: bool,
}

impl ScheduleItem {
    /// Create a new item at version 1.
    pub fn from_draft(
        draft: ItemDraft,
        at: Timestamp,
        by: impl Into<UserId>,
        clock: VectorClock,
    ) -> Self {
        Self {
            id: draft.id,
            time_slot: draft.time_slot,
            room: draft.room,
            faculty_id: draft.faculty_id,
            subject: draft.subject,
            student_count: draft.student_count,
            depends_on: draft.depends_on,
            version: 1,
            last_modified: at,
            last_modified_by: by.into(),
            clock,
            deleted: false,
        }
    }

    /// Check if item is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Apply a field delta as one mutation.
    pub fn apply_patch(&mut self, patch: &ItemPatch, attribution: Attribution, clock: VectorClock) {
        patch.apply_fields(self);
        self.touch(attribution, clock);
    }

    /// Move the item to another time slot and room.
    pub fn relocate(
        &mut self,
        time_slot: TimeSlot,
        room: impl Into<String>,
        attribution: Attribution,
        clock: VectorClock,
    ) {
        self.time_slot = time_slot;
        self.room = room.into();
        self.touch(attribution, clock);
    }

    /// Mark item as deleted (tombstone).
    pub fn mark_deleted(&mut self, attribution: Attribution, clock: VectorClock) {
        self.deleted = true;
        self.touch(attribution, clock);
    }

    fn touch(&mut self, attribution: Attribution, clock: VectorClock) {
        self.version += 1;
        self.last_modified = attribution.at;
        self.last_modified_by = attribution.site_id;
        self.clock = clock;
    }

    /// JSON value of one field.
    pub fn value_of(&self, field: Field) -> Value {
        match field {
            Field::TimeSlot => json!(self.time_slot.to_string()),
            Field::Room => json!(self.room),
            Field::FacultyId => json!(self.faculty_id),
            Field::Subject => json!(self.subject),
            Field::StudentCount => json!(self.student_count),
            Field::DependsOn => json!(self.depends_on),
        }
    }

    /// Fields whose values differ between the two items.
    pub fn differing_fields(&self, other: &ScheduleItem) -> Vec<Field> {
        Field::ALL
            .into_iter()
            .filter(|field| self.value_of(*field) != other.value_of(*field))
            .collect()
    }

    /// Same user-visible content (fields and tombstone), ignoring metadata.
    pub fn same_content(&self, other: &ScheduleItem) -> bool {
        self.deleted == other.deleted && self.differing_fields(other).is_empty()
    }

    /// True if this live item books `room` at a time overlapping `slot`.
    pub fn occupies(&self, slot: &TimeSlot, room: &str) -> bool {
        self.is_active() && self.room == room && self.time_slot.overlaps(slot)
    }

    /// True if this live item books `faculty_id` at a time overlapping `slot`.
    pub fn books_faculty(&self, slot: &TimeSlot, faculty_id: &str) -> bool {
        self.is_active() && self.faculty_id == faculty_id && self.time_slot.overlaps(slot)
    }

    /// The item's content as a draft.
    pub fn to_draft(&self) -> ItemDraft {
        ItemDraft {
            id: self.id.clone(),
            time_slot: self.time_slot,
            room: self.room.clone(),
            faculty_id: self.faculty_id.clone(),
            subject: self.subject.clone(),
            student_count: self.student_count,
            depends_on: self.depends_on.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(s: &str) -> TimeSlot {
        s.parse().unwrap()
    }

    fn item() -> ScheduleItem {
        let draft = ItemDraft::new("cs101", slot("09:00-10:00"), "Room101", "f-1", "Algorithms")
            .with_student_count(40);
        ScheduleItem::from_draft(draft, 1000, "alice", VectorClock::from_entries([("alice", 1)]))
    }

    #[test]
    fn parse_and_display_time_slot() {
        let s = slot("09:05-10:30");
        assert_eq!(s.start(), 9 * 60 + 5);
        assert_eq!(s.end(), 10 * 60 + 30);
        assert_eq!(s.duration(), 85);
        assert_eq!(s.to_string(), "09:05-10:30");
    }

    #[test]
    fn reject_bad_time_slots() {
        assert!("10:00-09:00".parse::<TimeSlot>().is_err());
        assert!("10:00-10:00".parse::<TimeSlot>().is_err());
        assert!("25:00-26:00".parse::<TimeSlot>().is_err());
        assert!("09:60-10:00".parse::<TimeSlot>().is_err());
        assert!("0900-1000".parse::<TimeSlot>().is_err());
        assert!("23:00-24:00".parse::<TimeSlot>().is_ok());
    }

    #[test]
    fn overlap_is_half_open() {
        assert!(slot("09:00-10:00").overlaps(&slot("09:30-10:30")));
        assert!(!slot("09:00-10:00").overlaps(&slot("10:00-11:00")));
        assert!(slot("09:00-12:00").overlaps(&slot("10:00-11:00")));
    }

    #[test]
    fn shift_stays_within_day() {
        assert_eq!(slot("09:00-10:00").shifted(60), Some(slot("10:00-11:00")));
        assert_eq!(slot("23:00-24:00").shifted(60), None);
    }

    #[test]
    fn time_slot_serializes_as_string() {
        let json = serde_json::to_string(&slot("08:00-09:30")).unwrap();
        assert_eq!(json, r#""08:00-09:30""#);
        assert!(serde_json::from_str::<TimeSlot>(r#""nope""#).is_err());
    }

    #[test]
    fn new_item_starts_at_version_one() {
        let item = item();
        assert_eq!(item.version, 1);
        assert_eq!(item.last_modified_by, "alice");
        assert!(item.is_active());
    }

    #[test]
    fn patch_bumps_version_and_attribution() {
        let mut item = item();
        let patch = ItemPatch::default().with_room("Room202").with_student_count(55);
        item.apply_patch(
            &patch,
            Attribution {
                site_id: "bob".into(),
                at: 2000,
            },
            VectorClock::from_entries([("alice", 1), ("bob", 1)]),
        );

        assert_eq!(item.version, 2);
        assert_eq!(item.room, "Room202");
        assert_eq!(item.student_count, 55);
        assert_eq!(item.subject, "Algorithms");
        assert_eq!(item.last_modified, 2000);
        assert_eq!(item.last_modified_by, "bob");
    }

    #[test]
    fn patch_between_items() {
        let before = item();
        let mut after = before.clone();
        after.room = "Room303".into();
        after.time_slot = slot("11:00-12:00");

        let patch = ItemPatch::between(&before, &after);
        assert_eq!(patch.fields(), vec![Field::TimeSlot, Field::Room]);
        assert_eq!(patch.value_of(Field::Room), Some(json!("Room303")));
        assert!(ItemPatch::between(&before, &before).is_empty());
    }

    #[test]
    fn delete_keeps_tombstone() {
        let mut item = item();
        item.mark_deleted(
            Attribution {
                site_id: "alice".into(),
                at: 3000,
            },
            VectorClock::from_entries([("alice", 2)]),
        );
        assert!(item.deleted);
        assert_eq!(item.version, 2);
        assert!(!item.occupies(&slot("09:00-10:00"), "Room101"));
    }

    #[test]
    fn serialization_roundtrip() {
        let item = item();
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains(r#""timeSlot":"09:00-10:00""#));
        assert!(json.contains("lastModifiedBy"));
        let parsed: ScheduleItem = serde_json::from_str(&json).unwrap();
        assert_eq!(item, parsed);
    }
}
