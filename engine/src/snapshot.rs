//! Snapshot types for persisting and restoring documents.
//!
//! Snapshots are the bridge between an in-memory [`ScheduleDocument`] and
//! persistent storage, and the unit two sites exchange to reconcile.
//! They are designed for deterministic serialization to ensure consistency.

use crate::{
    error::Result, DocumentId, Error, ItemId, ScheduleDocument, ScheduleItem, SiteId, Timestamp,
    VectorClock,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of a document.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    pub document_id: DocumentId,
    /// Site that took the snapshot
    pub site_id: SiteId,
    /// Document clock at snapshot time
    pub clock: VectorClock,
    /// All items, tombstones included, by id
    pub items: BTreeMap<ItemId, ScheduleItem>,
    pub taken_at: Timestamp,
}

impl DocumentSnapshot {
    /// Create an empty snapshot.
    pub fn new(document_id: impl Into<DocumentId>, site_id: impl Into<SiteId>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            document_id: document_id.into(),
            site_id: site_id.into(),
            clock: VectorClock::new(),
            items: BTreeMap::new(),
            taken_at: 0,
        }
    }

    /// Capture a document.
    pub fn from_document(
        document: &ScheduleDocument,
        document_id: impl Into<DocumentId>,
        site_id: impl Into<SiteId>,
        taken_at: Timestamp,
    ) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            document_id: document_id.into(),
            site_id: site_id.into(),
            clock: document.clock().clone(),
            items: document
                .all_items()
                .map(|item| (item.id.clone(), item.clone()))
                .collect(),
            taken_at,
        }
    }

    /// Rebuild the document, checking the snapshot is consistent.
    pub fn into_document(self) -> Result<ScheduleDocument> {
        self.validate()?;
        let mut document = ScheduleDocument::from_items(self.items.into_values());
        document.set_clock(self.clock);
        Ok(document)
    }

    /// Check format version, item keys and clocks.
    ///
    /// The document clock must cover every item stamp; anything else means
    /// the snapshot was assembled from inconsistent state.
    pub fn validate(&self) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        for (id, item) in &self.items {
            if id != &item.id {
                return Err(Error::InvalidSnapshot(format!(
                    "item stored under {id} has id {}",
                    item.id
                )));
            }
            if item.version == 0 {
                return Err(Error::InvalidSnapshot(format!("item {id} has version 0")));
            }
            if !self.clock.dominates(&item.clock) {
                return Err(Error::CorruptClock(format!(
                    "document clock does not cover item {id}"
                )));
            }
        }

        Ok(())
    }

    /// Count of live items.
    pub fn active_item_count(&self) -> usize {
        self.items.values().filter(|item| item.is_active()).count()
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ItemDraft, OpKind, Operation};

    fn document() -> ScheduleDocument {
        let mut document = ScheduleDocument::new();
        for (i, (id, time)) in [("cs101", "09:00-10:00"), ("cs102", "10:00-11:00")]
            .into_iter()
            .enumerate()
        {
            let op = Operation::new(
                format!("op-{i}"),
                OpKind::insert(ItemDraft::new(id, time.parse().unwrap(), "Room101", "f-1", "S")),
                1000,
            )
            .by("alice")
            .with_clock(VectorClock::from_entries([("alice", i as u64 + 1)]));
            document.apply(&op).unwrap();
        }
        document
            .apply(&Operation::new("op-d", OpKind::delete("cs102", None), 2000).by("alice"))
            .unwrap();
        document
    }

    #[test]
    fn capture_and_restore() {
        let doc = document();
        let snapshot = DocumentSnapshot::from_document(&doc, "doc-1", "server", 5000);
        assert_eq!(snapshot.items.len(), 2);
        assert_eq!(snapshot.active_item_count(), 1);
        assert_eq!(snapshot.clock.get("alice"), 2);

        let restored = snapshot.into_document().unwrap();
        assert_eq!(restored, doc);
        assert!(restored.get_including_deleted("cs102").unwrap().deleted);
    }

    #[test]
    fn json_roundtrip_is_deterministic() {
        let doc = document();
        let snapshot = DocumentSnapshot::from_document(&doc, "doc-1", "server", 5000);
        let json = snapshot.to_json().unwrap();
        assert!(json.contains(r#""formatVersion":1"#));
        assert_eq!(DocumentSnapshot::from_json(&json).unwrap(), snapshot);
        assert_eq!(
            DocumentSnapshot::from_document(&doc, "doc-1", "server", 5000)
                .to_json()
                .unwrap(),
            json
        );
    }

    #[test]
    fn reject_future_format() {
        let mut snapshot = DocumentSnapshot::new("doc-1", "server");
        snapshot.format_version = SNAPSHOT_FORMAT_VERSION + 1;
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(matches!(
            DocumentSnapshot::from_json(&json),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn reject_mismatched_key() {
        let doc = document();
        let mut snapshot = DocumentSnapshot::from_document(&doc, "doc-1", "server", 0);
        let item = snapshot.items.remove("cs101").unwrap();
        snapshot.items.insert("other".into(), item);
        assert!(matches!(
            snapshot.into_document(),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn reject_clock_behind_items() {
        let doc = document();
        let mut snapshot = DocumentSnapshot::from_document(&doc, "doc-1", "server", 0);
        snapshot.clock = VectorClock::from_entries([("alice", 1)]);
        assert!(matches!(
            snapshot.validate(),
            Err(Error::CorruptClock(_))
        ));
    }
}
