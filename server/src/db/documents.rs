//! Database operations for the schedule_documents table.

use std::collections::BTreeMap;

use sqlx::{PgPool, Row};
use timetable_engine::{DocumentSnapshot, ItemId, ScheduleItem, VectorClock};

/// A stored document row from the database.
#[derive(Debug)]
pub struct StoredDocument {
    pub document_id: String,
    pub site_id: String,
    pub format_version: i32,
    pub vector_clock: serde_json::Value,
    pub items: serde_json::Value,
    pub taken_at: i64,
    #[allow(dead_code)]
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredDocument {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredDocument {
            document_id: row.try_get("document_id")?,
            site_id: row.try_get("site_id")?,
            format_version: row.try_get("format_version")?,
            vector_clock: row.try_get("vector_clock")?,
            items: row.try_get("items")?,
            taken_at: row.try_get("taken_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StoredDocument {
    /// Convert a database row back into a validated snapshot.
    pub fn to_snapshot(&self) -> Result<DocumentSnapshot, timetable_engine::Error> {
        let invalid = |e: serde_json::Error| timetable_engine::Error::InvalidSnapshot(e.to_string());

        let clock: VectorClock = serde_json::from_value(self.vector_clock.clone()).map_err(invalid)?;
        let items: BTreeMap<ItemId, ScheduleItem> =
            serde_json::from_value(self.items.clone()).map_err(invalid)?;

        let snapshot = DocumentSnapshot {
            format_version: self.format_version.max(0) as u32,
            document_id: self.document_id.clone(),
            site_id: self.site_id.clone(),
            clock,
            items,
            taken_at: self.taken_at.max(0) as u64,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Insert or replace the stored replica of a document.
pub async fn upsert_document(pool: &PgPool, snapshot: &DocumentSnapshot) -> Result<(), sqlx::Error> {
    let vector_clock = serde_json::to_value(&snapshot.clock)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let items = serde_json::to_value(&snapshot.items).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO schedule_documents (
            document_id, site_id, format_version, vector_clock,
            items, item_count, taken_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (document_id, site_id) DO UPDATE SET
            format_version = EXCLUDED.format_version,
            vector_clock = EXCLUDED.vector_clock,
            items = EXCLUDED.items,
            item_count = EXCLUDED.item_count,
            taken_at = EXCLUDED.taken_at,
            updated_at = NOW()
        "#,
    )
    .bind(&snapshot.document_id)
    .bind(&snapshot.site_id)
    .bind(snapshot.format_version as i32)
    .bind(vector_clock)
    .bind(items)
    .bind(snapshot.active_item_count() as i32)
    .bind(snapshot.taken_at as i64)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get the stored replica of a document for one site.
pub async fn get_document(
    pool: &PgPool,
    document_id: &str,
    site_id: &str,
) -> Result<Option<StoredDocument>, sqlx::Error> {
    sqlx::query_as::<_, StoredDocument>(
        r#"
        SELECT document_id, site_id, format_version, vector_clock,
               items, taken_at, updated_at
        FROM schedule_documents
        WHERE document_id = $1 AND site_id = $2
        "#,
    )
    .bind(document_id)
    .bind(site_id)
    .fetch_optional(pool)
    .await
}
