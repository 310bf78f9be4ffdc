//! Document persistence.
//!
//! Snapshots go to PostgreSQL when a database is configured and to an
//! in-process map otherwise, so the server runs without a database in
//! development and tests.

mod documents;

pub use documents::*;

use dashmap::DashMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use timetable_engine::{DocumentId, DocumentSnapshot, SiteId};

use crate::error::Result;

/// Where document snapshots are kept.
#[derive(Debug)]
pub enum DocumentStore {
    Postgres(PgPool),
    Memory(DashMap<(DocumentId, SiteId), DocumentSnapshot>),
}

impl DocumentStore {
    /// An empty in-memory store.
    pub fn memory() -> Self {
        DocumentStore::Memory(DashMap::new())
    }

    /// Connect to PostgreSQL and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| crate::error::AppError::Internal(format!("migration failed: {e}")))?;

        Ok(DocumentStore::Postgres(pool))
    }

    /// Persist a snapshot, replacing the previous one for the same site.
    pub async fn save(&self, snapshot: &DocumentSnapshot) -> Result<()> {
        match self {
            DocumentStore::Postgres(pool) => upsert_document(pool, snapshot).await?,
            DocumentStore::Memory(map) => {
                map.insert(
                    (snapshot.document_id.clone(), snapshot.site_id.clone()),
                    snapshot.clone(),
                );
            }
        }

        tracing::debug!(
            document_id = %snapshot.document_id,
            site_id = %snapshot.site_id,
            items = snapshot.active_item_count(),
            "Document saved"
        );
        Ok(())
    }

    /// Load the latest snapshot of a document for a site.
    pub async fn load(&self, document_id: &str, site_id: &str) -> Result<Option<DocumentSnapshot>> {
        match self {
            DocumentStore::Postgres(pool) => match get_document(pool, document_id, site_id).await? {
                Some(stored) => Ok(Some(stored.to_snapshot()?)),
                None => Ok(None),
            },
            DocumentStore::Memory(map) => Ok(map
                .get(&(document_id.to_string(), site_id.to_string()))
                .map(|entry| entry.value().clone())),
        }
    }
}
