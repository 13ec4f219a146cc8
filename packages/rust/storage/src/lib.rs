//! libSQL reference store and the document-id ledger.
//!
//! [`ReferenceStore`] wraps a local libSQL database of report references and
//! answers the three selection queries a build needs. [`DocumentLedger`] is
//! the JSON file mapping uploaded file names to remote document ids.
//!
//! **Access rules:**
//! - builds read through [`ReferenceStore::open_readonly`]
//! - seeding and imports write through [`ReferenceStore::open`]

mod filter;
mod ledger;
mod migrations;

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database, params};
use refkb_shared::{ExtraAttributes, QueryConditions, RefKbError, ReferenceRecord, Result};

pub use ledger::DocumentLedger;

const SELECT_COLUMNS: &str =
    "SELECT id, title, content, source_type, source_id, attachment_url, created_at, extra \
     FROM reference_items";

const ORDER_NEWEST_FIRST: &str = "ORDER BY datetime(created_at) DESC, id DESC";

/// Read-mostly handle over the `reference_items` table.
pub struct ReferenceStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl ReferenceStore {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RefKbError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| RefKbError::Storage(e.to_string()))?;
        let conn = db.connect().map_err(|e| RefKbError::Storage(e.to_string()))?;

        let store = Self {
            db,
            conn,
            readonly: false,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open an existing database at `path`; writes are rejected.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RefKbError::Storage(format!(
                "reference database not found: {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| RefKbError::Storage(e.to_string()))?;
        let conn = db.connect().map_err(|e| RefKbError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    RefKbError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    pub async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(RefKbError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Records with exactly this id (zero or one).
    pub async fn query_by_id(&self, id: &str) -> Result<Vec<ReferenceRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1 {ORDER_NEWEST_FIRST}");
        self.collect(&sql, params![id]).await
    }

    /// Records matching every present part of `conditions`, newest first.
    pub async fn query_by_conditions(
        &self,
        conditions: &QueryConditions,
    ) -> Result<Vec<ReferenceRecord>> {
        let filter = filter::build_filter(conditions)?;
        let sql = if filter.clause.is_empty() {
            format!("{SELECT_COLUMNS} {ORDER_NEWEST_FIRST}")
        } else {
            format!("{SELECT_COLUMNS} WHERE {} {ORDER_NEWEST_FIRST}", filter.clause)
        };
        tracing::debug!(%sql, params = filter.values.len(), "querying references");
        self.collect(&sql, libsql::params::params_from_iter(filter.values))
            .await
    }

    /// The `limit` most recently created records.
    pub async fn query_recent(&self, limit: usize) -> Result<Vec<ReferenceRecord>> {
        let sql = format!("{SELECT_COLUMNS} {ORDER_NEWEST_FIRST} LIMIT ?1");
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.collect(&sql, params![limit]).await
    }

    pub async fn count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM reference_items", params![])
            .await
            .map_err(|e| RefKbError::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map(|n| n.max(0) as u64)
                .map_err(|e| RefKbError::Storage(e.to_string())),
            Ok(None) => Ok(0),
            Err(e) => Err(RefKbError::Storage(e.to_string())),
        }
    }

    async fn collect(&self, sql: &str, params: impl IntoParams) -> Result<Vec<ReferenceRecord>> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(|e| RefKbError::Storage(e.to_string()))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| RefKbError::Storage(e.to_string()))?
        {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert a record, replacing any existing row with the same id.
    pub async fn insert_record(&self, record: &ReferenceRecord) -> Result<()> {
        self.check_writable()?;
        let created_at = record.created_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let extra = serde_json::to_string(&record.extra)
            .map_err(|e| RefKbError::Storage(format!("invalid extra attributes: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO reference_items
                   (id, title, content, source_type, source_id, attachment_url, extra, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                   title = excluded.title,
                   content = excluded.content,
                   source_type = excluded.source_type,
                   source_id = excluded.source_id,
                   attachment_url = excluded.attachment_url,
                   extra = excluded.extra,
                   created_at = excluded.created_at,
                   updated_at = excluded.updated_at",
                params![
                    record.id.as_str(),
                    record.title.as_str(),
                    record.content.as_str(),
                    record.source_type.as_str(),
                    record.source_id.as_deref(),
                    record.attachment_url.as_deref(),
                    extra.as_str(),
                    created_at.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| RefKbError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// Convert a database row to a [`ReferenceRecord`].
fn row_to_record(row: &libsql::Row) -> Result<ReferenceRecord> {
    let text = |idx: i32| {
        row.get::<String>(idx)
            .map_err(|e| RefKbError::Storage(e.to_string()))
    };

    let created_at = parse_timestamp(&text(6)?)?;
    let extra = match row.get::<String>(7).ok() {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str::<ExtraAttributes>(&raw)
            .map_err(|e| RefKbError::Storage(format!("invalid extra JSON: {e}")))?,
        _ => ExtraAttributes::new(),
    };

    Ok(ReferenceRecord {
        id: text(0)?,
        title: text(1)?,
        content: row.get::<String>(2).unwrap_or_default(),
        source_type: text(3)?,
        source_id: row.get::<String>(4).ok(),
        attachment_url: row.get::<String>(5).ok(),
        created_at,
        extra,
    })
}

/// RFC 3339, or SQLite's `YYYY-MM-DD HH:MM:SS` taken as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| RefKbError::Storage(format!("invalid date {raw:?}: {e}")))
}
