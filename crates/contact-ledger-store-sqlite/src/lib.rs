#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use contact_ledger_core::{
    format_rfc3339, now_utc, ContactId, ContactRecord, PutOutcome, RecordStore, StoreError,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::debug;

const RECORD_MIGRATION_VERSION: i64 = 1;

const SCHEMA_CONTACT_RECORDS_V1: &str = r"
CREATE TABLE IF NOT EXISTS contact_records (
  contact_id TEXT PRIMARY KEY CHECK (length(trim(contact_id)) > 0),
  revision INTEGER NOT NULL CHECK (revision >= 1),
  record_json TEXT NOT NULL,
  expires_at INTEGER NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_contact_records_expires_at
  ON contact_records(expires_at);
";

const RECORD_COLUMNS: &[&str] = &[
    "contact_id",
    "revision",
    "record_json",
    "expires_at",
    "updated_at",
];

/// Durable [`RecordStore`] backed by one SQLite table.
///
/// Conditional puts compare the `revision` column inside a single
/// statement, so several connections (threads or processes) may merge into
/// the same database file without lost updates.
pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Opens `path` and applies pending migrations.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        if table_exists(&self.conn, "contact_records")? {
            ensure_table_has_columns(&self.conn, "contact_records", RECORD_COLUMNS)?;
        }

        self.conn
            .execute_batch(SCHEMA_CONTACT_RECORDS_V1)
            .context("failed to apply contact record schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![RECORD_MIGRATION_VERSION, now],
            )
            .context("failed to register contact record schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to read schema version")
    }

    pub fn load(&self, contact_id: &ContactId) -> Result<Option<ContactRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT revision, record_json FROM contact_records WHERE contact_id = ?1",
                params![contact_id.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to read contact record {contact_id}"))?;

        let Some((revision, json)) = row else {
            return Ok(None);
        };

        let mut record: ContactRecord = serde_json::from_str(&json)
            .with_context(|| format!("invalid stored record JSON for contact {contact_id}"))?;
        if &record.contact_id != contact_id {
            return Err(anyhow!(
                "stored record under {contact_id} belongs to contact {}",
                record.contact_id
            ));
        }
        record.revision = u64::try_from(revision)
            .with_context(|| format!("invalid stored revision {revision} for {contact_id}"))?;

        debug!(%contact_id, revision, "loaded contact record");
        Ok(Some(record))
    }

    pub fn save(
        &self,
        record: &ContactRecord,
        expected_revision: Option<u64>,
    ) -> Result<PutOutcome> {
        let required_revision = expected_revision.map_or(1, |revision| revision + 1);
        if record.revision != required_revision {
            return Err(anyhow!(
                "record revision {} does not follow expected revision {:?}",
                record.revision,
                expected_revision
            ));
        }

        let payload = serde_json::to_string(record).context("failed to serialize contact record")?;
        let revision = i64::try_from(record.revision).context("record revision overflows i64")?;
        let now = format_rfc3339(now_utc())?;

        let changed = match expected_revision {
            None => self
                .conn
                .execute(
                    "INSERT INTO contact_records(
                       contact_id, revision, record_json, expires_at, updated_at
                     )
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(contact_id) DO NOTHING",
                    params![
                        record.contact_id.as_str(),
                        revision,
                        payload,
                        record.expires_at,
                        now
                    ],
                )
                .context("failed to insert contact record")?,
            Some(expected) => {
                let expected =
                    i64::try_from(expected).context("expected revision overflows i64")?;
                self.conn
                    .execute(
                        "UPDATE contact_records
                         SET revision = ?2, record_json = ?3, expires_at = ?4, updated_at = ?5
                         WHERE contact_id = ?1 AND revision = ?6",
                        params![
                            record.contact_id.as_str(),
                            revision,
                            payload,
                            record.expires_at,
                            now,
                            expected
                        ],
                    )
                    .context("failed to update contact record")?
            }
        };

        if changed == 0 {
            debug!(
                contact_id = %record.contact_id,
                ?expected_revision,
                "conditional write lost to a concurrent writer"
            );
            return Ok(PutOutcome::Conflict);
        }
        Ok(PutOutcome::Written)
    }

    /// Deletes every record whose expiry is at or before `now`.
    pub fn purge_expired(&self, now: OffsetDateTime) -> Result<usize> {
        let purged = self
            .conn
            .execute(
                "DELETE FROM contact_records WHERE expires_at <= ?1",
                params![now.unix_timestamp()],
            )
            .context("failed to purge expired contact records")?;
        debug!(purged, "purged expired contact records");
        Ok(purged)
    }

    pub fn count_records(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM contact_records", [], |row| row.get(0))
            .context("failed to count contact records")?;
        usize::try_from(count).context("invalid contact record count")
    }

    pub fn list_contact_ids(&self, limit: Option<usize>) -> Result<Vec<ContactId>> {
        let mut query =
            "SELECT contact_id FROM contact_records ORDER BY contact_id ASC".to_string();
        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            let raw = row?;
            ids.push(ContactId::parse(&raw).map_err(|err| anyhow!("stored contact id: {err}"))?);
        }
        Ok(ids)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl RecordStore for SqliteRecordStore {
    fn get(&self, contact_id: &ContactId) -> Result<Option<ContactRecord>, StoreError> {
        self.load(contact_id)
            .map_err(|err| StoreError(format!("{err:#}")))
    }

    fn put(
        &self,
        record: &ContactRecord,
        expected_revision: Option<u64>,
    ) -> Result<PutOutcome, StoreError> {
        self.save(record, expected_revision)
            .map_err(|err| StoreError(format!("{err:#}")))
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "schema compatibility check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}
