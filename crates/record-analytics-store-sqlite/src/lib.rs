use std::path::Path;

use anyhow::{anyhow, Context, Result};
use record_analytics_core::{Record, RecordId, RecordInput};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

/// Table written by the legacy web application before versioned migrations existed.
const LEGACY_TABLE: &str = "data_record";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// AUTOINCREMENT keeps deleted ids from being handed out again.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS data_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  value REAL NOT NULL,
  category TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_data_records_category ON data_records(category);
";

const MIGRATION_002_IMPORT_LEGACY_SQL: &str = r"
INSERT OR IGNORE INTO data_records(id, name, value, category)
SELECT id, name, value, category
FROM data_record
WHERE name IS NOT NULL AND value IS NOT NULL AND category IS NOT NULL
ORDER BY id ASC;
";

const SELECT_RECORD_COLUMNS: &str = "SELECT id, name, value, category FROM data_records";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub record_count: u64,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed record store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };
        let inferred_from_legacy = current_version == 0 && table_exists(&self.conn, LEGACY_TABLE)?;

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when the database is newer than this build or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            apply_migration_1(&self.conn)?;
        }

        if version < 2 {
            self.apply_migration_2()?;
        }

        Ok(())
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;

        if table_exists(&tx, LEGACY_TABLE)? {
            let legacy_rows = tx
                .query_row(&format!("SELECT COUNT(*) FROM {LEGACY_TABLE}"), [], |row| {
                    row.get::<_, i64>(0)
                })
                .context("failed to count legacy records")?;
            let imported = tx
                .execute(MIGRATION_002_IMPORT_LEGACY_SQL, [])
                .context("failed to import legacy records")?;
            let imported = i64::try_from(imported).unwrap_or(i64::MAX);
            let skipped = legacy_rows.saturating_sub(imported);

            tracing::info!(imported, skipped, "imported legacy {LEGACY_TABLE} rows");
            if skipped > 0 {
                tracing::warn!(skipped, "legacy rows with missing fields were not imported");
            }
        }

        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Persist one new record; the store assigns its id.
    ///
    /// # Errors
    /// Returns an error when validation fails or the insert fails.
    pub fn insert_record(&mut self, input: &RecordInput) -> Result<Record> {
        input.validate().map_err(|err| anyhow!("record validation failed: {err}"))?;

        self.conn
            .execute(
                "INSERT INTO data_records(name, value, category) VALUES (?1, ?2, ?3)",
                params![input.name, input.value, input.category],
            )
            .context("failed to insert record")?;

        let id = self.conn.last_insert_rowid();
        Ok(input.clone().into_record(id))
    }

    /// Replace the fields of one record. Returns `None` when the id is unknown.
    ///
    /// # Errors
    /// Returns an error when validation fails or the update fails.
    pub fn update_record(&mut self, id: RecordId, input: &RecordInput) -> Result<Option<Record>> {
        input.validate().map_err(|err| anyhow!("record validation failed: {err}"))?;

        let changed = self
            .conn
            .execute(
                "UPDATE data_records SET name = ?1, value = ?2, category = ?3 WHERE id = ?4",
                params![input.name, input.value, input.category, id],
            )
            .with_context(|| format!("failed to update record {id}"))?;

        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(input.clone().into_record(id)))
    }

    /// Delete one record. Returns `false` when the id is unknown.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_record(&mut self, id: RecordId) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM data_records WHERE id = ?1", params![id])
            .with_context(|| format!("failed to delete record {id}"))?;
        Ok(changed > 0)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_record(&self, id: RecordId) -> Result<Option<Record>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_RECORD_COLUMNS} WHERE id = ?1"))
            .context("failed to prepare record lookup")?;
        let mut rows = stmt.query(params![id])?;
        rows.next()?.map(record_from_row).transpose()
    }

    /// Load every record in id order as one snapshot.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or a stored value is not numeric.
    pub fn list_records(&self) -> Result<Vec<Record>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_RECORD_COLUMNS} ORDER BY id ASC"))
            .context("failed to prepare record listing")?;

        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(record_from_row(row)?);
        }

        Ok(records)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn record_count(&self) -> Result<u64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM data_records", [], |row| row.get::<_, i64>(0))
            .context("failed to count records")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Run quick-check, record count, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let record_count =
            if table_exists(&self.conn, "data_records")? { self.record_count()? } else { 0 };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            record_count,
            schema_status,
        })
    }
}

fn record_from_row(row: &Row<'_>) -> Result<Record> {
    let id: RecordId = row.get(0).context("failed to decode record id")?;
    Ok(Record {
        id,
        name: row.get(1).with_context(|| format!("failed to decode name of record {id}"))?,
        value: row.get(2).with_context(|| format!("record {id} has a non-numeric value"))?,
        category: row
            .get(3)
            .with_context(|| format!("failed to decode category of record {id}"))?,
    })
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;

    use super::*;

    fn input(name: &str, value: f64, category: &str) -> RecordInput {
        RecordInput { name: name.to_string(), value, category: category.to_string() }
    }

    fn migrated_memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn create_legacy_table(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE data_record (
                id INTEGER NOT NULL PRIMARY KEY,
                name VARCHAR(100),
                value FLOAT,
                category VARCHAR(50)
            );",
        )?;
        Ok(())
    }

    // Test IDs: TST-001
    #[test]
    fn insert_and_list_round_trip_in_id_order() -> Result<()> {
        let mut store = migrated_memory_store()?;

        let first = store.insert_record(&input("A", 10.0, "x"))?;
        let second = store.insert_record(&input("B", 20.0, "y"))?;
        assert!(second.id > first.id);

        let records = store.list_records()?;
        assert_eq!(records, vec![first, second]);
        assert_eq!(store.record_count()?, 2);
        Ok(())
    }

    // Test IDs: TST-002
    #[test]
    fn deleted_ids_are_never_reused() -> Result<()> {
        let mut store = migrated_memory_store()?;

        let _first = store.insert_record(&input("A", 1.0, "x"))?;
        let second = store.insert_record(&input("B", 2.0, "x"))?;
        assert!(store.delete_record(second.id)?);

        let third = store.insert_record(&input("C", 3.0, "x"))?;
        assert!(third.id > second.id);
        Ok(())
    }

    // Test IDs: TST-003
    #[test]
    fn update_and_delete_report_unknown_ids() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let record = store.insert_record(&input("A", 1.0, "x"))?;

        let updated = store.update_record(record.id, &input("A2", 5.5, "z"))?;
        assert_eq!(updated, Some(input("A2", 5.5, "z").into_record(record.id)));
        assert_eq!(store.get_record(record.id)?, updated);

        assert_eq!(store.update_record(record.id + 100, &input("B", 1.0, "x"))?, None);
        assert!(!store.delete_record(record.id + 100)?);
        assert!(store.delete_record(record.id)?);
        assert_eq!(store.get_record(record.id)?, None);
        Ok(())
    }

    // Test IDs: TST-004
    #[test]
    fn insert_rejects_non_finite_value() -> Result<()> {
        let mut store = migrated_memory_store()?;

        let err = match store.insert_record(&input("bad", f64::NAN, "x")) {
            Ok(record) => return Err(anyhow!("expected validation failure, stored {record:?}")),
            Err(err) => err,
        };
        assert!(err.to_string().contains("record validation failed"));
        assert_eq!(store.record_count()?, 0);
        Ok(())
    }

    // Test IDs: TST-005
    #[test]
    fn list_records_fails_on_non_numeric_value() -> Result<()> {
        let store = migrated_memory_store()?;
        store.conn.execute(
            "INSERT INTO data_records(name, value, category) VALUES ('corrupt', 'abc', 'x')",
            [],
        )?;

        let err = match store.list_records() {
            Ok(records) => return Err(anyhow!("expected decode failure, got {records:?}")),
            Err(err) => err,
        };
        assert!(err.to_string().contains("non-numeric value"));
        Ok(())
    }

    // Test IDs: TDB-001
    #[test]
    fn fresh_database_migrates_to_latest() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;

        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);
        assert!(!before.inferred_from_legacy);

        store.migrate()?;
        store.migrate()?;

        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn migrate_imports_complete_legacy_rows() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        create_legacy_table(&store.conn)?;
        store.conn.execute_batch(
            "INSERT INTO data_record(id, name, value, category) VALUES (4, 'A', 10.0, 'x');
             INSERT INTO data_record(id, name, value, category) VALUES (7, 'B', '20.5', 'y');
             INSERT INTO data_record(id, name, value, category) VALUES (9, 'C', 30.0, NULL);",
        )?;

        let status = store.schema_status()?;
        assert!(status.inferred_from_legacy);
        assert_eq!(status.pending_versions, vec![1, 2]);

        store.migrate()?;

        let records = store.list_records()?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], input("A", 10.0, "x").into_record(4));
        assert_eq!(records[1], input("B", 20.5, "y").into_record(7));

        let next = store.insert_record(&input("D", 1.0, "x"))?;
        assert!(next.id > 7);

        assert!(!store.schema_status()?.inferred_from_legacy);
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn migrate_rejects_newer_schema_versions() -> Result<()> {
        let mut store = migrated_memory_store()?;
        record_schema_version(&store.conn, LATEST_SCHEMA_VERSION + 1)?;

        let err = match store.migrate() {
            Ok(()) => return Err(anyhow!("expected migration to refuse a newer schema")),
            Err(err) => err,
        };
        assert!(err.to_string().contains("unsupported schema version"));
        Ok(())
    }

    // Test IDs: TDB-004
    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let _record = store.insert_record(&input("A", 1.0, "x"))?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert_eq!(report.record_count, 1);
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_writes_and_snapshot_reads_preserve_integrity() -> Result<()> {
        let db_path = std::env::temp_dir()
            .join(format!("record-analytics-concurrency-{}.sqlite3", ulid::Ulid::new()));
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
        }

        let writer_threads = 4;
        let writes_per_thread = 20;
        let reader_threads = 2;
        let read_iterations = 30;

        let mut handles = Vec::new();

        for writer in 0..writer_threads {
            let writer_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let mut store = SqliteStore::open(&writer_path)?;
                let category = format!("writer-{writer}");
                for _ in 0..writes_per_thread {
                    store.insert_record(&input("concurrent", 1.5, &category))?;
                }
                Ok(())
            }));
        }

        for _ in 0..reader_threads {
            let reader_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let store = SqliteStore::open(&reader_path)?;
                for _ in 0..read_iterations {
                    let snapshot = store.list_records()?;
                    let mut ids = snapshot.iter().map(|record| record.id).collect::<Vec<_>>();
                    ids.dedup();
                    if ids.len() != snapshot.len() {
                        return Err(anyhow!("snapshot contained duplicate ids"));
                    }
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteStore::open(&db_path)?;
        let records = store.list_records()?;
        assert_eq!(records.len(), writer_threads * writes_per_thread);

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);

        for suffix in ["", "-wal", "-shm"] {
            let path = std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }

        Ok(())
    }
}
