use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::{FileFingerprint, IndexEntry, IndexTable, TurnFile, TurnOffsetIndex};
use crate::error::{Result, SporcError};

const SCHEMA_VERSION: &str = "1";

/// SQLite sidecar holding one persisted [`TurnOffsetIndex`].
pub struct IndexStore {
    conn: Connection,
    path: PathBuf,
}

impl IndexStore {
    /// Open (or create) the index database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        create_schema(&conn)?;

        Ok(IndexStore {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace whatever is stored with `index`, in one transaction.
    pub fn save(&self, index: &TurnOffsetIndex) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(
            "DELETE FROM index_meta;
             DELETE FROM turn_files;
             DELETE FROM turn_offsets;
             DELETE FROM fragmented_keys;",
        )?;

        {
            let mut meta = tx.prepare("INSERT INTO index_meta (key, value) VALUES (?1, ?2)")?;
            meta.execute(params!["schema_version", SCHEMA_VERSION])?;
            meta.execute(params!["complete", if index.complete { "1" } else { "0" }])?;
            meta.execute(params!["malformed", index.malformed.to_string()])?;
            meta.execute(params!["built_at", index.built_at.to_rfc3339()])?;

            let mut files = tx.prepare(
                "INSERT INTO turn_files (file_id, path, size, modified_ns, head_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for f in &index.files {
                files.execute(params![
                    f.id as i64,
                    f.path.to_string_lossy(),
                    f.fingerprint.size as i64,
                    f.fingerprint.modified_ns,
                    f.fingerprint.head_hash as i64,
                ])?;
            }

            let mut offsets = tx.prepare(
                "INSERT INTO turn_offsets (record_key, file_id, byte_offset, byte_length)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (key, e) in &index.table.entries {
                offsets.execute(params![key, e.file_id as i64, e.offset as i64, e.length as i64])?;
            }

            let mut frag = tx.prepare("INSERT INTO fragmented_keys (record_key) VALUES (?1)")?;
            for key in &index.table.fragmented {
                frag.execute([key])?;
            }
        }

        tx.commit()?;
        info!(
            "Saved turn index ({} records) to {}",
            index.table.entries.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Read the stored index, or `None` if nothing has been saved yet.
    pub fn load(&self) -> Result<Option<TurnOffsetIndex>> {
        let Some(version) = self.meta("schema_version")? else {
            return Ok(None);
        };
        if version != SCHEMA_VERSION {
            return Err(SporcError::StaleIndex(format!(
                "index schema version {version}, expected {SCHEMA_VERSION}"
            )));
        }

        let complete = self.meta("complete")?.as_deref() == Some("1");
        let malformed = self
            .meta("malformed")?
            .and_then(|m| m.parse().ok())
            .unwrap_or(0);
        let built_at = self
            .meta("built_at")?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let mut stmt = self.conn.prepare(
            "SELECT file_id, path, size, modified_ns, head_hash FROM turn_files ORDER BY file_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TurnFile {
                id: row.get::<_, i64>(0)? as usize,
                path: PathBuf::from(row.get::<_, String>(1)?),
                fingerprint: FileFingerprint {
                    size: row.get::<_, i64>(2)? as u64,
                    modified_ns: row.get(3)?,
                    head_hash: row.get::<_, i64>(4)? as u64,
                },
            })
        })?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }

        let mut table = IndexTable::default();
        let mut stmt = self
            .conn
            .prepare("SELECT record_key, file_id, byte_offset, byte_length FROM turn_offsets")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                IndexEntry {
                    file_id: row.get::<_, i64>(1)? as usize,
                    offset: row.get::<_, i64>(2)? as u64,
                    length: row.get::<_, i64>(3)? as u64,
                },
            ))
        })?;
        for row in rows {
            let (key, entry) = row?;
            table.entries.insert(key, entry);
        }

        let mut stmt = self.conn.prepare("SELECT record_key FROM fragmented_keys")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for row in rows {
            table.fragmented.insert(row?);
        }

        Ok(Some(TurnOffsetIndex::from_parts(
            files, table, complete, malformed, built_at,
        )))
    }

    fn meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM index_meta WHERE key = ?1", [key], |r| r.get(0))
            .optional()?)
    }
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS turn_files (
            file_id INTEGER PRIMARY KEY,
            path TEXT NOT NULL,
            size INTEGER NOT NULL,
            modified_ns INTEGER NOT NULL,
            head_hash INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS turn_offsets (
            record_key TEXT PRIMARY KEY,
            file_id INTEGER NOT NULL REFERENCES turn_files(file_id),
            byte_offset INTEGER NOT NULL,
            byte_length INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS fragmented_keys (
            record_key TEXT PRIMARY KEY
        );
        ",
    )
}
