use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};

use super::{walk_turns, TextMatch, TurnFilters, TurnHit, TurnQuery};
use crate::error::{Result, SporcError};
use crate::index::{seekable_paths, FileFingerprint};
use crate::source::CorpusSource;

const SCHEMA_VERSION: &str = "1";

/// What a text index build wrote.
#[derive(Debug, Clone, Serialize)]
pub struct TextIndexSummary {
    pub turns: usize,
    pub records: usize,
    pub skipped_lines: usize,
    pub built_at: DateTime<Utc>,
    pub path: PathBuf,
}

/// SQLite FTS5 database over every turn's text, fingerprinted against the
/// turn files it was built from.
pub struct TextIndex {
    conn: Connection,
    path: PathBuf,
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS text_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS text_files (
            file_id INTEGER PRIMARY KEY,
            path TEXT NOT NULL,
            size INTEGER NOT NULL,
            modified_ns INTEGER NOT NULL,
            head_hash INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS turns (
            rowid INTEGER PRIMARY KEY,
            record_key TEXT NOT NULL,
            podcast_title TEXT NOT NULL DEFAULT '',
            speaker TEXT NOT NULL DEFAULT '',
            role TEXT,
            turn_count INTEGER NOT NULL DEFAULT 0,
            start_time REAL NOT NULL DEFAULT 0,
            end_time REAL NOT NULL DEFAULT 0,
            text TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_turns_record ON turns(record_key);

        CREATE VIRTUAL TABLE IF NOT EXISTS turns_fts USING fts5(
            text,
            content='turns',
            content_rowid='rowid'
        );

        CREATE TRIGGER IF NOT EXISTS turns_ai AFTER INSERT ON turns BEGIN
            INSERT INTO turns_fts(rowid, text) VALUES (new.rowid, new.text);
        END;
        ",
    )?;
    Ok(())
}

fn connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

impl TextIndex {
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join(".sporc").join("turn_text.db")
    }

    /// Replace the database at `path` with the text of every turn in
    /// `source` whose record `titles` knows (key to podcast title).
    pub fn build(source: &CorpusSource, titles: &HashMap<String, String>, path: &Path) -> Result<TextIndexSummary> {
        let paths = seekable_paths(source)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = connect(path)?;
        let built_at = Utc::now();

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(
            "DROP TABLE IF EXISTS turns_fts;
             DROP TABLE IF EXISTS turns;
             DROP TABLE IF EXISTS text_files;
             DROP TABLE IF EXISTS text_meta;",
        )?;
        create_schema(&tx)?;

        let mut turns = 0;
        let mut records: HashSet<String> = HashSet::new();
        let mut failure: Option<SporcError> = None;
        let skipped_lines = {
            let mut insert = tx.prepare(
                "INSERT INTO turns (record_key, podcast_title, speaker, role, turn_count, start_time, end_time, text)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            walk_turns(source, titles, &TurnFilters::default(), &mut |key, title, batch| {
                for turn in batch {
                    let written = insert.execute(params![
                        key,
                        title,
                        turn.primary_speaker(),
                        turn.inferred_role,
                        turn.turn_count,
                        turn.start_time,
                        turn.end_time,
                        turn.text,
                    ]);
                    if let Err(e) = written {
                        failure = Some(e.into());
                        return false;
                    }
                    turns += 1;
                }
                if !records.contains(key) {
                    records.insert(key.to_string());
                }
                true
            })?
        };
        if let Some(e) = failure {
            return Err(e);
        }

        {
            let mut meta = tx.prepare("INSERT INTO text_meta (key, value) VALUES (?1, ?2)")?;
            meta.execute(params!["schema_version", SCHEMA_VERSION])?;
            meta.execute(params!["built_at", built_at.to_rfc3339()])?;

            let mut files = tx.prepare(
                "INSERT INTO text_files (file_id, path, size, modified_ns, head_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (id, p) in paths.iter().enumerate() {
                let fp = FileFingerprint::of(p)?;
                files.execute(params![
                    id as i64,
                    p.to_string_lossy(),
                    fp.size as i64,
                    fp.modified_ns,
                    fp.head_hash as i64,
                ])?;
            }
        }
        tx.commit()?;

        if skipped_lines > 0 {
            warn!("{skipped_lines} undecodable turn line(s) left out of the text index");
        }
        info!(
            "Indexed text of {turns} turn(s) from {} record(s) into {}",
            records.len(),
            path.display()
        );
        Ok(TextIndexSummary {
            turns,
            records: records.len(),
            skipped_lines,
            built_at,
            path: path.to_path_buf(),
        })
    }

    /// Open a built index, failing with `StaleIndex` if the turn files have
    /// changed since.
    pub fn open(path: &Path, source: &CorpusSource) -> Result<Self> {
        if !path.exists() {
            return Err(SporcError::TextIndexMissing(path.to_path_buf()));
        }
        let conn = connect(path)?;
        create_schema(&conn)?;
        let index = TextIndex {
            conn,
            path: path.to_path_buf(),
        };
        index.validate(&seekable_paths(source)?)?;
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM text_meta WHERE key = ?1", [key], |row| row.get(0))
            .optional()?)
    }

    fn validate(&self, paths: &[PathBuf]) -> Result<()> {
        match self.meta("schema_version")? {
            None => return Err(SporcError::TextIndexMissing(self.path.clone())),
            Some(v) if v != SCHEMA_VERSION => {
                return Err(SporcError::StaleIndex(format!(
                    "text index schema version {v}, expected {SCHEMA_VERSION}"
                )))
            }
            Some(_) => {}
        }

        let mut stmt = self
            .conn
            .prepare("SELECT path, size, modified_ns, head_hash FROM text_files ORDER BY file_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                PathBuf::from(row.get::<_, String>(0)?),
                FileFingerprint {
                    size: row.get::<_, i64>(1)? as u64,
                    modified_ns: row.get(2)?,
                    head_hash: row.get::<_, i64>(3)? as u64,
                },
            ))
        })?;
        let mut stored = Vec::new();
        for row in rows {
            stored.push(row?);
        }

        if stored.len() != paths.len() {
            return Err(SporcError::StaleIndex(format!(
                "text index covers {} turn file(s), source has {}",
                stored.len(),
                paths.len()
            )));
        }
        for ((stored_path, fingerprint), path) in stored.iter().zip(paths) {
            let current = FileFingerprint::of(path).ok();
            if stored_path != path || current.as_ref() != Some(fingerprint) {
                return Err(SporcError::StaleIndex(format!(
                    "{} has changed since the text index was built",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Ranked full-text search. `admit`, when set, keeps only hits on the
    /// listed records; paging then happens after that filter.
    pub fn search(&self, query: &TurnQuery, admit: Option<&HashMap<String, String>>, page: bool) -> Result<Vec<TurnHit>> {
        query.validate()?;
        if query.mode != TextMatch::Fts {
            return Err(SporcError::InvalidQuery(format!(
                "the text index answers fts queries, not {}",
                query.mode
            )));
        }

        let (conditions, filter_params) = query.filters.conditions(2);
        let mut where_parts = vec!["turns_fts MATCH ?1".to_string()];
        where_parts.extend(conditions);
        let limit_param = filter_params.len() + 2;

        let sql = format!(
            "SELECT t.record_key, t.podcast_title, t.speaker, t.role, t.turn_count,
                    t.start_time, t.end_time, t.text, -bm25(turns_fts) AS score
             FROM turns_fts
             JOIN turns t ON t.rowid = turns_fts.rowid
             WHERE {}
             ORDER BY score DESC, t.rowid
             LIMIT ?{} OFFSET ?{}",
            where_parts.join(" AND "),
            limit_param,
            limit_param + 1
        );

        // Filtering after SQL means SQL cannot page.
        let sql_paged = page && admit.is_none();
        let (limit, offset) = if sql_paged {
            (i64::try_from(query.limit).unwrap_or(i64::MAX), query.offset as i64)
        } else {
            (-1, 0)
        };

        let mut all_params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        all_params.push(Box::new(query.text.clone()));
        all_params.extend(filter_params);
        all_params.push(Box::new(limit));
        all_params.push(Box::new(offset));
        let param_refs: Vec<&dyn rusqlite::types::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(TurnHit {
                mp3url: row.get(0)?,
                podcast_title: row.get(1)?,
                speaker: row.get(2)?,
                role: row.get(3)?,
                turn_count: row.get(4)?,
                start_time: row.get(5)?,
                end_time: row.get(6)?,
                text: row.get(7)?,
                score: row.get(8)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            let hit = row?;
            if admit.is_none_or(|keys| keys.contains_key(&hit.mp3url)) {
                results.push(hit);
            }
        }

        if page && !sql_paged {
            Ok(results.into_iter().skip(query.offset).take(query.limit).collect())
        } else {
            Ok(results)
        }
    }
}
