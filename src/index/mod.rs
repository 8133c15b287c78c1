//! Byte-offset index over the turn files.
//!
//! One sequential pass per file records, for every record key, where its
//! chunk starts and how long it is. Only the `mp3url` field of each line is
//! decoded. Lines that fail that decode are skipped and counted.

pub mod background;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

use crate::corpus::rows::KeyOnly;
use crate::error::{Result, SporcError};
use crate::source::CorpusSource;

pub use background::{BuildState, IndexBuildHandle};
pub use store::IndexStore;

const FINGERPRINT_WINDOW: u64 = 64 * 1024;

/// Where one record's chunk lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub file_id: usize,
    pub offset: u64,
    pub length: u64,
}

/// Cheap identity of a backing file: size, mtime and a hash of its first
/// and last 64 KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileFingerprint {
    pub size: u64,
    pub modified_ns: i64,
    pub head_hash: u64,
}

impl FileFingerprint {
    pub fn of(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let meta = file.metadata()?;
        let size = meta.len();
        let modified_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);

        let mut hasher = Xxh3::new();
        let mut buf = vec![0u8; FINGERPRINT_WINDOW as usize];

        let head = read_up_to(&mut file, &mut buf)?;
        hasher.update(&buf[..head]);
        if size > FINGERPRINT_WINDOW {
            let tail_start = size.saturating_sub(FINGERPRINT_WINDOW).max(FINGERPRINT_WINDOW);
            file.seek(SeekFrom::Start(tail_start))?;
            let tail = read_up_to(&mut file, &mut buf)?;
            hasher.update(&buf[..tail]);
        }

        Ok(FileFingerprint {
            size,
            modified_ns,
            head_hash: hasher.digest(),
        })
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// A turn file the index was built against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnFile {
    pub id: usize,
    pub path: PathBuf,
    pub fingerprint: FileFingerprint,
}

/// Key -> entry map plus the keys that cannot be served by one byte range.
#[derive(Debug, Default)]
pub(crate) struct IndexTable {
    pub(crate) entries: HashMap<String, IndexEntry>,
    pub(crate) fragmented: HashSet<String>,
}

impl IndexTable {
    /// Record a contiguous chunk. A key seen twice is split across the file,
    /// so it leaves the map and is marked fragmented.
    pub(crate) fn record(&mut self, key: String, entry: IndexEntry) {
        if self.fragmented.contains(&key) {
            return;
        }
        if self.entries.remove(&key).is_some() {
            debug!("Record {key} is split across several chunks; using full scans for it");
            self.fragmented.insert(key);
            return;
        }
        self.entries.insert(key, entry);
    }
}

/// Offset index over one corpus snapshot's turn files.
#[derive(Debug)]
pub struct TurnOffsetIndex {
    files: Vec<TurnFile>,
    table: IndexTable,
    complete: bool,
    malformed: usize,
    built_at: DateTime<Utc>,
}

impl TurnOffsetIndex {
    /// Scan every turn file of `source` once. Blocks for O(total file size).
    pub fn build(source: &CorpusSource) -> Result<Self> {
        let paths = seekable_paths(source)?;
        Self::build_files(&paths)
    }

    /// Non-blocking variant of [`TurnOffsetIndex::build`]; see [`IndexBuildHandle`].
    pub fn build_async(source: &CorpusSource, persist_to: Option<PathBuf>) -> Result<IndexBuildHandle> {
        background::build_async(source, persist_to)
    }

    pub fn build_files(paths: &[PathBuf]) -> Result<Self> {
        let never = AtomicBool::new(false);
        let mut table = IndexTable::default();
        let mut files = Vec::with_capacity(paths.len());
        let mut malformed = 0;

        for (id, path) in paths.iter().enumerate() {
            let fingerprint = FileFingerprint::of(path)?;
            let outcome = scan_file(id, path, &never, &mut |key, entry| table.record(key, entry))?;
            malformed += outcome.malformed;
            files.push(TurnFile {
                id,
                path: path.clone(),
                fingerprint,
            });
        }

        let index = TurnOffsetIndex {
            files,
            table,
            complete: true,
            malformed,
            built_at: Utc::now(),
        };
        index.log_summary();
        Ok(index)
    }

    pub(crate) fn from_parts(
        files: Vec<TurnFile>,
        table: IndexTable,
        complete: bool,
        malformed: usize,
        built_at: DateTime<Utc>,
    ) -> Self {
        TurnOffsetIndex {
            files,
            table,
            complete,
            malformed,
            built_at,
        }
    }

    fn log_summary(&self) {
        info!(
            "Indexed {} record(s) across {} turn file(s); {} fragmented, {} malformed line(s) skipped",
            self.table.entries.len(),
            self.files.len(),
            self.table.fragmented.len(),
            self.malformed
        );
    }

    pub fn lookup(&self, key: &str) -> Option<IndexEntry> {
        self.table.entries.get(key).copied()
    }

    /// The record's lines are not contiguous, so it has no single entry.
    pub fn is_fragmented(&self, key: &str) -> bool {
        self.table.fragmented.contains(key)
    }

    /// True when every file was scanned to the end.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn len(&self) -> usize {
        self.table.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.entries.is_empty()
    }

    pub fn fragmented_count(&self) -> usize {
        self.table.fragmented.len()
    }

    pub fn malformed(&self) -> usize {
        self.malformed
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn files(&self) -> &[TurnFile] {
        &self.files
    }

    pub fn file(&self, id: usize) -> Option<&TurnFile> {
        self.files.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, IndexEntry)> {
        self.table.entries.iter().map(|(k, e)| (k.as_str(), *e))
    }

    pub fn fragmented_keys(&self) -> impl Iterator<Item = &str> {
        self.table.fragmented.iter().map(String::as_str)
    }

    /// Default sidecar location: `<data_dir>/.sporc/turn_index.db`.
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join(".sporc").join("turn_index.db")
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        IndexStore::open(path)?.save(self)
    }

    /// Load a persisted index, rejecting it with `StaleIndex` unless it is
    /// complete and every backing file still matches its fingerprint.
    pub fn load(path: &Path, source: &CorpusSource) -> Result<Self> {
        let paths = seekable_paths(source)?;
        if !path.exists() {
            return Err(SporcError::StaleIndex(format!(
                "no index stored at {}",
                path.display()
            )));
        }
        let index = IndexStore::open(path)?
            .load()?
            .ok_or_else(|| SporcError::StaleIndex(format!("{} holds no index", path.display())))?;
        index.validate(&paths)?;
        info!("Loaded turn index from {} ({} records)", path.display(), index.len());
        Ok(index)
    }

    /// Load the persisted index, or rebuild and persist it when missing or stale.
    pub fn load_or_build(path: &Path, source: &CorpusSource) -> Result<Self> {
        match Self::load(path, source) {
            Ok(index) => Ok(index),
            Err(SporcError::StaleIndex(reason)) => {
                info!("Rebuilding turn index: {reason}");
                let index = Self::build(source)?;
                index.persist(path)?;
                Ok(index)
            }
            Err(e) => Err(e),
        }
    }

    fn validate(&self, paths: &[PathBuf]) -> Result<()> {
        if !self.complete {
            return Err(SporcError::StaleIndex("stored index is incomplete".into()));
        }
        if self.files.len() != paths.len() {
            return Err(SporcError::StaleIndex(format!(
                "index covers {} turn file(s), source has {}",
                self.files.len(),
                paths.len()
            )));
        }
        for (file, path) in self.files.iter().zip(paths) {
            if &file.path != path {
                return Err(SporcError::StaleIndex(format!(
                    "index was built for {}, not {}",
                    file.path.display(),
                    path.display()
                )));
            }
            let current = match FileFingerprint::of(path) {
                Ok(fp) => fp,
                Err(_) => {
                    return Err(SporcError::StaleIndex(format!(
                        "{} is no longer readable",
                        path.display()
                    )))
                }
            };
            if current != file.fingerprint {
                warn!("Turn file {} changed since the index was built", path.display());
                return Err(SporcError::StaleIndex(format!("{} has changed", path.display())));
            }
        }
        Ok(())
    }
}

/// Local paths of the source's turn files, or `IndexUnavailable`.
pub(crate) fn seekable_paths(source: &CorpusSource) -> Result<Vec<PathBuf>> {
    source
        .turn_files()
        .iter()
        .map(|loc| {
            loc.local_path().map(Path::to_path_buf).ok_or_else(|| {
                SporcError::IndexUnavailable(format!(
                    "{} cannot be read by offset",
                    loc.describe()
                ))
            })
        })
        .collect()
}

pub(crate) struct ScanOutcome {
    pub(crate) malformed: usize,
    pub(crate) cancelled: bool,
}

struct Run {
    key: String,
    start: u64,
    end: u64,
}

/// Scan one turn file, reporting each maximal run of same-key lines.
///
/// Blank lines neither extend nor break a run. A line whose key cannot be
/// decoded ends the current run.
pub(crate) fn scan_file(
    file_id: usize,
    path: &Path,
    stop: &AtomicBool,
    on_chunk: &mut dyn FnMut(String, IndexEntry),
) -> Result<ScanOutcome> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(1024 * 1024, file);
    let mut line = Vec::new();
    let mut offset: u64 = 0;
    let mut run: Option<Run> = None;
    let mut malformed = 0;
    let mut chunks = 0usize;

    let mut flush = |run: Option<Run>, chunks: &mut usize| {
        if let Some(r) = run {
            *chunks += 1;
            on_chunk(
                r.key,
                IndexEntry {
                    file_id,
                    offset: r.start,
                    length: r.end - r.start,
                },
            );
        }
    };

    loop {
        if stop.load(Ordering::Relaxed) {
            debug!("Index scan of {} cancelled at byte {offset}", path.display());
            return Ok(ScanOutcome {
                malformed,
                cancelled: true,
            });
        }

        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        let line_start = offset;
        offset += n as u64;

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match KeyOnly::key_of(&line) {
            Ok(key) => match run.as_mut() {
                Some(r) if r.key == key => r.end = offset,
                _ => {
                    flush(run.take(), &mut chunks);
                    run = Some(Run {
                        key,
                        start: line_start,
                        end: offset,
                    });
                    if chunks > 0 && chunks % 10_000 == 0 {
                        debug!("Indexed {chunks} chunks of {}", path.display());
                    }
                }
            },
            Err(reason) => {
                malformed += 1;
                warn!(
                    "Skipping undecodable turn line at {}:{}: {reason}",
                    path.display(),
                    line_start
                );
                flush(run.take(), &mut chunks);
            }
        }
    }
    flush(run.take(), &mut chunks);

    Ok(ScanOutcome {
        malformed,
        cancelled: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn row(key: &str, start: f64) -> String {
        format!(
            r#"{{"mp3url": "{key}", "speaker": ["SPEAKER_00"], "turnText": "t{start}", "startTime": {start}, "endTime": {}}}"#,
            start + 1.0
        )
    }

    fn write_turns(dir: &TempDir, name: &str, lines: &[String]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    fn slice(path: &Path, entry: IndexEntry) -> String {
        let bytes = fs::read(path).unwrap();
        let start = entry.offset as usize;
        String::from_utf8(bytes[start..start + entry.length as usize].to_vec()).unwrap()
    }

    #[test]
    fn test_build_records_contiguous_runs() {
        let dir = TempDir::new().unwrap();
        let path = write_turns(
            &dir,
            "turns.jsonl",
            &[row("a", 0.0), row("a", 1.0), row("b", 0.0), row("c", 0.0), row("c", 2.0)],
        );

        let index = TurnOffsetIndex::build_files(&[path.clone()]).unwrap();
        assert!(index.is_complete());
        assert_eq!(index.len(), 3);
        assert_eq!(index.malformed(), 0);

        let a = index.lookup("a").unwrap();
        assert_eq!(a.offset, 0);
        let text = slice(&path, a);
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().all(|l| l.contains(r#""mp3url": "a""#)));

        let c = index.lookup("c").unwrap();
        assert_eq!(c.offset + c.length, fs::metadata(&path).unwrap().len());
        assert!(index.lookup("missing").is_none());
    }

    #[test]
    fn test_malformed_lines_are_skipped_and_counted() {
        let dir = TempDir::new().unwrap();
        let path = write_turns(
            &dir,
            "turns.jsonl",
            &[row("a", 0.0), "{not json".into(), r#"{"turnText": "orphan"}"#.into(), row("b", 0.0)],
        );

        let index = TurnOffsetIndex::build_files(&[path.clone()]).unwrap();
        assert_eq!(index.malformed(), 2);
        assert_eq!(index.len(), 2);
        assert_eq!(slice(&path, index.lookup("b").unwrap()).trim(), row("b", 0.0));
    }

    #[test]
    fn test_split_records_are_fragmented() {
        let dir = TempDir::new().unwrap();
        let first = write_turns(&dir, "t1.jsonl", &[row("a", 0.0), row("b", 0.0), row("a", 5.0)]);
        let second = write_turns(&dir, "t2.jsonl", &[row("b", 9.0), row("c", 0.0)]);

        let index = TurnOffsetIndex::build_files(&[first, second]).unwrap();
        assert!(index.is_fragmented("a"));
        assert!(index.is_fragmented("b"));
        assert!(index.lookup("a").is_none());
        assert_eq!(index.lookup("c").unwrap().file_id, 1);
        assert_eq!(index.fragmented_count(), 2);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let dir = TempDir::new().unwrap();
        let path = write_turns(&dir, "t.jsonl", &[row("a", 0.0)]);
        let before = FileFingerprint::of(&path).unwrap();
        assert_eq!(before, FileFingerprint::of(&path).unwrap());

        fs::write(&path, row("z", 0.0) + "\n").unwrap();
        let after = FileFingerprint::of(&path).unwrap();
        assert_ne!(before.head_hash, after.head_hash);
    }

    #[test]
    fn test_persist_load_round_trip() {
        let dir = TempDir::new().unwrap();
        write_turns(&dir, crate::source::EPISODE_FILE, &[]);
        write_turns(
            &dir,
            crate::source::TURN_FILE,
            &[row("a", 0.0), row("b", 0.0), row("a", 3.0), row("c", 1.0)],
        );
        let source = CorpusSource::local_dir(dir.path(), false).unwrap();
        let db = TurnOffsetIndex::default_path(dir.path());

        let built = TurnOffsetIndex::build(&source).unwrap();
        built.persist(&db).unwrap();
        let loaded = TurnOffsetIndex::load(&db, &source).unwrap();

        for key in ["a", "b", "c", "zzz"] {
            assert_eq!(built.lookup(key), loaded.lookup(key), "{key}");
            assert_eq!(built.is_fragmented(key), loaded.is_fragmented(key));
        }
        assert_eq!(loaded.files(), built.files());
        assert!(loaded.is_complete());
    }

    #[test]
    fn test_changed_file_makes_index_stale() {
        let dir = TempDir::new().unwrap();
        write_turns(&dir, crate::source::EPISODE_FILE, &[]);
        let turns = write_turns(&dir, crate::source::TURN_FILE, &[row("a", 0.0)]);
        let source = CorpusSource::local_dir(dir.path(), false).unwrap();
        let db = dir.path().join("idx.db");

        TurnOffsetIndex::build(&source).unwrap().persist(&db).unwrap();
        fs::write(&turns, [row("a", 0.0), row("b", 0.0)].join("\n") + "\n").unwrap();

        assert!(matches!(
            TurnOffsetIndex::load(&db, &source),
            Err(SporcError::StaleIndex(_))
        ));

        let rebuilt = TurnOffsetIndex::load_or_build(&db, &source).unwrap();
        assert!(rebuilt.lookup("b").is_some());
        assert!(TurnOffsetIndex::load(&db, &source).is_ok());
    }

    #[test]
    fn test_missing_index_is_stale() {
        let dir = TempDir::new().unwrap();
        write_turns(&dir, crate::source::EPISODE_FILE, &[]);
        write_turns(&dir, crate::source::TURN_FILE, &[row("a", 0.0)]);
        let source = CorpusSource::local_dir(dir.path(), false).unwrap();
        assert!(matches!(
            TurnOffsetIndex::load(&dir.path().join("nope.db"), &source),
            Err(SporcError::StaleIndex(_))
        ));
    }
}
