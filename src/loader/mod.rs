//! On-demand attachment of turns to episodes.
//!
//! With an index entry the loader seeks to the record's byte range and parses
//! only that chunk. Records the index cannot place are served by a full pass
//! over the turn files that keeps only lines for the wanted keys. That slow
//! path is O(total turn data) and is batched so one pass serves a whole
//! `load_many` call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::corpus::models::{Episode, Turn, TurnState};
use crate::corpus::rows::{parse_turn_chunk, KeyOnly};
use crate::error::{Result, SporcError};
use crate::index::{BuildState, IndexBuildHandle, IndexEntry, TurnOffsetIndex};
use crate::source::CorpusSource;

/// What the loader knows about turn locations.
#[derive(Debug)]
pub enum IndexSlot {
    Missing,
    /// Seeks use the entries recorded so far. An entry is recorded when its
    /// run of lines ends, but a later run of the same key can still turn up
    /// and mark it fragmented. A record loaded in between keeps only the
    /// first run. Such loads are reported once the build finishes; see
    /// [`LazyTurnLoader::incomplete_loads`].
    Building(IndexBuildHandle),
    Ready(Arc<TurnOffsetIndex>),
}

/// How one record's turns will be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Range(IndexEntry),
    /// A complete index without an entry: the record has no turns.
    Empty,
    Scan,
}

/// Outcome of a batched load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub loaded: usize,
    pub already_loaded: usize,
    pub by_offset: usize,
    pub by_scan: usize,
    pub failed: usize,
}

pub struct LazyTurnLoader {
    source: CorpusSource,
    index: RwLock<IndexSlot>,
    /// One shared handle per turn file; each seek+read pair runs under its lock.
    handles: Vec<Mutex<Option<File>>>,
    /// Keys served from a partial index, checked when the build finishes.
    partial_loads: Mutex<Vec<String>>,
    /// Partial loads the finished index showed to be fragmented.
    incomplete: Mutex<Vec<String>>,
}

impl LazyTurnLoader {
    pub fn new(source: CorpusSource) -> Self {
        Self::with_slot(source, IndexSlot::Missing)
    }

    pub fn with_index(source: CorpusSource, index: Arc<TurnOffsetIndex>) -> Self {
        Self::with_slot(source, IndexSlot::Ready(index))
    }

    pub fn with_slot(source: CorpusSource, slot: IndexSlot) -> Self {
        let handles = source.turn_files().iter().map(|_| Mutex::new(None)).collect();
        LazyTurnLoader {
            source,
            index: RwLock::new(slot),
            handles,
            partial_loads: Mutex::new(Vec::new()),
            incomplete: Mutex::new(Vec::new()),
        }
    }

    pub fn source(&self) -> &CorpusSource {
        &self.source
    }

    pub fn set_index(&self, index: Arc<TurnOffsetIndex>) {
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = IndexSlot::Ready(index);
    }

    pub fn set_building(&self, handle: IndexBuildHandle) {
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = IndexSlot::Building(handle);
    }

    /// The finished index, if there is one.
    pub fn index(&self) -> Option<Arc<TurnOffsetIndex>> {
        self.promote();
        match &*self.index.read().unwrap_or_else(PoisonError::into_inner) {
            IndexSlot::Ready(index) => Some(Arc::clone(index)),
            _ => None,
        }
    }

    /// `None` when no index was ever attached.
    pub fn build_state(&self) -> Option<BuildState> {
        self.promote();
        match &*self.index.read().unwrap_or_else(PoisonError::into_inner) {
            IndexSlot::Missing => None,
            IndexSlot::Building(handle) => Some(handle.state()),
            IndexSlot::Ready(_) => Some(BuildState::Ready),
        }
    }

    /// Block until a background build settles. `None` when nothing was attached.
    ///
    /// The slot lock is released before blocking, so loads and status calls
    /// keep going while the build runs.
    pub fn wait_for_index(&self) -> Result<Option<Arc<TurnOffsetIndex>>> {
        let handle = match &*self.index.read().unwrap_or_else(PoisonError::into_inner) {
            IndexSlot::Missing => return Ok(None),
            IndexSlot::Building(handle) => handle.clone(),
            IndexSlot::Ready(index) => return Ok(Some(Arc::clone(index))),
        };
        let finished = handle.wait()?;
        self.adopt(Arc::clone(&finished));
        Ok(Some(finished))
    }

    /// Records loaded from a partial index whose key the finished index
    /// marks fragmented. Their turns hold only the first run of lines.
    pub fn incomplete_loads(&self) -> Vec<String> {
        self.promote();
        self.incomplete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entries currently usable for seeks, finished or partial.
    pub fn indexed_records(&self) -> usize {
        match &*self.index.read().unwrap_or_else(PoisonError::into_inner) {
            IndexSlot::Missing => 0,
            IndexSlot::Building(handle) => handle.entries_so_far(),
            IndexSlot::Ready(index) => index.len(),
        }
    }

    pub fn state<'a>(&self, episode: &'a Episode) -> TurnState<'a> {
        episode.turn_state()
    }

    /// Attach `episode`'s turns if needed and return them.
    ///
    /// A no-op for records that are already loaded. Decode failures surface
    /// as `MalformedRecord` and leave the record unloaded.
    pub fn load_one<'a>(&self, episode: &'a Episode) -> Result<&'a [Turn]> {
        if let TurnState::Loaded(turns) = episode.turn_state() {
            return Ok(turns);
        }

        let key = episode.key();
        let turns = match self.plan(key) {
            Plan::Range(entry) => {
                let bytes = self.read_range(entry)?;
                parse_turn_chunk(&bytes, key)?
            }
            Plan::Empty => Vec::new(),
            Plan::Scan => {
                warn!("No index entry for {key}; scanning the turn files");
                let mut found = self.scan_for(&HashSet::from([key]))?;
                let bytes = found.remove(key).unwrap_or_default();
                parse_turn_chunk(&bytes, key)?
            }
        };

        if episode.turn_slot.attach(turns) {
            debug!("Loaded turns for {key}");
        }
        episode.turns()
    }

    /// Load turns for many episodes.
    ///
    /// Indexed reads are grouped per file and issued in offset order; every
    /// record the index cannot place shares one full scan. Records whose
    /// turns fail to decode are logged, counted in `failed`, and stay
    /// unloaded. I/O errors abort the batch.
    pub fn load_many(&self, episodes: &[Arc<Episode>]) -> Result<LoadSummary> {
        let mut summary = LoadSummary::default();
        let mut by_file: BTreeMap<usize, Vec<(IndexEntry, &Episode)>> = BTreeMap::new();
        let mut to_scan: Vec<&Episode> = Vec::new();
        let mut seen = HashSet::new();

        for episode in episodes {
            let episode: &Episode = episode;
            if episode.turns_loaded() {
                summary.already_loaded += 1;
                continue;
            }
            if !seen.insert(episode.key()) {
                continue;
            }
            match self.plan(episode.key()) {
                Plan::Range(entry) => by_file.entry(entry.file_id).or_default().push((entry, episode)),
                Plan::Empty => {
                    if episode.turn_slot.attach(Vec::new()) {
                        summary.loaded += 1;
                    }
                }
                Plan::Scan => to_scan.push(episode),
            }
        }

        for (file_id, mut group) in by_file {
            group.sort_by_key(|(entry, _)| entry.offset);
            let slot = self.handle(file_id)?;
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            for (entry, episode) in group {
                let bytes = self.read_locked(&mut guard, entry)?;
                summary.by_offset += 1;
                self.attach_parsed(episode, &bytes, &mut summary);
            }
        }

        if !to_scan.is_empty() {
            warn!(
                "{} record(s) have no index entry; scanning the turn files once for all of them",
                to_scan.len()
            );
            let keys: HashSet<&str> = to_scan.iter().map(|e| e.key()).collect();
            let mut found = self.scan_for(&keys)?;
            for episode in to_scan {
                let bytes = found.remove(episode.key()).unwrap_or_default();
                summary.by_scan += 1;
                self.attach_parsed(episode, &bytes, &mut summary);
            }
        }

        info!(
            "Loaded turns for {} record(s) ({} by offset, {} by scan, {} failed)",
            summary.loaded, summary.by_offset, summary.by_scan, summary.failed
        );
        Ok(summary)
    }

    fn attach_parsed(&self, episode: &Episode, bytes: &[u8], summary: &mut LoadSummary) {
        match parse_turn_chunk(bytes, episode.key()) {
            Ok(turns) => {
                if episode.turn_slot.attach(turns) {
                    summary.loaded += 1;
                }
            }
            Err(e) => {
                warn!("Leaving {} unloaded: {e}", episode.key());
                summary.failed += 1;
            }
        }
    }

    /// Swap a finished background build in for the handle.
    fn promote(&self) {
        let finished = match &*self.index.read().unwrap_or_else(PoisonError::into_inner) {
            IndexSlot::Building(handle) => handle.index(),
            _ => None,
        };
        if let Some(index) = finished {
            self.adopt(index);
        }
    }

    /// Install a finished background index and check the partial loads
    /// made before it against it.
    fn adopt(&self, index: Arc<TurnOffsetIndex>) {
        let served = std::mem::take(&mut *self.partial_loads.lock().unwrap_or_else(PoisonError::into_inner));
        let fragmented: Vec<String> = served.into_iter().filter(|key| index.is_fragmented(key)).collect();
        for key in &fragmented {
            warn!("{key} was loaded from a partial index but is split across the turn files; its turns are incomplete");
        }
        self.incomplete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(fragmented);
        self.set_index(index);
    }

    fn plan(&self, key: &str) -> Plan {
        self.promote();
        match &*self.index.read().unwrap_or_else(PoisonError::into_inner) {
            IndexSlot::Missing => Plan::Scan,
            IndexSlot::Building(handle) => match handle.lookup_partial(key) {
                Some(entry) => {
                    debug!("Serving {key} from a partial index");
                    self.partial_loads
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(key.to_string());
                    Plan::Range(entry)
                }
                None => Plan::Scan,
            },
            IndexSlot::Ready(index) => match index.lookup(key) {
                Some(entry) => Plan::Range(entry),
                None if index.is_complete() && !index.is_fragmented(key) => Plan::Empty,
                None => Plan::Scan,
            },
        }
    }

    fn handle(&self, file_id: usize) -> Result<&Mutex<Option<File>>> {
        self.handles.get(file_id).ok_or_else(|| {
            SporcError::IndexUnavailable(format!("index refers to unknown turn file #{file_id}"))
        })
    }

    fn read_range(&self, entry: IndexEntry) -> Result<Vec<u8>> {
        let slot = self.handle(entry.file_id)?;
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_locked(&mut guard, entry)
    }

    fn read_locked(&self, handle: &mut Option<File>, entry: IndexEntry) -> Result<Vec<u8>> {
        let file = match handle.take() {
            Some(file) => file,
            None => {
                let location = &self.source.turn_files()[entry.file_id];
                let path = location.local_path().ok_or_else(|| {
                    SporcError::IndexUnavailable(format!(
                        "{} cannot be read by offset",
                        location.describe()
                    ))
                })?;
                File::open(path)?
            }
        };
        let file = handle.insert(file);

        file.seek(SeekFrom::Start(entry.offset))?;
        let mut buf = vec![0u8; entry.length as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// One sequential pass over every turn file, collecting the raw lines of
    /// the wanted keys. Lines whose key cannot be decoded are ignored.
    fn scan_for(&self, keys: &HashSet<&str>) -> Result<HashMap<String, Vec<u8>>> {
        let mut found: HashMap<String, Vec<u8>> = HashMap::new();
        let mut line = Vec::new();

        for location in self.source.turn_files() {
            debug!("Full scan of {}", location.describe());
            let mut reader = location.open()?;
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line)? == 0 {
                    break;
                }
                let Ok(key) = KeyOnly::key_of(&line) else {
                    continue;
                };
                if keys.contains(key.as_str()) {
                    let buf = found.entry(key).or_default();
                    buf.extend_from_slice(&line);
                    if !line.ends_with(b"\n") {
                        buf.push(b'\n');
                    }
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn row(key: &str, start: f64, text: &str) -> String {
        format!(
            r#"{{"mp3url": "{key}", "speaker": ["SPEAKER_00"], "turnText": "{text}", "startTime": {start}, "endTime": {}}}"#,
            start + 2.0
        )
    }

    fn setup(lines: &[String]) -> (TempDir, CorpusSource) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(crate::source::EPISODE_FILE), "").unwrap();
        fs::write(dir.path().join(crate::source::TURN_FILE), lines.join("\n") + "\n").unwrap();
        let source = CorpusSource::local_dir(dir.path(), false).unwrap();
        (dir, source)
    }

    fn episode(key: &str) -> Arc<Episode> {
        Arc::new(Episode {
            mp3_url: key.to_string(),
            ..Default::default()
        })
    }

    fn indexed(source: &CorpusSource) -> LazyTurnLoader {
        let index = TurnOffsetIndex::build(source).unwrap();
        LazyTurnLoader::with_index(source.clone(), Arc::new(index))
    }

    #[test]
    fn test_load_one_by_offset() {
        let (_dir, source) = setup(&[
            row("a", 4.0, "later"),
            row("a", 0.0, "first"),
            row("b", 0.0, "other"),
        ]);
        let loader = indexed(&source);
        let ep = episode("a");

        assert!(!loader.state(&ep).is_loaded());
        let turns = loader.load_one(&ep).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "first");
        assert_eq!(turns[1].index, 1);
        assert!(loader.state(&ep).is_loaded());
    }

    #[test]
    fn test_load_one_is_idempotent() {
        let (_dir, source) = setup(&[row("a", 0.0, "x"), row("a", 3.0, "y")]);
        let loader = indexed(&source);
        let ep = episode("a");

        let first = loader.load_one(&ep).unwrap().as_ptr();
        let again = loader.load_one(&ep).unwrap();
        assert_eq!(first, again.as_ptr());
        assert_eq!(again.len(), 2);
    }

    #[test]
    fn test_loading_leaves_other_records_alone() {
        let (_dir, source) = setup(&[row("a", 0.0, "x"), row("b", 0.0, "y")]);
        let loader = indexed(&source);
        let (a, b) = (episode("a"), episode("b"));
        loader.load_one(&a).unwrap();
        assert!(!b.turns_loaded());
    }

    #[test]
    fn test_missing_entry_on_complete_index_is_empty() {
        let (_dir, source) = setup(&[row("a", 0.0, "x")]);
        let loader = indexed(&source);
        let ghost = episode("ghost");
        assert!(loader.load_one(&ghost).unwrap().is_empty());
        assert!(ghost.turns_loaded());
    }

    #[test]
    fn test_slow_path_without_index() {
        let (_dir, source) = setup(&[row("a", 5.0, "two"), row("b", 0.0, "y"), row("a", 0.0, "one")]);
        let loader = LazyTurnLoader::new(source);
        let ep = episode("a");
        let turns = loader.load_one(&ep).unwrap();
        let texts: Vec<&str> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[test]
    fn test_fragmented_record_uses_slow_path() {
        let (_dir, source) = setup(&[row("a", 0.0, "one"), row("b", 0.0, "y"), row("a", 5.0, "two")]);
        let loader = indexed(&source);
        let ep = episode("a");
        assert_eq!(loader.load_one(&ep).unwrap().len(), 2);
    }

    #[test]
    fn test_malformed_chunk_is_a_hard_error_for_single_access() {
        let (_dir, source) = setup(&[
            r#"{"mp3url": "bad", "speaker": ["SPEAKER_00"], "turnText": "x", "startTime": 9, "endTime": 1}"#.into(),
            row("good", 0.0, "fine"),
        ]);
        let loader = indexed(&source);
        let bad = episode("bad");
        assert!(matches!(loader.load_one(&bad), Err(SporcError::MalformedRecord { .. })));
        assert!(!bad.turns_loaded());
    }

    #[test]
    fn test_load_many_mixes_offsets_and_scan() {
        let (_dir, source) = setup(&[
            row("a", 0.0, "a0"),
            row("b", 0.0, "b0"),
            row("c", 0.0, "c0"),
            row("b", 9.0, "b1"),
            r#"{"mp3url": "d", "speaker": ["S"], "turnText": "x", "startTime": 9, "endTime": 1}"#.into(),
        ]);
        let loader = indexed(&source);
        let eps = vec![episode("c"), episode("a"), episode("b"), episode("d"), episode("zzz")];
        eps[1].turn_slot.attach(Vec::new());

        let summary = loader.load_many(&eps).unwrap();
        assert_eq!(summary.already_loaded, 1);
        assert_eq!(summary.by_scan, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.loaded, 3);

        assert_eq!(eps[0].turns().unwrap()[0].text, "c0");
        assert_eq!(eps[2].turn_count().unwrap(), 2);
        assert!(!eps[3].turns_loaded());
        assert!(eps[4].turns().unwrap().is_empty());
    }

    #[test]
    fn test_loader_promotes_finished_background_build() {
        let (_dir, source) = setup(&[row("a", 0.0, "x")]);
        let handle = TurnOffsetIndex::build_async(&source, None).unwrap();
        handle.wait().unwrap();
        let loader = LazyTurnLoader::with_slot(source, IndexSlot::Building(handle));

        assert_eq!(loader.build_state(), Some(BuildState::Ready));
        assert!(loader.index().is_some());
        assert_eq!(loader.load_one(&episode("a")).unwrap().len(), 1);
    }

    #[test]
    fn test_wait_for_index_does_not_block_status_calls() {
        let (_dir, source) = setup(&[row("a", 0.0, "x"), row("b", 0.0, "y")]);
        let handle = TurnOffsetIndex::build_async(&source, None).unwrap();
        let loader = Arc::new(LazyTurnLoader::with_slot(source, IndexSlot::Building(handle)));

        let waiter = {
            let loader = Arc::clone(&loader);
            std::thread::spawn(move || loader.wait_for_index().map(|index| index.map(|i| i.len())))
        };
        // Both take the slot lock while the waiter may be blocked on the join.
        let _ = loader.build_state();
        let _ = loader.indexed_records();
        assert_eq!(waiter.join().unwrap().unwrap(), Some(2));
        assert_eq!(loader.build_state(), Some(BuildState::Ready));
        assert!(loader.wait_for_index().unwrap().is_some());
    }

    #[test]
    fn test_partial_load_of_later_fragmented_key_is_reported() {
        let (_dir, source) = setup(&[row("a", 0.0, "one"), row("b", 0.0, "y"), row("a", 5.0, "two")]);
        let path = source.turn_files()[0].local_path().unwrap().to_path_buf();
        let mut chunks = Vec::new();
        let never = std::sync::atomic::AtomicBool::new(false);
        crate::index::scan_file(0, &path, &never, &mut |key, entry| chunks.push((key, entry))).unwrap();
        assert_eq!(chunks.len(), 3);

        let handle = IndexBuildHandle::detached();
        let loader = LazyTurnLoader::with_slot(source.clone(), IndexSlot::Building(handle.clone()));
        handle.feed(&chunks[0].0, chunks[0].1);

        let a = episode("a");
        assert_eq!(loader.load_one(&a).unwrap().len(), 1);
        assert!(loader.incomplete_loads().is_empty());

        for (key, entry) in &chunks[1..] {
            handle.feed(key, *entry);
        }
        handle.finish(TurnOffsetIndex::build(&source).unwrap().files().to_vec());

        assert_eq!(loader.incomplete_loads(), vec!["a".to_string()]);
        assert!(loader.index().unwrap().is_fragmented("a"));
        // A fresh record takes the slow path and sees both runs.
        assert_eq!(loader.load_one(&episode("a")).unwrap().len(), 2);
    }
}
