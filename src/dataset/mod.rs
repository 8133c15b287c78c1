//! Mode controller over a corpus snapshot.
//!
//! A [`Dataset`] starts in `Memory` (everything materialized) or `Streaming`
//! (records pulled from the source per traversal). A streaming dataset can
//! be narrowed once into `Selective` mode by loading a subset; from then on
//! it behaves like `Memory` over that subset only.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::corpus::models::{Episode, Podcast, Turn, TurnState};
use crate::corpus::store::RecordStore;
use crate::error::{LookupScope, Result, SporcError};
use crate::index::{BuildState, TurnOffsetIndex};
use crate::loader::{LazyTurnLoader, LoadSummary};
use crate::query::{EpisodeQuery, PodcastFilter};
use crate::search::{self, EpisodeHit, TextIndex, TextIndexSummary, TextMatch, TurnHit, TurnQuery};
use crate::source::{CorpusSource, EpisodeCursor, PodcastCursor};
use crate::subset::{Sampling, SubsetLoader, SubsetReport};
use crate::window::{by_count, by_duration, CountWindows, TimeWindows};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Memory,
    Streaming,
    Selective,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Memory => "memory",
            Mode::Streaming => "streaming",
            Mode::Selective => "selective",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When the turn offset index gets built for a seekable source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexPolicy {
    /// Load a persisted index at open; otherwise build on first turn access.
    #[default]
    Lazy,
    /// Load or build before `open` returns.
    Eager,
    /// Load a persisted index at open; otherwise build on a worker thread.
    Background,
}

#[derive(Debug, Clone, Default)]
pub struct DatasetOptions {
    pub streaming: bool,
    /// Memory mode only: attach every episode's turns during `open`.
    pub load_turns_eagerly: bool,
    pub index_policy: IndexPolicy,
    /// Sidecar location; defaults to `<data_dir>/.sporc/turn_index.db`.
    pub index_path: Option<PathBuf>,
    /// Seed for `Sampling::Random`.
    pub seed: Option<u64>,
}

/// Snapshot of the turn index as seen by the dataset.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub index_built: bool,
    pub episodes_indexed: usize,
    pub fragmented: usize,
    pub malformed: usize,
    pub turn_files: usize,
    /// The source is local and can be read by offset.
    pub local_mode: bool,
    pub build_state: Option<BuildState>,
    /// Records loaded from a partial index that later proved fragmented.
    pub incomplete_loads: usize,
    pub index_path: Option<PathBuf>,
}

enum Scope {
    Memory(RecordStore),
    Streaming,
    Selective(RecordStore),
}

pub struct Dataset {
    source: CorpusSource,
    loader: LazyTurnLoader,
    scope: Scope,
    index_policy: IndexPolicy,
    index_path: Option<PathBuf>,
    seed: Option<u64>,
}

impl Dataset {
    /// Open a local data directory.
    pub fn open_dir(dir: &Path, use_sample: bool, options: DatasetOptions) -> Result<Self> {
        Self::open(CorpusSource::local_dir(dir, use_sample)?, options)
    }

    pub fn open(source: CorpusSource, options: DatasetOptions) -> Result<Self> {
        let index_path = options.index_path.clone().or_else(|| {
            source
                .is_seekable()
                .then(|| source.data_dir().map(TurnOffsetIndex::default_path))
                .flatten()
        });

        let scope = if options.streaming {
            info!("Opened corpus in streaming mode");
            Scope::Streaming
        } else {
            let mut cursor = source.open_episodes();
            let mut episodes = Vec::new();
            for episode in cursor.by_ref() {
                episodes.push(episode?);
            }
            let store = RecordStore::from_episodes(episodes);
            info!(
                "Loaded {} episodes from {} podcasts into memory ({} malformed rows skipped)",
                store.episode_count(),
                store.podcast_count(),
                cursor.skipped()
            );
            Scope::Memory(store)
        };

        let dataset = Dataset {
            loader: LazyTurnLoader::new(source.clone()),
            source,
            scope,
            index_policy: options.index_policy,
            index_path,
            seed: options.seed,
        };
        dataset.attach_index()?;

        if options.load_turns_eagerly {
            match &dataset.scope {
                Scope::Memory(store) => {
                    dataset.loader.load_many(store.episodes())?;
                }
                _ => debug!("load_turns_eagerly ignored outside memory mode"),
            }
        }
        Ok(dataset)
    }

    fn attach_index(&self) -> Result<()> {
        if !self.source.is_seekable() {
            debug!("Turn source is not seekable; turns load by full scan");
            return Ok(());
        }

        let persisted = match &self.index_path {
            Some(path) if path.exists() => match TurnOffsetIndex::load(path, &self.source) {
                Ok(index) => Some(index),
                Err(SporcError::StaleIndex(reason)) => {
                    info!("Ignoring persisted turn index: {reason}");
                    None
                }
                Err(e) => return Err(e),
            },
            _ => None,
        };
        if let Some(index) = persisted {
            self.loader.set_index(Arc::new(index));
            return Ok(());
        }

        match self.index_policy {
            IndexPolicy::Lazy => {}
            IndexPolicy::Eager => {
                self.build_index(true)?;
            }
            IndexPolicy::Background => {
                self.build_index_async()?;
            }
        }
        Ok(())
    }

    /// Build the offset index now and persist it. Without `force`, an index
    /// that is already attached is returned as is.
    pub fn build_index(&self, force: bool) -> Result<Arc<TurnOffsetIndex>> {
        if !force {
            if let Some(index) = self.loader.index() {
                return Ok(index);
            }
        }
        let index = Arc::new(TurnOffsetIndex::build(&self.source)?);
        if let Some(path) = &self.index_path {
            index.persist(path)?;
        }
        self.loader.set_index(Arc::clone(&index));
        Ok(index)
    }

    /// Start building the index on a worker thread. Turn loads keep working
    /// meanwhile, using partial entries or full scans.
    pub fn build_index_async(&self) -> Result<()> {
        let handle = TurnOffsetIndex::build_async(&self.source, self.index_path.clone())?;
        self.loader.set_building(handle);
        Ok(())
    }

    /// Wait for a background build started by [`Self::build_index_async`].
    pub fn wait_for_index(&self) -> Result<Option<Arc<TurnOffsetIndex>>> {
        self.loader.wait_for_index()
    }

    fn ensure_index(&self) -> Result<()> {
        if self.index_policy == IndexPolicy::Lazy
            && self.source.is_seekable()
            && self.loader.build_state().is_none()
        {
            info!("Building turn index on first use");
            self.build_index(false)?;
        }
        Ok(())
    }

    pub fn index_status(&self) -> IndexStatus {
        let index = self.loader.index();
        IndexStatus {
            index_built: index.is_some(),
            episodes_indexed: self.loader.indexed_records(),
            fragmented: index.as_ref().map_or(0, |i| i.fragmented_count()),
            malformed: index.as_ref().map_or(0, |i| i.malformed()),
            turn_files: self.source.turn_files().len(),
            local_mode: self.source.is_seekable(),
            build_state: self.loader.build_state(),
            incomplete_loads: self.loader.incomplete_loads().len(),
            index_path: self.index_path.clone(),
        }
    }

    pub fn mode(&self) -> Mode {
        match self.scope {
            Scope::Memory(_) => Mode::Memory,
            Scope::Streaming => Mode::Streaming,
            Scope::Selective(_) => Mode::Selective,
        }
    }

    pub fn source(&self) -> &CorpusSource {
        &self.source
    }

    fn scope_of_lookup(&self) -> LookupScope {
        match self.scope {
            Scope::Selective(_) => LookupScope::LoadedSubset,
            _ => LookupScope::Corpus,
        }
    }

    /// The materialized store; not available while streaming.
    pub fn store(&self) -> Result<&RecordStore> {
        match &self.scope {
            Scope::Memory(store) | Scope::Selective(store) => Ok(store),
            Scope::Streaming => Err(self.mismatch("store")),
        }
    }

    fn mismatch(&self, operation: &'static str) -> SporcError {
        SporcError::ModeMismatch {
            operation,
            mode: self.mode().as_str(),
        }
    }

    /// Number of episodes. Streaming datasets only know it when the source
    /// publishes a total.
    pub fn len(&self) -> Result<usize> {
        match &self.scope {
            Scope::Memory(store) | Scope::Selective(store) => Ok(store.episode_count()),
            Scope::Streaming => self.source.known_total().ok_or(SporcError::SizeUnknown),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn podcast_count(&self) -> Result<usize> {
        match &self.scope {
            Scope::Memory(store) | Scope::Selective(store) => Ok(store.podcast_count()),
            Scope::Streaming => Err(SporcError::SizeUnknown),
        }
    }

    /// All episodes. A full pass over the source when streaming.
    pub fn all_episodes(&self) -> Result<Vec<Arc<Episode>>> {
        match &self.scope {
            Scope::Memory(store) | Scope::Selective(store) => Ok(store.episodes().to_vec()),
            Scope::Streaming => self.source.open_episodes().collect(),
        }
    }

    /// All podcasts. A full pass over the source when streaming.
    pub fn all_podcasts(&self) -> Result<Vec<Arc<Podcast>>> {
        match &self.scope {
            Scope::Memory(store) | Scope::Selective(store) => Ok(store.podcasts().to_vec()),
            Scope::Streaming => {
                let podcasts = self.source.open_podcasts().collect::<Result<Vec<_>>>()?;
                Ok(RecordStore::from_podcasts(podcasts).podcasts().to_vec())
            }
        }
    }

    /// Episodes matching every populated criterion, in source order.
    pub fn search(&self, query: &EpisodeQuery) -> Result<Vec<Arc<Episode>>> {
        match &self.scope {
            Scope::Memory(store) | Scope::Selective(store) => Ok(store.search(query)),
            Scope::Streaming => {
                debug!("Streaming search: full pass over the source");
                let mut out = Vec::new();
                if query.is_episode_local() {
                    for episode in self.source.open_episodes() {
                        let episode = episode?;
                        if query.matches_episode(&episode) {
                            out.push(episode);
                        }
                    }
                } else {
                    for podcast in self.all_podcasts()? {
                        for episode in &podcast.episodes {
                            if query.matches(&podcast, episode) {
                                out.push(Arc::clone(episode));
                            }
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    /// Podcast by name: exact title, then case-insensitive, then substring.
    pub fn search_podcast(&self, name: &str) -> Result<Arc<Podcast>> {
        let found = match &self.scope {
            Scope::Memory(store) | Scope::Selective(store) => store.find_podcast(name).cloned(),
            Scope::Streaming => {
                let store = RecordStore::from_podcasts(
                    self.source
                        .open_podcasts()
                        .filter(|p| {
                            p.as_ref().map_or(true, |p| {
                                p.title.to_lowercase().contains(&name.to_lowercase())
                            })
                        })
                        .collect::<Result<Vec<_>>>()?,
                );
                store.find_podcast(name).cloned()
            }
        };
        found.ok_or_else(|| SporcError::not_found(format!("podcast '{name}'"), self.scope_of_lookup()))
    }

    /// Episode by record key.
    pub fn episode(&self, key: &str) -> Result<Arc<Episode>> {
        let found = match &self.scope {
            Scope::Memory(store) | Scope::Selective(store) => store.episode(key).cloned(),
            Scope::Streaming => {
                let mut hit = None;
                for episode in self.source.open_episodes() {
                    let episode = episode?;
                    if episode.mp3_url == key {
                        hit = Some(episode);
                        break;
                    }
                }
                hit
            }
        };
        found.ok_or_else(|| SporcError::not_found(format!("episode '{key}'"), self.scope_of_lookup()))
    }

    /// A fresh single-traversal cursor over episodes. Streaming mode only.
    pub fn iterate_episodes(&self) -> Result<EpisodeCursor> {
        match self.scope {
            Scope::Streaming => Ok(self.source.open_episodes()),
            _ => Err(self.mismatch("iterate_episodes")),
        }
    }

    /// A fresh single-traversal cursor over podcasts. Streaming mode only.
    pub fn iterate_podcasts(&self) -> Result<PodcastCursor> {
        match self.scope {
            Scope::Streaming => Ok(self.source.open_podcasts()),
            _ => Err(self.mismatch("iterate_podcasts")),
        }
    }

    fn check_subset_allowed(&self, operation: &'static str) -> Result<()> {
        match self.scope {
            Scope::Streaming => Ok(()),
            Scope::Selective(_) => Err(SporcError::SubsetAlreadyLoaded),
            Scope::Memory(_) => Err(self.mismatch(operation)),
        }
    }

    /// Narrow a streaming dataset to the podcasts matching `filter`.
    /// One-way: the dataset stays in selective mode afterwards.
    pub fn load_podcast_subset(&mut self, filter: &PodcastFilter, sampling: Sampling) -> Result<SubsetReport> {
        self.check_subset_allowed("load_podcast_subset")?;
        let (store, report) = SubsetLoader::new(&self.source)
            .with_seed(self.seed)
            .load_podcasts(filter, sampling)?;
        self.enter_selective(store);
        Ok(report)
    }

    /// Narrow a streaming dataset to the episodes matching `query`.
    pub fn load_episode_subset(&mut self, query: &EpisodeQuery, sampling: Sampling) -> Result<SubsetReport> {
        self.check_subset_allowed("load_episode_subset")?;
        let (store, report) = SubsetLoader::new(&self.source)
            .with_seed(self.seed)
            .load_episodes(query, sampling)?;
        self.enter_selective(store);
        Ok(report)
    }

    fn enter_selective(&mut self, store: RecordStore) {
        if store.is_empty() {
            warn!("Subset is empty; the dataset now holds no records");
        }
        info!(
            "Selective mode: {} podcasts, {} episodes",
            store.podcast_count(),
            store.episode_count()
        );
        self.scope = Scope::Selective(store);
    }

    pub fn turn_state<'a>(&self, episode: &'a Episode) -> TurnState<'a> {
        self.loader.state(episode)
    }

    /// Load one episode's turns (no-op if already loaded).
    pub fn load_turns_for<'a>(&self, episode: &'a Episode) -> Result<&'a [Turn]> {
        if episode.turns_loaded() {
            return episode.turns();
        }
        self.ensure_index()?;
        self.loader.load_one(episode)
    }

    /// Batched turn loading.
    pub fn load_turns_for_many(&self, episodes: &[Arc<Episode>]) -> Result<LoadSummary> {
        self.ensure_index()?;
        self.loader.load_many(episodes)
    }

    /// Count windows over the episode's turns, loading them if needed.
    pub fn sliding_window<'a>(
        &self,
        episode: &'a Episode,
        window_size: usize,
        overlap: usize,
    ) -> Result<CountWindows<'a>> {
        if overlap >= window_size {
            // Reject before paying for a turn load.
            return by_count(&[], window_size, overlap, None, None);
        }
        let turns = self.load_turns_for(episode)?;
        by_count(turns, window_size, overlap, None, None)
    }

    /// Time windows over the episode's turns, up to the episode's duration.
    pub fn sliding_window_by_time<'a>(
        &self,
        episode: &'a Episode,
        window_duration: f64,
        overlap_duration: f64,
    ) -> Result<TimeWindows<'a>> {
        by_duration(&[], window_duration, overlap_duration, None, None)?;
        let turns = self.load_turns_for(episode)?;
        let end = (episode.duration_seconds > 0.0).then_some(episode.duration_seconds);
        let last_end = turns.iter().map(|t| t.end_time).fold(0.0, f64::max);
        by_duration(
            turns,
            window_duration,
            overlap_duration,
            None,
            end.map(|e| e.max(last_end)),
        )
    }

    /// Where the turn text index lives for a local corpus.
    pub fn text_index_path(&self) -> Option<PathBuf> {
        self.source.data_dir().map(TextIndex::default_path)
    }

    /// Build the full-text index over every turn of the corpus, whatever
    /// subset is loaded.
    pub fn build_text_index(&self) -> Result<TextIndexSummary> {
        let path = self.text_index_path().ok_or_else(|| {
            SporcError::IndexUnavailable("turn text index (needs a local data directory)".into())
        })?;
        let titles = match &self.scope {
            Scope::Memory(store) => store_titles(store),
            _ => streamed_titles(self.source.open_episodes())?,
        };
        TextIndex::build(&self.source, &titles, &path)
    }

    /// Turns whose text matches `query`, within the current scope.
    pub fn search_turns(&self, query: &TurnQuery) -> Result<Vec<TurnHit>> {
        self.text_hits(query, true)
    }

    /// Episodes with matching turns: match count and best score per episode.
    /// Ranked by best score for `Fts` queries, by match count otherwise.
    pub fn search_episodes_by_text(&self, query: &TurnQuery) -> Result<Vec<EpisodeHit>> {
        let hits = self.text_hits(query, false)?;
        Ok(search::group_by_episode(hits, query.mode == TextMatch::Fts, query))
    }

    fn text_hits(&self, query: &TurnQuery, page: bool) -> Result<Vec<TurnHit>> {
        match query.mode {
            TextMatch::Fts => {
                let path = self.text_index_path().ok_or_else(|| {
                    SporcError::IndexUnavailable("turn text index (needs a local data directory)".into())
                })?;
                let index = TextIndex::open(&path, &self.source)?;
                let admit = match &self.scope {
                    Scope::Selective(store) => Some(store_titles(store)),
                    _ => None,
                };
                index.search(query, admit.as_ref(), page)
            }
            TextMatch::Exact | TextMatch::Regex => {
                let titles = match &self.scope {
                    Scope::Memory(store) | Scope::Selective(store) => store_titles(store),
                    Scope::Streaming => streamed_titles(self.source.open_episodes())?,
                };
                search::scan_turns(&self.source, &titles, query, page)
            }
        }
    }
}

/// Record key to podcast title.
fn store_titles(store: &RecordStore) -> HashMap<String, String> {
    store
        .episodes()
        .iter()
        .map(|e| (e.mp3_url.clone(), e.podcast_title.clone()))
        .collect()
}

fn streamed_titles(cursor: EpisodeCursor) -> Result<HashMap<String, String>> {
    let mut titles = HashMap::new();
    for episode in cursor {
        let episode = episode?;
        titles.insert(episode.mp3_url.clone(), episode.podcast_title.clone());
    }
    Ok(titles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> TempDir {
        let dir = TempDir::new().unwrap();
        let meta = [
            r#"{"podTitle": "Tech Talk", "mp3url": "t1", "epTitle": "One", "durationSeconds": 30, "category1": "Technology", "hostPredictedNames": ["Alice"]}"#,
            r#"{"podTitle": "Tech Talk", "mp3url": "t2", "epTitle": "Two", "durationSeconds": 2400, "category1": "Technology"}"#,
            r#"{"podTitle": "Cooking Hour", "mp3url": "c1", "epTitle": "Soup", "durationSeconds": 600, "category1": "Food"}"#,
        ];
        let turns = [
            r#"{"mp3url": "t1", "speaker": ["SPEAKER_00"], "turnText": "hello", "startTime": 0, "endTime": 10, "inferredSpeakerRole": "host"}"#,
            r#"{"mp3url": "t1", "speaker": ["SPEAKER_01"], "turnText": "hi", "startTime": 10, "endTime": 20}"#,
            r#"{"mp3url": "t1", "speaker": ["SPEAKER_00"], "turnText": "bye", "startTime": 20, "endTime": 30}"#,
            r#"{"mp3url": "c1", "speaker": ["SPEAKER_00"], "turnText": "stir", "startTime": 0, "endTime": 5}"#,
        ];
        fs::write(dir.path().join(crate::source::EPISODE_FILE), meta.join("\n")).unwrap();
        fs::write(dir.path().join(crate::source::TURN_FILE), turns.join("\n")).unwrap();
        dir
    }

    fn streaming() -> DatasetOptions {
        DatasetOptions {
            streaming: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_memory_mode_basics() {
        let dir = setup();
        let ds = Dataset::open_dir(dir.path(), false, DatasetOptions::default()).unwrap();
        assert_eq!(ds.mode(), Mode::Memory);
        assert_eq!(ds.len().unwrap(), 3);
        assert_eq!(ds.podcast_count().unwrap(), 2);
        assert_eq!(ds.search_podcast("tech talk").unwrap().episode_count(), 2);
        assert!(matches!(
            ds.search_podcast("gardening"),
            Err(SporcError::NotFound { scope: LookupScope::Corpus, .. })
        ));
        assert!(matches!(ds.iterate_episodes(), Err(SporcError::ModeMismatch { .. })));
    }

    #[test]
    fn test_streaming_len_is_unknown_until_subset() {
        let dir = setup();
        let mut ds = Dataset::open_dir(dir.path(), false, streaming()).unwrap();
        assert!(matches!(ds.len(), Err(SporcError::SizeUnknown)));
        assert!(matches!(ds.store(), Err(SporcError::ModeMismatch { .. })));
        assert_eq!(ds.all_episodes().unwrap().len(), 3);
        assert_eq!(ds.iterate_podcasts().unwrap().count(), 2);

        let filter = PodcastFilter {
            categories: vec!["food".into()],
            ..Default::default()
        };
        let report = ds.load_podcast_subset(&filter, Sampling::All).unwrap();
        assert_eq!(ds.mode(), Mode::Selective);
        assert_eq!(ds.len().unwrap(), report.kept);
        assert_eq!(ds.len().unwrap(), 1);
    }

    #[test]
    fn test_selective_misses_are_scoped() {
        let dir = setup();
        let mut ds = Dataset::open_dir(dir.path(), false, streaming()).unwrap();
        ds.load_episode_subset(
            &EpisodeQuery {
                min_duration: Some(1000.0),
                ..Default::default()
            },
            Sampling::All,
        )
        .unwrap();

        assert!(ds.episode("t2").is_ok());
        assert!(matches!(
            ds.episode("t1"),
            Err(SporcError::NotFound { scope: LookupScope::LoadedSubset, .. })
        ));
        assert!(matches!(
            ds.load_episode_subset(&EpisodeQuery::default(), Sampling::All),
            Err(SporcError::SubsetAlreadyLoaded)
        ));
    }

    #[test]
    fn test_subset_requires_streaming() {
        let dir = setup();
        let mut ds = Dataset::open_dir(dir.path(), false, DatasetOptions::default()).unwrap();
        assert!(matches!(
            ds.load_podcast_subset(&PodcastFilter::default(), Sampling::All),
            Err(SporcError::ModeMismatch { .. })
        ));
    }

    #[test]
    fn test_lazy_index_built_and_persisted_on_first_load() {
        let dir = setup();
        let ds = Dataset::open_dir(dir.path(), false, DatasetOptions::default()).unwrap();
        assert!(!ds.index_status().index_built);

        let ep = ds.episode("t1").unwrap();
        assert!(matches!(ep.turns(), Err(SporcError::TurnsNotLoaded(_))));
        assert_eq!(ds.load_turns_for(&ep).unwrap().len(), 3);

        let status = ds.index_status();
        assert!(status.index_built);
        assert_eq!(status.episodes_indexed, 2);
        assert!(status.local_mode);
        assert!(TurnOffsetIndex::default_path(dir.path()).exists());

        // A second dataset picks the persisted index up at open.
        let again = Dataset::open_dir(dir.path(), false, DatasetOptions::default()).unwrap();
        assert!(again.index_status().index_built);
    }

    #[test]
    fn test_eager_turns_and_windows() {
        let dir = setup();
        let ds = Dataset::open_dir(
            dir.path(),
            false,
            DatasetOptions {
                load_turns_eagerly: true,
                index_policy: IndexPolicy::Eager,
                ..Default::default()
            },
        )
        .unwrap();
        let t1 = ds.episode("t1").unwrap();
        let t2 = ds.episode("t2").unwrap();
        assert!(ds.turn_state(&t1).is_loaded());
        assert!(t2.turns().unwrap().is_empty());

        let windows: Vec<_> = ds.sliding_window(&t1, 2, 1).unwrap().collect();
        assert_eq!(windows.len(), 2);
        let timed: Vec<_> = ds.sliding_window_by_time(&t1, 20.0, 5.0).unwrap().collect();
        assert_eq!(timed.len(), 2);
        assert!(matches!(
            ds.sliding_window(&t1, 2, 2),
            Err(SporcError::InvalidWindowParameters(_))
        ));
    }

    #[test]
    fn test_background_index_then_wait() {
        let dir = setup();
        let ds = Dataset::open_dir(
            dir.path(),
            false,
            DatasetOptions {
                index_policy: IndexPolicy::Background,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(ds.index_status().build_state.is_some());

        // Loads work whether or not the worker has finished.
        let c1 = ds.episode("c1").unwrap();
        assert_eq!(ds.load_turns_for(&c1).unwrap()[0].text, "stir");

        let index = ds.wait_for_index().unwrap().unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(ds.index_status().build_state, Some(BuildState::Ready));
    }

    #[test]
    fn test_turn_search_follows_the_loaded_scope() {
        let dir = setup();
        let mut ds = Dataset::open_dir(
            dir.path(),
            false,
            DatasetOptions {
                streaming: true,
                ..Default::default()
            },
        )
        .unwrap();
        let summary = ds.build_text_index().unwrap();
        assert_eq!(summary.turns, 4);
        assert_eq!(summary.path, TextIndex::default_path(dir.path()));

        let hits = ds.search_turns(&TurnQuery::new("stir OR hello", TextMatch::Fts)).unwrap();
        assert_eq!(hits.len(), 2);
        let exact = ds.search_turns(&TurnQuery::new("HI", TextMatch::Exact)).unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].podcast_title, "Tech Talk");

        let filter = PodcastFilter {
            categories: vec!["Food".into()],
            ..Default::default()
        };
        ds.load_podcast_subset(&filter, Sampling::All).unwrap();
        let fts = ds.search_turns(&TurnQuery::new("stir OR hello", TextMatch::Fts)).unwrap();
        assert_eq!(fts.len(), 1);
        assert_eq!(fts[0].mp3url, "c1");
        // "hi" in t1 is outside the subset.
        let exact = ds.search_turns(&TurnQuery::new("i", TextMatch::Exact)).unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].text, "stir");
        let episodes = ds.search_episodes_by_text(&TurnQuery::new("stir", TextMatch::Fts)).unwrap();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].match_count, 1);
    }

    #[test]
    fn test_fts_search_needs_a_built_text_index() {
        let dir = setup();
        let ds = Dataset::open_dir(dir.path(), false, DatasetOptions::default()).unwrap();
        assert!(matches!(
            ds.search_turns(&TurnQuery::new("hello", TextMatch::Fts)),
            Err(SporcError::TextIndexMissing(_))
        ));
        let by_episode = ds
            .search_episodes_by_text(&TurnQuery::new("h", TextMatch::Exact))
            .unwrap();
        // "hello", "hi" in t1; nothing in c1.
        assert_eq!(by_episode.len(), 1);
        assert_eq!(by_episode[0].mp3url, "t1");
        assert_eq!(by_episode[0].match_count, 2);
    }
}
