//! Where corpus files come from and how they are traversed.
//!
//! A [`CorpusSource`] names the metadata and turn files, local or remote.
//! Traversal goes through explicit cursors: each call to
//! [`CorpusSource::open_episodes`] or [`CorpusSource::open_podcasts`] opens the
//! files again and yields records once, in file order. Cursors never share
//! position with each other.

pub mod remote;

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::corpus::models::{Episode, Podcast};
use crate::corpus::rows::EpisodeRow;
use crate::error::{Result, SporcError};

pub use remote::RemoteClient;

pub const EPISODE_FILE: &str = "episodeLevelData.jsonl";
pub const EPISODE_SAMPLE_FILE: &str = "episodeLevelDataSample.jsonl";
pub const TURN_FILE: &str = "speakerTurnData.jsonl";
pub const TURN_SAMPLE_FILE: &str = "speakerTurnDataSample.jsonl";

/// A single backing file.
#[derive(Debug, Clone)]
pub enum DataLocation {
    Local(PathBuf),
    Remote {
        client: RemoteClient,
        file_name: String,
    },
}

impl DataLocation {
    /// Human-readable location used in log lines and error messages.
    pub fn describe(&self) -> String {
        match self {
            DataLocation::Local(path) => path.display().to_string(),
            DataLocation::Remote { client, file_name } => client.url_for(file_name),
        }
    }

    /// Only local files support the seek+read pairs the offset index needs.
    pub fn is_seekable(&self) -> bool {
        matches!(self, DataLocation::Local(_))
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            DataLocation::Local(path) => Some(path),
            DataLocation::Remote { .. } => None,
        }
    }

    /// Open a fresh sequential reader positioned at the start of the file.
    pub fn open(&self) -> Result<Box<dyn BufRead + Send>> {
        match self {
            DataLocation::Local(path) => {
                let file = File::open(path).map_err(|e| {
                    SporcError::DatasetAccess(format!("Cannot open {}: {e}", path.display()))
                })?;
                Ok(Box::new(BufReader::with_capacity(256 * 1024, file)))
            }
            DataLocation::Remote { client, file_name } => Ok(Box::new(client.open(file_name)?)),
        }
    }
}

/// The set of files making up one corpus snapshot.
#[derive(Debug, Clone)]
pub struct CorpusSource {
    episode_files: Vec<DataLocation>,
    turn_files: Vec<DataLocation>,
    data_dir: Option<PathBuf>,
    known_total: Option<usize>,
}

impl CorpusSource {
    /// Discover the corpus files in a local directory.
    ///
    /// Besides the canonical file names, sharded files such as
    /// `speakerTurnData_part2.jsonl` are picked up, sorted by name.
    pub fn local_dir(dir: &Path, use_sample: bool) -> Result<Self> {
        if !dir.is_dir() {
            return Err(SporcError::DatasetAccess(format!(
                "Data directory does not exist: {}",
                dir.display()
            )));
        }

        let episode_files = discover(dir, "episodeLevelData", use_sample)?;
        let turn_files = discover(dir, "speakerTurnData", use_sample)?;

        let (episode_name, turn_name) = required_names(use_sample);
        let mut missing = Vec::new();
        if episode_files.is_empty() {
            missing.push(episode_name);
        }
        if turn_files.is_empty() {
            missing.push(turn_name);
        }
        if !missing.is_empty() {
            return Err(SporcError::DatasetAccess(format!(
                "Missing required files in {}: {}",
                dir.display(),
                missing.join(", ")
            )));
        }

        info!(
            "Found {} metadata file(s) and {} turn file(s) in {}",
            episode_files.len(),
            turn_files.len(),
            dir.display()
        );

        Ok(CorpusSource {
            episode_files: episode_files.into_iter().map(DataLocation::Local).collect(),
            turn_files: turn_files.into_iter().map(DataLocation::Local).collect(),
            data_dir: Some(dir.to_path_buf()),
            known_total: None,
        })
    }

    /// Explicit local file lists, bypassing discovery.
    pub fn from_files(episode_files: Vec<PathBuf>, turn_files: Vec<PathBuf>) -> Self {
        let data_dir = episode_files
            .first()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf);
        CorpusSource {
            episode_files: episode_files.into_iter().map(DataLocation::Local).collect(),
            turn_files: turn_files.into_iter().map(DataLocation::Local).collect(),
            data_dir,
            known_total: None,
        }
    }

    /// Corpus files served from `<base_url>/<file name>`.
    pub fn remote(client: RemoteClient, use_sample: bool) -> Self {
        let (episode_name, turn_name) = required_names(use_sample);
        CorpusSource {
            episode_files: vec![DataLocation::Remote {
                client: client.clone(),
                file_name: episode_name.to_string(),
            }],
            turn_files: vec![DataLocation::Remote {
                client,
                file_name: turn_name.to_string(),
            }],
            data_dir: None,
            known_total: None,
        }
    }

    /// Record count published alongside the snapshot, if any.
    pub fn with_known_total(mut self, total: Option<usize>) -> Self {
        self.known_total = total;
        self
    }

    pub fn known_total(&self) -> Option<usize> {
        self.known_total
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn episode_files(&self) -> &[DataLocation] {
        &self.episode_files
    }

    pub fn turn_files(&self) -> &[DataLocation] {
        &self.turn_files
    }

    /// True when every turn file can be read by offset.
    pub fn is_seekable(&self) -> bool {
        self.turn_files.iter().all(DataLocation::is_seekable)
    }

    /// Start a new pass over the episode metadata.
    pub fn open_episodes(&self) -> EpisodeCursor {
        debug!("Opening episode cursor over {} file(s)", self.episode_files.len());
        EpisodeCursor {
            pending: self.episode_files.clone().into(),
            current: None,
            line_no: 0,
            skipped: 0,
            yielded: 0,
            duplicates: 0,
            seen: HashSet::new(),
            done: false,
            buf: Vec::new(),
        }
    }

    /// Start a new pass that groups consecutive episodes into podcasts.
    pub fn open_podcasts(&self) -> PodcastCursor {
        PodcastCursor {
            episodes: self.open_episodes(),
            carry: None,
        }
    }
}

fn required_names(use_sample: bool) -> (&'static str, &'static str) {
    if use_sample {
        (EPISODE_SAMPLE_FILE, TURN_SAMPLE_FILE)
    } else {
        (EPISODE_FILE, TURN_FILE)
    }
}

fn discover(dir: &Path, stem: &str, use_sample: bool) -> Result<Vec<PathBuf>> {
    let pattern = dir.join(format!("{stem}*.jsonl"));
    let pattern = pattern.to_string_lossy();
    let entries = glob::glob(&pattern)
        .map_err(|e| SporcError::DatasetAccess(format!("Bad file pattern {pattern}: {e}")))?;

    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|path| {
            let is_sample = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains("Sample"));
            is_sample == use_sample
        })
        .collect();
    found.sort();
    Ok(found)
}

/// Single-traversal cursor over episode metadata rows.
///
/// Yields episodes in file order. Rows that cannot be decoded are skipped
/// with a warning and counted; I/O failures end the traversal with an error.
/// A repeated record key keeps its first row, as the in-memory store does.
/// Keys are remembered as 64-bit hashes.
pub struct EpisodeCursor {
    pending: std::collections::VecDeque<DataLocation>,
    current: Option<(String, Box<dyn BufRead + Send>)>,
    line_no: usize,
    skipped: usize,
    yielded: usize,
    duplicates: usize,
    seen: HashSet<u64>,
    done: bool,
    buf: Vec<u8>,
}

impl EpisodeCursor {
    /// Rows skipped as malformed so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// Rows dropped because their key was already yielded.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    fn next_row(&mut self) -> Result<Option<Arc<Episode>>> {
        loop {
            if self.current.is_none() {
                let Some(location) = self.pending.pop_front() else {
                    return Ok(None);
                };
                let reader = location.open()?;
                self.current = Some((location.describe(), reader));
                self.line_no = 0;
            }
            let Some((name, reader)) = self.current.as_mut() else {
                continue;
            };

            self.buf.clear();
            if reader.read_until(b'\n', &mut self.buf)? == 0 {
                self.current = None;
                continue;
            }
            self.line_no += 1;
            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let location = format!("{name}:{}", self.line_no);
            match EpisodeRow::parse(&self.buf, &location).and_then(|r| r.into_episode(&location)) {
                Ok(episode) if !self.seen.insert(xxh3_64(episode.mp3_url.as_bytes())) => {
                    self.duplicates += 1;
                    debug!("Duplicate episode key ignored at {location}: {}", episode.mp3_url);
                }
                Ok(episode) => {
                    self.yielded += 1;
                    return Ok(Some(Arc::new(episode)));
                }
                Err(e) => {
                    self.skipped += 1;
                    warn!("Skipping metadata row: {e}");
                }
            }
        }
    }
}

impl Iterator for EpisodeCursor {
    type Item = Result<Arc<Episode>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_row() {
            Ok(Some(episode)) => Some(Ok(episode)),
            Ok(None) => {
                self.done = true;
                if self.skipped > 0 || self.duplicates > 0 {
                    warn!(
                        "Episode pass finished: {} row(s) read, {} malformed and {} duplicate row(s) skipped",
                        self.yielded, self.skipped, self.duplicates
                    );
                }
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Single-traversal cursor over podcasts.
///
/// Consecutive episodes sharing a podcast title (case-insensitively) form one
/// podcast. A title that reappears later in the file starts a new group.
pub struct PodcastCursor {
    episodes: EpisodeCursor,
    carry: Option<Arc<Episode>>,
}

impl PodcastCursor {
    pub fn skipped(&self) -> usize {
        self.episodes.skipped()
    }
}

impl Iterator for PodcastCursor {
    type Item = Result<Podcast>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.carry.take() {
            Some(ep) => ep,
            None => match self.episodes.next()? {
                Ok(ep) => ep,
                Err(e) => return Some(Err(e)),
            },
        };

        let mut podcast = Podcast::from_episode(&first);
        let title = first.podcast_title.to_lowercase();
        podcast.episodes.push(first);

        loop {
            match self.episodes.next() {
                Some(Ok(ep)) if ep.podcast_title.to_lowercase() == title => {
                    podcast.episodes.push(ep);
                }
                Some(Ok(ep)) => {
                    self.carry = Some(ep);
                    break;
                }
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }
        Some(Ok(podcast))
    }
}
