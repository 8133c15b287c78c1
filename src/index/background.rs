use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use super::{scan_file, seekable_paths, FileFingerprint, IndexEntry, IndexTable, TurnFile, TurnOffsetIndex};
use crate::error::{Result, SporcError};
use crate::source::CorpusSource;

/// Lifecycle of a background index build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum BuildState {
    Building,
    Ready,
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
struct Shared {
    /// Entries recorded so far. Emptied when the finished index is published.
    table: RwLock<IndexTable>,
    finished: RwLock<Option<Arc<TurnOffsetIndex>>>,
    state: Mutex<BuildState>,
    cancel: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: BuildState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn record(&self, key: String, entry: IndexEntry) {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record(key, entry);
    }

    /// Turn the table into the finished index and mark the build `Ready`.
    fn publish(&self, files: Vec<TurnFile>, malformed: usize) -> Arc<TurnOffsetIndex> {
        let index = {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            let index = Arc::new(TurnOffsetIndex::from_parts(
                files,
                std::mem::take(&mut *table),
                true,
                malformed,
                Utc::now(),
            ));
            *self.finished.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&index));
            index
        };
        index.log_summary();
        self.set_state(BuildState::Ready);
        index
    }
}

/// Handle to an index build running on a worker thread.
///
/// The partial index stays queryable while the build runs. Entries already
/// recorded remain valid after a cancellation or failure. Clones share the
/// same build.
#[derive(Debug, Clone)]
pub struct IndexBuildHandle {
    shared: Arc<Shared>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl IndexBuildHandle {
    pub fn state(&self) -> BuildState {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == BuildState::Ready
    }

    /// The finished index, once the build reached `Ready`.
    pub fn index(&self) -> Option<Arc<TurnOffsetIndex>> {
        self.shared
            .finished
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Look a key up in whatever has been indexed so far.
    pub fn lookup_partial(&self, key: &str) -> Option<IndexEntry> {
        // Hold the table lock while checking for the finished index: the
        // worker publishes the index and empties the table under that lock.
        let table = self.shared.table.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = self
            .shared
            .finished
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return index.lookup(key);
        }
        table.entries.get(key).copied()
    }

    pub fn entries_so_far(&self) -> usize {
        let table = self.shared.table.read().unwrap_or_else(PoisonError::into_inner);
        match self
            .shared
            .finished
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(index) => index.len(),
            None => table.entries.len(),
        }
    }

    /// Ask the worker to stop at its next line boundary.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::Relaxed);
    }

    /// Block until the worker exits. Concurrent waiters queue on the join.
    pub fn wait(&self) -> Result<Arc<TurnOffsetIndex>> {
        {
            let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(handle) = worker.take() {
                if handle.join().is_err() {
                    self.shared
                        .set_state(BuildState::Failed("index worker panicked".into()));
                }
            }
        }

        match self.state() {
            BuildState::Ready => self
                .index()
                .ok_or_else(|| SporcError::IndexBuild("finished index missing".into())),
            BuildState::Failed(reason) => Err(SporcError::IndexBuild(reason)),
            BuildState::Cancelled => Err(SporcError::IndexBuild("index build was cancelled".into())),
            BuildState::Building => Err(SporcError::IndexBuild("index worker exited early".into())),
        }
    }
}

/// Start building the index for `source` on a worker thread.
///
/// Fails immediately with `IndexUnavailable` for non-seekable sources. When
/// `persist_to` is set, a finished index is saved there.
pub fn build_async(source: &CorpusSource, persist_to: Option<PathBuf>) -> Result<IndexBuildHandle> {
    let paths = seekable_paths(source)?;
    let shared = Arc::new(Shared {
        table: RwLock::new(IndexTable::default()),
        finished: RwLock::new(None),
        state: Mutex::new(BuildState::Building),
        cancel: AtomicBool::new(false),
    });

    let worker_shared = Arc::clone(&shared);
    let worker = thread::Builder::new()
        .name("sporc-index".into())
        .spawn(move || run(&worker_shared, &paths, persist_to))?;

    info!("Started background turn index build");
    Ok(IndexBuildHandle {
        shared,
        worker: Arc::new(Mutex::new(Some(worker))),
    })
}

fn run(shared: &Shared, paths: &[PathBuf], persist_to: Option<PathBuf>) {
    let mut files = Vec::with_capacity(paths.len());
    let mut malformed = 0;

    for (id, path) in paths.iter().enumerate() {
        let fingerprint = match FileFingerprint::of(path) {
            Ok(fp) => fp,
            Err(e) => {
                warn!("Background index build failed: {e}");
                shared.set_state(BuildState::Failed(e.to_string()));
                return;
            }
        };

        let outcome = scan_file(id, path, &shared.cancel, &mut |key, entry| shared.record(key, entry));
        match outcome {
            Ok(o) if o.cancelled => {
                info!("Background index build cancelled");
                shared.set_state(BuildState::Cancelled);
                return;
            }
            Ok(o) => malformed += o.malformed,
            Err(e) => {
                warn!("Background index build failed: {e}");
                shared.set_state(BuildState::Failed(e.to_string()));
                return;
            }
        }
        files.push(TurnFile {
            id,
            path: path.clone(),
            fingerprint,
        });
    }

    let index = shared.publish(files, malformed);
    if let Some(path) = persist_to {
        if let Err(e) = index.persist(&path) {
            warn!("Could not save turn index to {}: {e}", path.display());
        }
    }
}

/// Builds driven chunk by chunk from the caller instead of a worker.
#[cfg(test)]
impl IndexBuildHandle {
    pub(crate) fn detached() -> Self {
        IndexBuildHandle {
            shared: Arc::new(Shared {
                table: RwLock::new(IndexTable::default()),
                finished: RwLock::new(None),
                state: Mutex::new(BuildState::Building),
                cancel: AtomicBool::new(false),
            }),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn feed(&self, key: &str, entry: IndexEntry) {
        self.shared.record(key.to_string(), entry);
    }

    pub(crate) fn finish(&self, files: Vec<TurnFile>) {
        self.shared.publish(files, 0);
    }
}
