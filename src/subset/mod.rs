//! One-pass subset extraction for Selective mode.
//!
//! Episode-level criteria are tested as the cursor produces records, and
//! `First(n)` stops reading once `n` were accepted. Podcast-level criteria
//! need a podcast's full episode list, so those passes group rows by title
//! and test each podcast once the pass ends.
//!
//! `Random(n)` keeps a reservoir of `n` (Algorithm R): one full pass, O(n)
//! memory, no record count needed up front. The sample is put back into
//! source order before it is stored.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::corpus::models::{Episode, Podcast};
use crate::corpus::store::RecordStore;
use crate::error::Result;
use crate::query::{EpisodeQuery, PodcastFilter};
use crate::source::CorpusSource;

/// Which of the accepted records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Sampling {
    First(usize),
    Random(usize),
    All,
}

impl fmt::Display for Sampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sampling::First(n) => write!(f, "first:{n}"),
            Sampling::Random(n) => write!(f, "random:{n}"),
            Sampling::All => write!(f, "all"),
        }
    }
}

impl FromStr for Sampling {
    type Err = String;

    /// `all`, `first:N` or `random:N`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "all" {
            return Ok(Sampling::All);
        }
        let (kind, n) = s
            .split_once(':')
            .ok_or_else(|| format!("expected all, first:N or random:N, got '{s}'"))?;
        let n: usize = n
            .parse()
            .map_err(|_| format!("'{n}' is not a record count"))?;
        match kind {
            "first" => Ok(Sampling::First(n)),
            "random" => Ok(Sampling::Random(n)),
            other => Err(format!("unknown sampling mode '{other}'")),
        }
    }
}

/// What a subset pass looked at and kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubsetReport {
    pub examined: usize,
    pub matched: usize,
    pub kept: usize,
    pub stopped_early: bool,
}

struct Sampler<T> {
    sampling: Sampling,
    kept: Vec<(usize, T)>,
    matched: usize,
    rng: fastrand::Rng,
}

impl<T> Sampler<T> {
    fn new(sampling: Sampling, seed: Option<u64>) -> Self {
        Sampler {
            sampling,
            kept: Vec::new(),
            matched: 0,
            rng: seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed),
        }
    }

    /// Nothing more can be kept, so the pass may stop.
    fn is_saturated(&self) -> bool {
        match self.sampling {
            Sampling::First(n) => self.kept.len() >= n,
            Sampling::Random(0) => true,
            _ => false,
        }
    }

    fn offer(&mut self, item: T) {
        let seq = self.matched;
        self.matched += 1;
        match self.sampling {
            Sampling::All => self.kept.push((seq, item)),
            Sampling::First(n) => {
                if self.kept.len() < n {
                    self.kept.push((seq, item));
                }
            }
            Sampling::Random(n) => {
                if self.kept.len() < n {
                    self.kept.push((seq, item));
                } else {
                    let j = self.rng.usize(0..=seq);
                    if j < n {
                        self.kept[j] = (seq, item);
                    }
                }
            }
        }
    }

    fn finish(mut self) -> Vec<T> {
        self.kept.sort_by_key(|(seq, _)| *seq);
        self.kept.into_iter().map(|(_, item)| item).collect()
    }
}

/// Builds a bounded [`RecordStore`] from one pass over a source.
pub struct SubsetLoader<'s> {
    source: &'s CorpusSource,
    seed: Option<u64>,
}

impl<'s> SubsetLoader<'s> {
    pub fn new(source: &'s CorpusSource) -> Self {
        SubsetLoader { source, seed: None }
    }

    /// Make `Random` sampling reproducible.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Podcast-level subset: every episode of each kept podcast.
    ///
    /// Podcasts are grouped by title across the whole pass, so the filter
    /// sees the same podcast Memory mode would build. The pass always reads
    /// to the end; `First(n)` then keeps the first `n` matches in source
    /// order.
    pub fn load_podcasts(
        &self,
        filter: &PodcastFilter,
        sampling: Sampling,
    ) -> Result<(RecordStore, SubsetReport)> {
        let mut sampler: Sampler<Podcast> = Sampler::new(sampling, self.seed);
        let mut report = SubsetReport::default();

        if sampler.is_saturated() {
            report.stopped_early = true;
        } else {
            for podcast in group_podcasts(self.source, |p| filter.matches_podcast_fields(p))? {
                report.examined += 1;
                if filter.matches(&podcast) {
                    sampler.offer(podcast);
                    if sampler.is_saturated() {
                        break;
                    }
                }
            }
        }

        report.matched = sampler.matched;
        let podcasts = sampler.finish();
        report.kept = podcasts.len();
        info!(
            "Podcast subset ({sampling}): {} examined, {} matched, {} kept",
            report.examined, report.matched, report.kept
        );
        Ok((RecordStore::from_podcasts(podcasts), report))
    }

    /// Episode-level subset. Criteria that look at the owning podcast make
    /// the pass group every episode by podcast title first; purely
    /// episode-level criteria stream and stop early under `First(n)`.
    pub fn load_episodes(
        &self,
        query: &EpisodeQuery,
        sampling: Sampling,
    ) -> Result<(RecordStore, SubsetReport)> {
        let mut sampler: Sampler<Arc<Episode>> = Sampler::new(sampling, self.seed);
        let mut report = SubsetReport::default();

        if sampler.is_saturated() {
            report.stopped_early = true;
        } else if query.is_episode_local() {
            for episode in self.source.open_episodes() {
                let episode = episode?;
                report.examined += 1;
                if query.matches_episode(&episode) {
                    sampler.offer(episode);
                    if sampler.is_saturated() {
                        report.stopped_early = true;
                        break;
                    }
                }
            }
        } else {
            'podcasts: for podcast in group_podcasts(self.source, |_| true)? {
                for episode in &podcast.episodes {
                    report.examined += 1;
                    if query.matches(&podcast, episode) {
                        sampler.offer(Arc::clone(episode));
                        if sampler.is_saturated() {
                            break 'podcasts;
                        }
                    }
                }
            }
        }

        report.matched = sampler.matched;
        let episodes = sampler.finish();
        report.kept = episodes.len();
        info!(
            "Episode subset ({sampling}): {} examined, {} matched, {} kept",
            report.examined, report.matched, report.kept
        );
        Ok((RecordStore::from_episodes(episodes), report))
    }
}

/// One pass over the episode rows, grouped into podcasts by case-insensitive
/// title wherever the rows sit in the file, in first-seen order.
///
/// `admit` sees each podcast as seeded from its first episode; the rows of a
/// rejected title are dropped as they arrive.
fn group_podcasts(source: &CorpusSource, admit: impl Fn(&Podcast) -> bool) -> Result<Vec<Podcast>> {
    let mut podcasts: Vec<Podcast> = Vec::new();
    let mut slots: HashMap<String, Option<usize>> = HashMap::new();
    let mut regrouped = 0usize;
    let mut last_title = String::new();

    for episode in source.open_episodes() {
        let episode = episode?;
        let title = episode.podcast_title.to_lowercase();
        if title != last_title && slots.contains_key(&title) {
            regrouped += 1;
        }
        let slot = *slots.entry(title.clone()).or_insert_with(|| {
            let seed = Podcast::from_episode(&episode);
            admit(&seed).then(|| {
                podcasts.push(seed);
                podcasts.len() - 1
            })
        });
        if let Some(i) = slot {
            podcasts[i].episodes.push(episode);
        }
        last_title = title;
    }

    if regrouped > 0 {
        debug!("{regrouped} non-contiguous podcast run(s) joined to earlier rows");
    }
    Ok(podcasts)
}
