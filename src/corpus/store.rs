use std::collections::HashMap;
use std::sync::Arc;

use crate::corpus::models::{Episode, Podcast};
use crate::query::EpisodeQuery;

/// Materialized catalog of podcasts and episodes.
///
/// Read-only once built. Podcasts are keyed by lower-cased title (titles are
/// unique per store, case-insensitively) and episodes by record key; both
/// keep source order for iteration.
#[derive(Debug, Default)]
pub struct RecordStore {
    podcasts: Vec<Arc<Podcast>>,
    episodes: Vec<Arc<Episode>>,
    by_title: HashMap<String, usize>,
    by_key: HashMap<String, usize>,
}

impl RecordStore {
    /// Group episodes into podcasts by title, in first-seen order.
    pub fn from_episodes(episodes: impl IntoIterator<Item = Arc<Episode>>) -> Self {
        let mut podcasts: Vec<Podcast> = Vec::new();
        let mut by_title: HashMap<String, usize> = HashMap::new();
        let mut all = Vec::new();
        let mut by_key = HashMap::new();

        for episode in episodes {
            if by_key.contains_key(&episode.mp3_url) {
                tracing::debug!("Duplicate episode key ignored: {}", episode.mp3_url);
                continue;
            }
            let title_key = episode.podcast_title.to_lowercase();
            let slot = *by_title.entry(title_key).or_insert_with(|| {
                podcasts.push(Podcast::from_episode(&episode));
                podcasts.len() - 1
            });
            podcasts[slot].episodes.push(Arc::clone(&episode));
            by_key.insert(episode.mp3_url.clone(), all.len());
            all.push(episode);
        }

        RecordStore {
            podcasts: podcasts.into_iter().map(Arc::new).collect(),
            episodes: all,
            by_title,
            by_key,
        }
    }

    /// Build from already-grouped podcasts. Podcasts whose titles collide
    /// case-insensitively are merged.
    pub fn from_podcasts(podcasts: impl IntoIterator<Item = Podcast>) -> Self {
        Self::from_episodes(podcasts.into_iter().flat_map(|p| p.episodes))
    }

    pub fn podcast_count(&self) -> usize {
        self.podcasts.len()
    }

    pub fn episode_count(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    pub fn podcasts(&self) -> &[Arc<Podcast>] {
        &self.podcasts
    }

    pub fn episodes(&self) -> &[Arc<Episode>] {
        &self.episodes
    }

    pub fn episode(&self, key: &str) -> Option<&Arc<Episode>> {
        self.by_key.get(key).map(|&i| &self.episodes[i])
    }

    /// Exact title, then case-insensitive, then substring match.
    pub fn find_podcast(&self, name: &str) -> Option<&Arc<Podcast>> {
        if let Some(p) = self.podcasts.iter().find(|p| p.title == name) {
            return Some(p);
        }
        let lowered = name.to_lowercase();
        if let Some(&i) = self.by_title.get(&lowered) {
            return Some(&self.podcasts[i]);
        }
        self.podcasts
            .iter()
            .find(|p| p.title.to_lowercase().contains(&lowered))
    }

    pub fn search(&self, query: &EpisodeQuery) -> Vec<Arc<Episode>> {
        let mut out = Vec::new();
        for podcast in &self.podcasts {
            for episode in &podcast.episodes {
                if query.matches(podcast, episode) {
                    out.push(Arc::clone(episode));
                }
            }
        }
        out
    }
}
