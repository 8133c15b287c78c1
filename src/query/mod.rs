//! Composable filter predicates.
//!
//! Each criterion is an independent optional field; a record matches when
//! every populated field matches. Name and category criteria are
//! case-insensitive substring matches, and list-valued criteria match when
//! any listed value matches.

use serde::Serialize;

use crate::corpus::models::{Episode, Podcast};

/// Episode-level search criteria.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EpisodeQuery {
    pub min_duration: Option<f64>,
    pub max_duration: Option<f64>,
    pub min_speakers: Option<usize>,
    pub max_speakers: Option<usize>,
    pub host_names: Vec<String>,
    pub guest_names: Vec<String>,
    pub categories: Vec<String>,
    /// Matched against every category slot but the primary one.
    pub subcategories: Vec<String>,
    pub languages: Vec<String>,
    pub podcast_name: Option<String>,
    pub explicit: Option<bool>,
    /// Bounds on the owning podcast's total duration, in hours.
    pub min_total_duration_hours: Option<f64>,
    pub max_total_duration_hours: Option<f64>,
    pub min_overlap_prop_duration: Option<f64>,
    pub max_overlap_prop_duration: Option<f64>,
    pub min_overlap_prop_turn_count: Option<f64>,
    pub max_overlap_prop_turn_count: Option<f64>,
}

impl EpisodeQuery {
    /// True if the criteria only look at the episode itself, so a streaming
    /// search does not need to group episodes into podcasts first.
    pub fn is_episode_local(&self) -> bool {
        self.podcast_name.is_none()
            && self.min_total_duration_hours.is_none()
            && self.max_total_duration_hours.is_none()
    }

    pub fn matches(&self, podcast: &Podcast, episode: &Episode) -> bool {
        self.matches_episode(episode) && self.matches_podcast_context(podcast)
    }

    pub fn matches_episode(&self, ep: &Episode) -> bool {
        in_range(ep.duration_seconds, self.min_duration, self.max_duration)
            && in_range(ep.num_main_speakers(), self.min_speakers, self.max_speakers)
            && any_name(&self.host_names, &ep.host_names)
            && any_name(&self.guest_names, &ep.guest_names)
            && any_name(&self.categories, &ep.categories)
            && any_name(&self.subcategories, ep.categories.get(1..).unwrap_or_default())
            && (self.languages.is_empty()
                || self.languages.iter().any(|l| l.eq_ignore_ascii_case(&ep.language)))
            && self.explicit.is_none_or(|x| x == ep.explicit)
            && in_range(
                ep.overlap_prop_duration,
                self.min_overlap_prop_duration,
                self.max_overlap_prop_duration,
            )
            && in_range(
                ep.overlap_prop_turn_count,
                self.min_overlap_prop_turn_count,
                self.max_overlap_prop_turn_count,
            )
    }

    fn matches_podcast_context(&self, podcast: &Podcast) -> bool {
        self.podcast_name
            .as_ref()
            .is_none_or(|name| contains_ci(&podcast.title, name))
            && in_range(
                podcast.total_duration_hours(),
                self.min_total_duration_hours,
                self.max_total_duration_hours,
            )
    }
}

/// Podcast-level subset predicate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PodcastFilter {
    pub categories: Vec<String>,
    pub hosts: Vec<String>,
    pub min_episodes: Option<usize>,
    pub max_episodes: Option<usize>,
    pub min_total_duration_hours: Option<f64>,
    pub max_total_duration_hours: Option<f64>,
    pub language: Option<String>,
    pub explicit: Option<bool>,
}

impl PodcastFilter {
    pub fn matches(&self, podcast: &Podcast) -> bool {
        (self.categories.is_empty()
            || podcast
                .categories()
                .iter()
                .any(|c| self.categories.iter().any(|want| contains_ci(c, want))))
            && (self.hosts.is_empty()
                || podcast
                    .host_names()
                    .iter()
                    .any(|h| self.hosts.iter().any(|want| contains_ci(h, want))))
            && in_range(podcast.episode_count(), self.min_episodes, self.max_episodes)
            && in_range(
                podcast.total_duration_hours(),
                self.min_total_duration_hours,
                self.max_total_duration_hours,
            )
            && self.matches_podcast_fields(podcast)
    }

    /// The criteria fixed by a podcast's first episode. They can reject a
    /// title before the rest of its episodes are read.
    pub fn matches_podcast_fields(&self, podcast: &Podcast) -> bool {
        self.language
            .as_ref()
            .is_none_or(|l| l.eq_ignore_ascii_case(&podcast.language))
            && self.explicit.is_none_or(|x| x == podcast.explicit)
    }
}

fn in_range<T: PartialOrd + Copy>(value: T, min: Option<T>, max: Option<T>) -> bool {
    min.is_none_or(|m| value >= m) && max.is_none_or(|m| value <= m)
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn any_name(wanted: &[String], have: &[String]) -> bool {
    wanted.is_empty() || have.iter().any(|h| wanted.iter().any(|w| contains_ci(h, w)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn episode() -> Episode {
        Episode {
            title: "Pilot".into(),
            mp3_url: "https://example.com/pilot.mp3".into(),
            duration_seconds: 2400.0,
            categories: vec!["Science".into(), "Astronomy".into()],
            host_names: vec!["Simon Shapiro".into()],
            guest_names: vec!["Jane Doe".into()],
            main_speakers: vec!["SPEAKER_00".into(), "SPEAKER_01".into()],
            language: "en".into(),
            overlap_prop_duration: 0.05,
            ..Default::default()
        }
    }

    fn podcast_of(ep: Episode) -> Podcast {
        let mut p = Podcast::from_episode(&ep);
        p.title = "Star Talk".into();
        p.episodes.push(Arc::new(ep));
        p
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let ep = episode();
        let p = podcast_of(episode());
        assert!(EpisodeQuery::default().matches(&p, &ep));
        assert!(PodcastFilter::default().matches(&p));
    }

    #[test]
    fn test_episode_criteria_are_conjunctive() {
        let ep = episode();
        let p = podcast_of(episode());

        let q = EpisodeQuery {
            min_duration: Some(1800.0),
            host_names: vec!["shapiro".into()],
            categories: vec!["science".into()],
            ..Default::default()
        };
        assert!(q.matches(&p, &ep));

        let q = EpisodeQuery {
            min_duration: Some(1800.0),
            max_speakers: Some(1),
            ..Default::default()
        };
        assert!(!q.matches(&p, &ep));
    }

    #[test]
    fn test_subcategory_skips_primary_slot() {
        let ep = episode();
        let p = podcast_of(episode());
        let astro = EpisodeQuery {
            subcategories: vec!["astro".into()],
            ..Default::default()
        };
        let sci = EpisodeQuery {
            subcategories: vec!["science".into()],
            ..Default::default()
        };
        assert!(astro.matches(&p, &ep));
        assert!(!sci.matches(&p, &ep));
    }

    #[test]
    fn test_podcast_context_criteria() {
        let ep = episode();
        let p = podcast_of(episode());
        let q = EpisodeQuery {
            podcast_name: Some("star".into()),
            min_total_duration_hours: Some(0.5),
            ..Default::default()
        };
        assert!(!q.is_episode_local());
        assert!(q.matches(&p, &ep));

        let q = EpisodeQuery {
            max_total_duration_hours: Some(0.1),
            ..Default::default()
        };
        assert!(!q.matches(&p, &ep));
    }

    #[test]
    fn test_podcast_filter() {
        let p = podcast_of(episode());
        let f = PodcastFilter {
            categories: vec!["education".into(), "astronomy".into()],
            min_episodes: Some(1),
            language: Some("EN".into()),
            ..Default::default()
        };
        assert!(f.matches(&p));

        let f = PodcastFilter {
            hosts: vec!["John Doe".into()],
            ..Default::default()
        };
        assert!(!f.matches(&p));

        let f = PodcastFilter {
            min_episodes: Some(10),
            ..Default::default()
        };
        assert!(!f.matches(&p));
    }
}
