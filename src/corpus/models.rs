use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, SporcError};

/// One speaker turn inside an episode. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    /// Position in the episode's start-time ordered turn sequence.
    pub index: usize,
    pub speakers: Vec<String>,
    pub text: String,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub turn_count: i64,
    pub inferred_role: Option<String>,
    pub inferred_name: Option<String>,
}

impl Turn {
    /// Build a turn, rejecting negative offsets, `end < start` and an empty
    /// speaker list. The sequence index is assigned by the loader.
    pub fn new(
        speakers: Vec<String>,
        text: String,
        start_time: f64,
        end_time: f64,
    ) -> std::result::Result<Self, String> {
        if speakers.is_empty() {
            return Err("turn has no speaker label".into());
        }
        if start_time.is_nan() || start_time < 0.0 {
            return Err(format!("negative or invalid start time {start_time}"));
        }
        if end_time.is_nan() || end_time < start_time {
            return Err(format!("end time {end_time} precedes start time {start_time}"));
        }
        Ok(Turn {
            index: 0,
            speakers,
            text,
            start_time,
            end_time,
            duration: end_time - start_time,
            turn_count: 0,
            inferred_role: None,
            inferred_name: None,
        })
    }

    pub fn primary_speaker(&self) -> &str {
        self.speakers.first().map(String::as_str).unwrap_or("")
    }

    /// More than one diarization label means overlapping speech.
    pub fn is_overlapping(&self) -> bool {
        self.speakers.len() > 1
    }

    pub fn is_host(&self) -> bool {
        self.inferred_role.as_deref() == Some("host")
    }

    pub fn is_guest(&self) -> bool {
        self.inferred_role.as_deref() == Some("guest")
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    pub fn words_per_second(&self) -> f64 {
        if self.duration > 0.0 {
            self.word_count() as f64 / self.duration
        } else {
            0.0
        }
    }

    pub fn contains_time(&self, t: f64) -> bool {
        self.start_time <= t && t <= self.end_time
    }

    pub fn overlaps_with(&self, other: &Turn) -> bool {
        self.start_time < other.end_time && other.start_time < self.end_time
    }
}

/// Loading state of an episode's turns.
#[derive(Debug, Clone, Copy)]
pub enum TurnState<'a> {
    Unloaded,
    Loaded(&'a [Turn]),
}

impl TurnState<'_> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, TurnState::Loaded(_))
    }
}

/// Write-once holder for an episode's turns.
///
/// The sequence is attached in one step, so readers either see nothing or the
/// complete, ordered list. Attaching twice keeps the first sequence.
#[derive(Debug, Default)]
pub struct TurnSlot {
    turns: OnceLock<Box<[Turn]>>,
}

impl TurnSlot {
    pub fn state(&self) -> TurnState<'_> {
        match self.turns.get() {
            Some(turns) => TurnState::Loaded(turns),
            None => TurnState::Unloaded,
        }
    }

    /// Returns `true` if this call performed the `Unloaded -> Loaded` transition.
    pub(crate) fn attach(&self, turns: Vec<Turn>) -> bool {
        self.turns.set(turns.into_boxed_slice()).is_ok()
    }
}

/// How `Episode::turns_in_time_range` treats turns crossing the range edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeRangeBehavior {
    /// Only turns entirely inside the range.
    Strict,
    /// Any turn overlapping the range.
    #[default]
    IncludePartial,
    /// Turns starting before the range end and ending after its start.
    IncludeFullTurns,
}

/// Per-episode turn summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnStatistics {
    pub total_turns: usize,
    pub total_words: usize,
    pub avg_turn_duration: f64,
    pub avg_words_per_turn: f64,
    pub speaker_distribution: BTreeMap<String, usize>,
    pub role_distribution: BTreeMap<String, usize>,
}

/// A podcast episode. Scalar metadata is fixed at ingestion; turns are
/// attached later through the loader.
#[derive(Debug, Default, Serialize)]
pub struct Episode {
    pub title: String,
    pub description: String,
    /// Stable record key, shared by the catalog and the turn offset index.
    pub mp3_url: String,
    pub duration_seconds: f64,
    pub transcript: String,
    pub podcast_title: String,
    pub podcast_description: String,
    pub rss_url: String,
    pub categories: Vec<String>,
    pub host_names: Vec<String>,
    pub guest_names: Vec<String>,
    pub neither_names: Vec<String>,
    pub main_speakers: Vec<String>,
    pub host_speaker_labels: HashMap<String, String>,
    pub guest_speaker_labels: HashMap<String, String>,
    pub overlap_prop_duration: f64,
    pub overlap_prop_turn_count: f64,
    pub avg_turn_duration: f64,
    pub total_speaker_labels: f64,
    pub language: String,
    pub explicit: bool,
    pub image_url: Option<String>,
    /// Milliseconds since the epoch, as published in the feed.
    pub episode_date_ms: Option<i64>,
    #[serde(skip)]
    pub(crate) turn_slot: TurnSlot,
}

impl Episode {
    pub fn key(&self) -> &str {
        &self.mp3_url
    }

    pub fn primary_category(&self) -> Option<&str> {
        self.categories.first().map(String::as_str)
    }

    pub fn num_main_speakers(&self) -> usize {
        self.main_speakers.len()
    }

    pub fn duration_minutes(&self) -> f64 {
        self.duration_seconds / 60.0
    }

    pub fn duration_hours(&self) -> f64 {
        self.duration_seconds / 3600.0
    }

    pub fn is_long_form(&self) -> bool {
        self.duration_minutes() > 30.0
    }

    pub fn is_short_form(&self) -> bool {
        self.duration_minutes() < 10.0
    }

    pub fn has_guests(&self) -> bool {
        !self.guest_names.is_empty()
    }

    pub fn is_solo(&self) -> bool {
        self.host_names.len() == 1 && self.guest_names.is_empty()
    }

    pub fn is_interview(&self) -> bool {
        !self.host_names.is_empty() && !self.guest_names.is_empty()
    }

    pub fn is_panel(&self) -> bool {
        self.host_names.len() + self.guest_names.len() > 2
    }

    pub fn episode_date(&self) -> Option<DateTime<Utc>> {
        self.episode_date_ms.and_then(DateTime::from_timestamp_millis)
    }

    pub fn turn_state(&self) -> TurnState<'_> {
        self.turn_slot.state()
    }

    pub fn turns_loaded(&self) -> bool {
        self.turn_state().is_loaded()
    }

    /// The start-time ordered turn sequence, or `TurnsNotLoaded`.
    pub fn turns(&self) -> Result<&[Turn]> {
        match self.turn_state() {
            TurnState::Loaded(turns) => Ok(turns),
            TurnState::Unloaded => Err(SporcError::TurnsNotLoaded(self.mp3_url.clone())),
        }
    }

    pub fn turn_count(&self) -> Result<usize> {
        Ok(self.turns()?.len())
    }

    pub fn get_turn(&self, index: usize) -> Result<Option<&Turn>> {
        Ok(self.turns()?.get(index))
    }

    /// Matches a diarization label (`SPEAKER_00`) or an inferred name.
    pub fn turns_by_speaker(&self, speaker: &str) -> Result<Vec<&Turn>> {
        Ok(self
            .turns()?
            .iter()
            .filter(|t| {
                t.speakers.iter().any(|s| s == speaker)
                    || t.inferred_name.as_deref() == Some(speaker)
            })
            .collect())
    }

    pub fn turns_by_role(&self, role: &str) -> Result<Vec<&Turn>> {
        Ok(self
            .turns()?
            .iter()
            .filter(|t| t.inferred_role.as_deref() == Some(role))
            .collect())
    }

    /// Turns inside `[start, end]`, clamped to `[0, duration]`.
    pub fn turns_in_time_range(
        &self,
        start: f64,
        end: f64,
        behavior: TimeRangeBehavior,
    ) -> Result<Vec<&Turn>> {
        let turns = self.turns()?;
        let start = start.max(0.0);
        let end = if self.duration_seconds > 0.0 {
            end.min(self.duration_seconds)
        } else {
            end
        };

        Ok(turns
            .iter()
            .filter(|t| match behavior {
                TimeRangeBehavior::Strict => t.start_time >= start && t.end_time <= end,
                TimeRangeBehavior::IncludePartial => t.start_time < end && start < t.end_time,
                TimeRangeBehavior::IncludeFullTurns => t.start_time < end && t.end_time > start,
            })
            .collect())
    }

    pub fn turn_statistics(&self) -> Result<TurnStatistics> {
        let turns = self.turns()?;
        if turns.is_empty() {
            return Ok(TurnStatistics::default());
        }

        let total_words: usize = turns.iter().map(Turn::word_count).sum();
        let total_duration: f64 = turns.iter().map(|t| t.duration).sum();
        let mut speaker_distribution = BTreeMap::new();
        let mut role_distribution = BTreeMap::new();
        for turn in turns {
            for speaker in &turn.speakers {
                *speaker_distribution.entry(speaker.clone()).or_insert(0) += 1;
            }
            let role = turn.inferred_role.clone().unwrap_or_else(|| "unknown".into());
            *role_distribution.entry(role).or_insert(0) += 1;
        }

        Ok(TurnStatistics {
            total_turns: turns.len(),
            total_words,
            avg_turn_duration: total_duration / turns.len() as f64,
            avg_words_per_turn: total_words as f64 / turns.len() as f64,
            speaker_distribution,
            role_distribution,
        })
    }
}

/// A podcast and its episodes, in source order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Podcast {
    pub title: String,
    pub description: String,
    pub rss_url: String,
    pub language: String,
    pub explicit: bool,
    pub image_url: Option<String>,
    pub episodes: Vec<Arc<Episode>>,
}

impl Podcast {
    /// Seed a podcast from the podcast-level fields of its first episode.
    pub fn from_episode(episode: &Episode) -> Self {
        Podcast {
            title: episode.podcast_title.clone(),
            description: episode.podcast_description.clone(),
            rss_url: episode.rss_url.clone(),
            language: episode.language.clone(),
            explicit: episode.explicit,
            image_url: episode.image_url.clone(),
            episodes: Vec::new(),
        }
    }

    pub fn episode_count(&self) -> usize {
        self.episodes.len()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Episode>> {
        self.episodes.get(index)
    }

    pub fn iterate(&self) -> impl Iterator<Item = &Arc<Episode>> {
        self.episodes.iter()
    }

    pub fn total_duration_seconds(&self) -> f64 {
        self.episodes.iter().map(|e| e.duration_seconds).sum()
    }

    pub fn total_duration_hours(&self) -> f64 {
        self.total_duration_seconds() / 3600.0
    }

    pub fn host_names(&self) -> Vec<&str> {
        unique_in_order(self.episodes.iter().flat_map(|e| e.host_names.iter()))
    }

    pub fn guest_names(&self) -> Vec<&str> {
        unique_in_order(self.episodes.iter().flat_map(|e| e.guest_names.iter()))
    }

    pub fn categories(&self) -> Vec<&str> {
        unique_in_order(self.episodes.iter().flat_map(|e| e.categories.iter()))
    }

    /// Most common primary category across episodes; ties go to the first seen.
    pub fn primary_category(&self) -> Option<&str> {
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for cat in self.episodes.iter().filter_map(|e| e.primary_category()) {
            match counts.iter_mut().find(|(c, _)| *c == cat) {
                Some((_, n)) => *n += 1,
                None => counts.push((cat, 1)),
            }
        }
        let best = counts.iter().map(|(_, n)| *n).max()?;
        counts.into_iter().find(|(_, n)| *n == best).map(|(c, _)| c)
    }

    pub fn find_episode(&self, title: &str) -> Option<&Arc<Episode>> {
        self.episodes
            .iter()
            .find(|e| e.title.eq_ignore_ascii_case(title))
    }
}

fn unique_in_order<'a>(names: impl Iterator<Item = &'a String>) -> Vec<&'a str> {
    let mut out: Vec<&str> = Vec::new();
    for name in names {
        if !out.contains(&name.as_str()) {
            out.push(name);
        }
    }
    out
}
