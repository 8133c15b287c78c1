//! Search over the text of speaker turns.
//!
//! `Fts` queries go to the SQLite FTS5 database built by [`TextIndex`] and
//! are ranked by BM25. `Exact` (case-insensitive substring) and `Regex`
//! queries stream the turn files and need no index, so they also work on
//! remote sources.

pub mod filters;
pub mod fts;

use std::collections::HashMap;
use std::fmt;
use std::io::BufRead;
use std::str::FromStr;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::corpus::models::Turn;
use crate::corpus::rows::{parse_turn_chunk, KeyOnly};
use crate::error::{Result, SporcError};
use crate::source::CorpusSource;

pub use filters::TurnFilters;
pub use fts::{TextIndex, TextIndexSummary};

/// How the query text is matched against turn text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TextMatch {
    /// FTS5 query syntax, BM25 ranked.
    #[default]
    Fts,
    /// Case-insensitive substring.
    Exact,
    Regex,
}

impl fmt::Display for TextMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextMatch::Fts => f.write_str("fts"),
            TextMatch::Exact => f.write_str("exact"),
            TextMatch::Regex => f.write_str("regex"),
        }
    }
}

impl FromStr for TextMatch {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fts" => Ok(TextMatch::Fts),
            "exact" => Ok(TextMatch::Exact),
            "regex" => Ok(TextMatch::Regex),
            other => Err(format!("unknown search mode '{other}'; use fts, exact or regex")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnQuery {
    pub text: String,
    pub mode: TextMatch,
    pub filters: TurnFilters,
    pub limit: usize,
    pub offset: usize,
}

impl TurnQuery {
    pub fn new(text: impl Into<String>, mode: TextMatch) -> Self {
        TurnQuery {
            text: text.into(),
            mode,
            filters: TurnFilters::default(),
            limit: 100,
            offset: 0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(SporcError::InvalidQuery("query text is empty".into()));
        }
        Ok(())
    }
}

/// One matching turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnHit {
    pub mp3url: String,
    pub podcast_title: String,
    pub speaker: String,
    pub role: Option<String>,
    /// Turn number as published in the turn file.
    pub turn_count: i64,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    /// Higher is better. BM25 for `Fts`, 1.0 otherwise.
    pub score: f64,
}

impl TurnHit {
    fn new(key: &str, podcast_title: &str, turn: Turn, score: f64) -> Self {
        TurnHit {
            mp3url: key.to_string(),
            podcast_title: podcast_title.to_string(),
            speaker: turn.primary_speaker().to_string(),
            role: turn.inferred_role,
            turn_count: turn.turn_count,
            start_time: turn.start_time,
            end_time: turn.end_time,
            text: turn.text,
            score,
        }
    }
}

/// Matching turns grouped per episode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeHit {
    pub mp3url: String,
    pub podcast_title: String,
    pub match_count: usize,
    pub best_score: f64,
}

enum Matcher {
    Exact(String),
    Regex(regex::Regex),
}

impl Matcher {
    fn new(query: &TurnQuery) -> Result<Self> {
        match query.mode {
            TextMatch::Exact => Ok(Matcher::Exact(query.text.to_lowercase())),
            TextMatch::Regex => regex::Regex::new(&query.text)
                .map(Matcher::Regex)
                .map_err(|e| SporcError::InvalidQuery(e.to_string())),
            TextMatch::Fts => Err(SporcError::InvalidQuery(
                "full-text queries need the turn text index".into(),
            )),
        }
    }

    fn is_match(&self, text: &str) -> bool {
        match self {
            Matcher::Exact(needle) => text.to_lowercase().contains(needle.as_str()),
            Matcher::Regex(re) => re.is_match(text),
        }
    }
}

/// Decode every turn line of `source` whose record `titles` knows and
/// `filters` admits, handing each line's turns to `visit` with the record key
/// and podcast title. `visit` returns `false` to stop early. Returns the
/// number of lines skipped as undecodable.
pub(crate) fn walk_turns(
    source: &CorpusSource,
    titles: &HashMap<String, String>,
    filters: &TurnFilters,
    visit: &mut dyn FnMut(&str, &str, Vec<Turn>) -> bool,
) -> Result<usize> {
    let mut skipped = 0;
    let mut line = Vec::new();

    for location in source.turn_files() {
        debug!("Searching {}", location.describe());
        let mut reader = location.open()?;
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let Ok(key) = KeyOnly::key_of(&line) else {
                skipped += 1;
                continue;
            };
            let Some(title) = titles.get(&key) else {
                continue;
            };
            if !filters.matches_record(&key, title) {
                continue;
            }
            match parse_turn_chunk(&line, &key) {
                Ok(turns) => {
                    if !visit(&key, title, turns) {
                        return Ok(skipped);
                    }
                }
                Err(e) => {
                    skipped += 1;
                    debug!("Skipping turn line: {e}");
                }
            }
        }
    }
    Ok(skipped)
}

/// Streaming `Exact`/`Regex` search over the turn files.
///
/// Only records present in `titles` (key to podcast title) are searched.
/// When `page` is set the pass stops once `offset + limit` hits are found.
pub fn scan_turns(
    source: &CorpusSource,
    titles: &HashMap<String, String>,
    query: &TurnQuery,
    page: bool,
) -> Result<Vec<TurnHit>> {
    query.validate()?;
    let matcher = Matcher::new(query)?;
    let wanted = query.offset.saturating_add(query.limit);
    let mut hits = Vec::new();

    let skipped = walk_turns(source, titles, &query.filters, &mut |key, title, turns| {
        for turn in turns {
            if query.filters.matches_turn(&turn) && matcher.is_match(&turn.text) {
                hits.push(TurnHit::new(key, title, turn, 1.0));
                if page && hits.len() >= wanted {
                    return false;
                }
            }
        }
        true
    })?;
    if skipped > 0 {
        warn!("{skipped} undecodable turn line(s) skipped during search");
    }
    info!("Text scan for {:?} found {} turn(s)", query.text, hits.len());

    if page {
        Ok(hits.into_iter().skip(query.offset).take(query.limit).collect())
    } else {
        Ok(hits)
    }
}

/// Group turn hits by episode, in first-seen order, then rank: by best score
/// when `by_score`, else by match count. Applies the query's page.
pub fn group_by_episode(hits: Vec<TurnHit>, by_score: bool, query: &TurnQuery) -> Vec<EpisodeHit> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut episodes: Vec<EpisodeHit> = Vec::new();
    for hit in hits {
        match slots.get(&hit.mp3url) {
            Some(&i) => {
                let ep = &mut episodes[i];
                ep.match_count += 1;
                ep.best_score = ep.best_score.max(hit.score);
            }
            None => {
                slots.insert(hit.mp3url.clone(), episodes.len());
                episodes.push(EpisodeHit {
                    mp3url: hit.mp3url,
                    podcast_title: hit.podcast_title,
                    match_count: 1,
                    best_score: hit.score,
                });
            }
        }
    }

    if by_score {
        episodes.sort_by(|a, b| b.best_score.total_cmp(&a.best_score));
    } else {
        episodes.sort_by(|a, b| b.match_count.cmp(&a.match_count));
    }
    episodes
        .into_iter()
        .skip(query.offset)
        .take(query.limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn row(key: &str, text: &str, role: &str, start: f64) -> String {
        format!(
            r#"{{"mp3url": "{key}", "speaker": ["SPEAKER_00"], "turnText": "{text}", "startTime": {start}, "endTime": {}, "inferredSpeakerRole": "{role}"}}"#,
            start + 1.0
        )
    }

    fn setup() -> (TempDir, CorpusSource, HashMap<String, String>) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(crate::source::EPISODE_FILE), "").unwrap();
        let lines = [
            row("a1", "Welcome to the Show", "host", 0.0),
            row("a1", "glad to be on the show", "guest", 1.0),
            "not json".to_string(),
            row("b1", "another show entirely", "host", 0.0),
            row("orphan", "show without metadata", "host", 0.0),
        ];
        fs::write(dir.path().join(crate::source::TURN_FILE), lines.join("\n") + "\n").unwrap();
        let source = CorpusSource::local_dir(dir.path(), false).unwrap();
        let titles = HashMap::from([
            ("a1".to_string(), "Alpha Radio".to_string()),
            ("b1".to_string(), "Beta Cast".to_string()),
        ]);
        (dir, source, titles)
    }

    #[test]
    fn test_exact_is_case_insensitive_and_skips_unknown_records() {
        let (_dir, source, titles) = setup();
        let hits = scan_turns(&source, &titles, &TurnQuery::new("SHOW", TextMatch::Exact), true).unwrap();
        let keys: Vec<&str> = hits.iter().map(|h| h.mp3url.as_str()).collect();
        assert_eq!(keys, vec!["a1", "a1", "b1"]);
        assert_eq!(hits[0].podcast_title, "Alpha Radio");
        assert_eq!(hits[0].role.as_deref(), Some("host"));
    }

    #[test]
    fn test_filters_and_paging() {
        let (_dir, source, titles) = setup();
        let mut query = TurnQuery::new("show", TextMatch::Exact);
        query.filters.podcast = Some("alpha radio".into());
        query.filters.role = Some("guest".into());
        let hits = scan_turns(&source, &titles, &query, true).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "glad to be on the show");

        let mut query = TurnQuery::new("show", TextMatch::Exact);
        query.offset = 1;
        query.limit = 1;
        let page = scan_turns(&source, &titles, &query, true).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].text, "glad to be on the show");
    }

    #[test]
    fn test_regex_mode_and_bad_patterns() {
        let (_dir, source, titles) = setup();
        let hits = scan_turns(&source, &titles, &TurnQuery::new(r"^(Welcome|another)\b", TextMatch::Regex), true)
            .unwrap();
        assert_eq!(hits.len(), 2);

        assert!(matches!(
            scan_turns(&source, &titles, &TurnQuery::new("(unclosed", TextMatch::Regex), true),
            Err(SporcError::InvalidQuery(_))
        ));
        assert!(matches!(
            scan_turns(&source, &titles, &TurnQuery::new("  ", TextMatch::Exact), true),
            Err(SporcError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_group_by_episode_ranks_by_count_or_score() {
        let (_dir, source, titles) = setup();
        let query = TurnQuery::new("show", TextMatch::Exact);
        let hits = scan_turns(&source, &titles, &query, false).unwrap();

        let by_count = group_by_episode(hits.clone(), false, &query);
        assert_eq!(by_count[0].mp3url, "a1");
        assert_eq!(by_count[0].match_count, 2);
        assert_eq!(by_count[1].match_count, 1);

        let mut scored = hits;
        scored[2].score = 5.0;
        let by_score = group_by_episode(scored, true, &query);
        assert_eq!(by_score[0].mp3url, "b1");
        assert_eq!(by_score[0].best_score, 5.0);
    }
}
