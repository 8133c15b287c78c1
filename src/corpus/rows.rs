use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::corpus::models::{Episode, Turn};
use crate::error::{Result, SporcError};

const NO_HOST: &str = "NO_HOST_PREDICTED";
const NO_GUEST: &str = "NO_GUEST_PREDICTED";
const NO_NEITHER: &str = "NO_NEITHER_IDENTIFIED";
const NO_SPEAKER_DATA: &str = "SPEAKER_DATA_UNAVAILABLE";

/// One line of the episode metadata file.
///
/// Field types vary between corpus releases (lists vs. single strings,
/// numbers vs. numeric strings), so the loosely typed fields are taken as raw
/// JSON and normalised in [`EpisodeRow::into_episode`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeRow {
    pub ep_title: Option<String>,
    pub ep_description: Option<String>,
    #[serde(rename = "mp3url")]
    pub mp3_url: Option<String>,
    pub duration_seconds: Option<Value>,
    pub transcript: Option<String>,
    pub pod_title: Option<String>,
    pub pod_description: Option<String>,
    pub rss_url: Option<String>,
    pub category1: Option<String>,
    pub category2: Option<String>,
    pub category3: Option<String>,
    pub category4: Option<String>,
    pub category5: Option<String>,
    pub category6: Option<String>,
    pub category7: Option<String>,
    pub category8: Option<String>,
    pub category9: Option<String>,
    pub category10: Option<String>,
    pub host_predicted_names: Option<Value>,
    pub guest_predicted_names: Option<Value>,
    pub neither_predicted_names: Option<Value>,
    pub main_ep_speakers: Option<Value>,
    pub host_speaker_labels: Option<Value>,
    pub guest_speaker_labels: Option<Value>,
    pub overlap_prop_duration: Option<Value>,
    pub overlap_prop_turn_count: Option<Value>,
    pub avg_turn_duration: Option<Value>,
    #[serde(rename = "totalSpLabels")]
    pub total_sp_labels: Option<Value>,
    pub language: Option<String>,
    pub explicit: Option<Value>,
    pub image_url: Option<String>,
    pub episode_date_localized: Option<Value>,
}

impl EpisodeRow {
    /// Decode one metadata line. `location` is used in error messages only.
    pub fn parse(line: &[u8], location: &str) -> Result<EpisodeRow> {
        serde_json::from_slice(line).map_err(|e| SporcError::malformed(location, e.to_string()))
    }

    pub fn into_episode(self, location: &str) -> Result<Episode> {
        let mp3_url = self
            .mp3_url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| SporcError::malformed(location, "row has no mp3url"))?;

        let duration_seconds = as_f64(self.duration_seconds.as_ref());
        if duration_seconds < 0.0 {
            return Err(SporcError::malformed(
                location,
                format!("negative duration {duration_seconds}"),
            ));
        }

        let categories = [
            self.category1,
            self.category2,
            self.category3,
            self.category4,
            self.category5,
            self.category6,
            self.category7,
            self.category8,
            self.category9,
            self.category10,
        ]
        .into_iter()
        .flatten()
        .filter(|c| !c.trim().is_empty())
        .collect();

        Ok(Episode {
            title: self.ep_title.unwrap_or_default(),
            description: self.ep_description.unwrap_or_default(),
            mp3_url,
            duration_seconds,
            transcript: self.transcript.unwrap_or_default(),
            podcast_title: self
                .pod_title
                .unwrap_or_else(|| "Unknown Podcast".to_string()),
            podcast_description: self.pod_description.unwrap_or_default(),
            rss_url: self.rss_url.unwrap_or_default(),
            categories,
            host_names: name_list(self.host_predicted_names.as_ref(), NO_HOST),
            guest_names: name_list(self.guest_predicted_names.as_ref(), NO_GUEST),
            neither_names: name_list(self.neither_predicted_names.as_ref(), NO_NEITHER),
            main_speakers: name_list(self.main_ep_speakers.as_ref(), NO_SPEAKER_DATA),
            host_speaker_labels: label_map(self.host_speaker_labels.as_ref()),
            guest_speaker_labels: label_map(self.guest_speaker_labels.as_ref()),
            overlap_prop_duration: as_f64(self.overlap_prop_duration.as_ref()),
            overlap_prop_turn_count: as_f64(self.overlap_prop_turn_count.as_ref()),
            avg_turn_duration: as_f64(self.avg_turn_duration.as_ref()),
            total_speaker_labels: as_f64(self.total_sp_labels.as_ref()),
            language: self.language.unwrap_or_else(|| "en".to_string()),
            explicit: as_bool(self.explicit.as_ref()),
            image_url: self.image_url,
            episode_date_ms: self
                .episode_date_localized
                .as_ref()
                .and_then(as_opt_f64)
                .map(|ms| ms as i64),
            ..Default::default()
        })
    }
}

/// Only the record key of a turn-file line. Everything else is skipped by
/// serde without being materialised.
#[derive(Debug, Deserialize)]
pub struct KeyOnly {
    #[serde(rename = "mp3url")]
    pub mp3_url: Option<String>,
}

impl KeyOnly {
    pub fn key_of(line: &[u8]) -> std::result::Result<String, String> {
        let row: KeyOnly = serde_json::from_slice(line).map_err(|e| e.to_string())?;
        row
            .mp3_url
            .filter(|k| !k.is_empty())
            .ok_or_else(|| "line has no mp3url".to_string())
    }
}

/// One speaker turn as stored in the turn file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRow {
    #[serde(rename = "mp3url")]
    pub mp3_url: Option<String>,
    pub speaker: Option<Value>,
    pub turn_text: Option<String>,
    pub start_time: Option<Value>,
    pub end_time: Option<Value>,
    pub turn_count: Option<Value>,
    pub inferred_speaker_role: Option<String>,
    pub inferred_speaker_name: Option<String>,
}

impl TurnRow {
    pub fn into_turn(self) -> std::result::Result<Turn, String> {
        let speakers = name_list(self.speaker.as_ref(), NO_SPEAKER_DATA);
        let start = as_f64(self.start_time.as_ref());
        let end = as_f64(self.end_time.as_ref());
        let mut turn = Turn::new(speakers, self.turn_text.unwrap_or_default(), start, end)?;
        turn.turn_count = as_f64(self.turn_count.as_ref()) as i64;
        turn.inferred_role = self.inferred_speaker_role.filter(|r| !r.is_empty());
        turn.inferred_name = self.inferred_speaker_name.filter(|n| !n.is_empty());
        Ok(turn)
    }
}

/// A turn-file line: either a whole episode chunk or a single turn row.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TurnLine {
    Chunk {
        #[serde(rename = "mp3url")]
        mp3_url: String,
        turns: Vec<TurnRow>,
    },
    Row(TurnRow),
}

/// Decode the bytes of one chunk (one or more lines, all for `key`) into the
/// episode's turn sequence, ordered by start time with indices matching
/// positions. Any undecodable line or invalid turn fails the whole chunk.
pub fn parse_turn_chunk(bytes: &[u8], key: &str) -> Result<Vec<Turn>> {
    let mut turns = Vec::new();
    for (n, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let location = format!("{key} (chunk line {})", n + 1);
        let parsed: TurnLine = serde_json::from_slice(line)
            .map_err(|e| SporcError::malformed(&location, e.to_string()))?;
        match parsed {
            TurnLine::Chunk { mp3_url, turns: rows } => {
                if mp3_url != key {
                    return Err(SporcError::malformed(
                        &location,
                        format!("chunk belongs to {mp3_url}"),
                    ));
                }
                for row in rows {
                    turns.push(row.into_turn().map_err(|e| SporcError::malformed(&location, e))?);
                }
            }
            TurnLine::Row(row) => {
                if row.mp3_url.as_deref().is_some_and(|k| k != key) {
                    return Err(SporcError::malformed(&location, "row belongs to another episode"));
                }
                turns.push(row.into_turn().map_err(|e| SporcError::malformed(&location, e))?);
            }
        }
    }
    Ok(order_turns(turns))
}

/// Stable sort by start time, then renumber.
pub fn order_turns(mut turns: Vec<Turn>) -> Vec<Turn> {
    turns.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
    for (i, turn) in turns.iter_mut().enumerate() {
        turn.index = i;
    }
    turns
}

fn as_opt_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_f64(v: Option<&Value>) -> f64 {
    v.and_then(as_opt_f64).filter(|f| f.is_finite()).unwrap_or(0.0)
}

fn as_bool(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Some(other) => as_opt_f64(other).is_some_and(|f| f != 0.0),
        None => false,
    }
}

/// Normalise a scalar-or-list name field; the sentinel means "none".
fn name_list(v: Option<&Value>, sentinel: &str) -> Vec<String> {
    match v {
        Some(Value::String(s)) if s == sentinel || s.trim().is_empty() => Vec::new(),
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.as_str())
            .filter(|s| *s != sentinel && !s.trim().is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Speaker-label maps arrive as objects or as JSON-encoded strings.
fn label_map(v: Option<&Value>) -> HashMap<String, String> {
    let obj = match v {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(s)) if s != NO_SPEAKER_DATA => {
            match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(map)) => map,
                _ => return HashMap::new(),
            }
        }
        _ => return HashMap::new(),
    };
    obj.into_iter()
        .map(|(k, v)| {
            let label = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, label)
        })
        .collect()
}
