use serde::Serialize;

use crate::corpus::models::Turn;

/// Restrictions applied to turn-text searches.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnFilters {
    /// Podcast title, case-insensitive exact match.
    pub podcast: Option<String>,
    /// Episode key (mp3url).
    pub episode: Option<String>,
    /// Inferred speaker role, case-insensitive.
    pub role: Option<String>,
}

impl TurnFilters {
    /// Record-level part of the filter, decided before any turn is decoded.
    pub fn matches_record(&self, key: &str, podcast_title: &str) -> bool {
        if self.episode.as_deref().is_some_and(|e| e != key) {
            return false;
        }
        if let Some(ref podcast) = self.podcast {
            if !podcast_title.eq_ignore_ascii_case(podcast) {
                return false;
            }
        }
        true
    }

    pub fn matches_turn(&self, turn: &Turn) -> bool {
        match self.role {
            Some(ref role) => turn
                .inferred_role
                .as_deref()
                .is_some_and(|r| r.eq_ignore_ascii_case(role)),
            None => true,
        }
    }

    /// WHERE fragments over the `turns` table (aliased `t`) and their
    /// params. Placeholders are numbered from `first_param`.
    pub fn conditions(&self, first_param: usize) -> (Vec<String>, Vec<Box<dyn rusqlite::types::ToSql>>) {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref podcast) = self.podcast {
            conditions.push(format!("t.podcast_title = ?{} COLLATE NOCASE", first_param + params.len()));
            params.push(Box::new(podcast.clone()));
        }

        if let Some(ref episode) = self.episode {
            conditions.push(format!("t.record_key = ?{}", first_param + params.len()));
            params.push(Box::new(episode.clone()));
        }

        if let Some(ref role) = self.role {
            conditions.push(format!("t.role = ?{} COLLATE NOCASE", first_param + params.len()));
            params.push(Box::new(role.clone()));
        }

        (conditions, params)
    }
}
