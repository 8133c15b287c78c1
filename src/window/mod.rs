//! Overlapping windows over an ordered turn sequence.
//!
//! Parameters are validated up front, so a bad call fails before any window
//! exists. Iterators are lazy and cheap to clone; calling `by_count` or
//! `by_duration` again derives the same windows from the same turns.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::corpus::models::Turn;
use crate::error::{Result, SporcError};

/// A borrowed view over `turns[start_index..end_index]`.
#[derive(Debug, Clone, Copy)]
pub struct TurnWindow<'a> {
    pub window_index: usize,
    pub total_windows: usize,
    pub start_index: usize,
    pub end_index: usize,
    pub turns: &'a [Turn],
    /// Turns also present in the previous window.
    pub overlap_turns: &'a [Turn],
    /// Turns not present in the previous window.
    pub new_turns: &'a [Turn],
    bounds: Option<(f64, f64)>,
}

impl<'a> TurnWindow<'a> {
    pub fn size(&self) -> usize {
        self.turns.len()
    }

    pub fn is_first(&self) -> bool {
        self.window_index == 0
    }

    pub fn is_last(&self) -> bool {
        self.window_index + 1 == self.total_windows
    }

    /// Window boundaries for time windows; first start to last end otherwise.
    pub fn time_range(&self) -> (f64, f64) {
        if let Some(bounds) = self.bounds {
            return bounds;
        }
        match (self.turns.first(), self.turns.last()) {
            (Some(first), Some(last)) => (first.start_time, last.end_time),
            _ => (0.0, 0.0),
        }
    }

    pub fn duration(&self) -> f64 {
        let (start, end) = self.time_range();
        end - start
    }

    pub fn speaker_distribution(&self) -> BTreeMap<&'a str, usize> {
        let mut counts = BTreeMap::new();
        for turn in self.turns {
            *counts.entry(turn.primary_speaker()).or_insert(0) += 1;
        }
        counts
    }

    pub fn role_distribution(&self) -> BTreeMap<&'a str, usize> {
        let mut counts = BTreeMap::new();
        for turn in self.turns {
            let role = turn.inferred_role.as_deref().unwrap_or("unknown");
            *counts.entry(role).or_insert(0) += 1;
        }
        counts
    }

    pub fn text(&self, separator: &str) -> String {
        self.turns
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(separator)
    }
}

/// Fixed-size windows, see [`by_count`].
#[derive(Debug, Clone)]
pub struct CountWindows<'a> {
    turns: &'a [Turn],
    size: usize,
    step: usize,
    start: usize,
    end: usize,
    next: usize,
    total: usize,
    prev_end: usize,
}

/// Windows of `window_size` turns advancing by `window_size - overlap`.
///
/// Windows cover `turns[start_index..end_index]` (the whole slice by
/// default). A new window starts only while the previous one has not
/// reached the end, so the final window is clipped rather than made of
/// overlap alone.
pub fn by_count(
    turns: &[Turn],
    window_size: usize,
    overlap: usize,
    start_index: Option<usize>,
    end_index: Option<usize>,
) -> Result<CountWindows<'_>> {
    if window_size == 0 || overlap >= window_size {
        return Err(SporcError::InvalidWindowParameters(format!(
            "window_size ({window_size}) must be greater than overlap ({overlap})"
        )));
    }
    let start = start_index.unwrap_or(0);
    let end = end_index.unwrap_or(turns.len());
    if end > turns.len() || start > end {
        return Err(SporcError::InvalidWindowParameters(format!(
            "index range {start}..{end} is outside 0..{}",
            turns.len()
        )));
    }

    let step = window_size - overlap;
    let span = end - start;
    let total = match span {
        0 => 0,
        n if n <= window_size => 1,
        n => (n - window_size).div_ceil(step) + 1,
    };

    Ok(CountWindows {
        turns,
        size: window_size,
        step,
        start,
        end,
        next: 0,
        total,
        prev_end: start,
    })
}

impl<'a> Iterator for CountWindows<'a> {
    type Item = TurnWindow<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let ws = self.start + self.next * self.step;
        let we = (ws + self.size).min(self.end);
        let window = make_window(self.turns, self.next, self.total, ws, we, self.prev_end, None);
        self.prev_end = we;
        self.next += 1;
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for CountWindows<'_> {}

/// Fixed-duration windows, see [`by_duration`].
#[derive(Debug, Clone)]
pub struct TimeWindows<'a> {
    turns: &'a [Turn],
    duration: f64,
    step: f64,
    start: f64,
    end: f64,
    next: usize,
    total: usize,
    prev_end: usize,
}

/// Windows of `window_duration` seconds advancing by
/// `window_duration - overlap_duration`.
///
/// A turn belongs to every window whose `[ws, we)` contains its start time.
/// Turns are never split. `start_time` defaults to 0 and `end_time` to the
/// latest turn end; the last window is clipped to `end_time`.
pub fn by_duration(
    turns: &[Turn],
    window_duration: f64,
    overlap_duration: f64,
    start_time: Option<f64>,
    end_time: Option<f64>,
) -> Result<TimeWindows<'_>> {
    let valid = window_duration.is_finite()
        && overlap_duration.is_finite()
        && overlap_duration >= 0.0
        && window_duration > overlap_duration;
    if !valid {
        return Err(SporcError::InvalidWindowParameters(format!(
            "window_duration ({window_duration}) must be greater than overlap_duration \
             ({overlap_duration}) and overlap_duration must be non-negative"
        )));
    }

    let start = start_time.unwrap_or(0.0);
    let end = end_time.unwrap_or_else(|| turns.iter().map(|t| t.end_time).fold(0.0, f64::max));
    if !start.is_finite() || !end.is_finite() || start < 0.0 || end < start {
        return Err(SporcError::InvalidWindowParameters(format!(
            "time range {start}..{end} is invalid"
        )));
    }

    let step = window_duration - overlap_duration;
    let total = time_window_count(end - start, window_duration, step);

    Ok(TimeWindows {
        turns,
        duration: window_duration,
        step,
        start,
        end,
        next: 0,
        total,
        prev_end: turns.partition_point(|t| t.start_time < start),
    })
}

/// Windows needed so the last one reaches `span`: the first `k` with
/// `k * step + window >= span`, plus one.
fn time_window_count(span: f64, window: f64, step: f64) -> usize {
    if span <= 0.0 {
        return 0;
    }
    if span <= window {
        return 1;
    }
    let mut k = ((span - window) / step).ceil();
    // Division can round up past the exact boundary.
    if k >= 1.0 && (k - 1.0) * step + window >= span {
        k -= 1.0;
    }
    k as usize + 1
}

impl<'a> Iterator for TimeWindows<'a> {
    type Item = TurnWindow<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let ws = self.start + self.next as f64 * self.step;
        let last = self.next + 1 == self.total;
        let we = if last { self.end } else { ws + self.duration };

        let lo = self.turns.partition_point(|t| t.start_time < ws);
        let hi = self.turns.partition_point(|t| t.start_time < we).max(lo);

        let window = make_window(
            self.turns,
            self.next,
            self.total,
            lo,
            hi,
            self.prev_end,
            Some((ws, we)),
        );
        self.prev_end = self.prev_end.max(hi);
        self.next += 1;
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for TimeWindows<'_> {}

fn make_window(
    turns: &[Turn],
    window_index: usize,
    total_windows: usize,
    start: usize,
    end: usize,
    prev_end: usize,
    bounds: Option<(f64, f64)>,
) -> TurnWindow<'_> {
    let split = if window_index == 0 {
        start
    } else {
        prev_end.clamp(start, end)
    };
    TurnWindow {
        window_index,
        total_windows,
        start_index: start,
        end_index: end,
        turns: &turns[start..end],
        overlap_turns: &turns[start..split],
        new_turns: &turns[split..end],
        bounds,
    }
}

/// Summary over a window sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowStatistics {
    pub total_windows: usize,
    pub avg_window_size: f64,
    pub min_window_size: usize,
    pub max_window_size: usize,
    pub avg_overlap: f64,
    pub avg_duration: f64,
}

pub fn window_statistics<'a>(windows: impl IntoIterator<Item = TurnWindow<'a>>) -> WindowStatistics {
    let mut stats = WindowStatistics {
        min_window_size: usize::MAX,
        ..Default::default()
    };
    let (mut sizes, mut overlaps, mut durations) = (0usize, 0usize, 0.0);

    for w in windows {
        stats.total_windows += 1;
        sizes += w.size();
        overlaps += w.overlap_turns.len();
        durations += w.duration();
        stats.min_window_size = stats.min_window_size.min(w.size());
        stats.max_window_size = stats.max_window_size.max(w.size());
    }

    if stats.total_windows == 0 {
        return WindowStatistics::default();
    }
    let n = stats.total_windows as f64;
    stats.avg_window_size = sizes as f64 / n;
    stats.avg_overlap = overlaps as f64 / n;
    stats.avg_duration = durations / n;
    stats
}
