use unicode_width::UnicodeWidthStr;

use crate::corpus::models::{Episode, Podcast, Turn};
use crate::dataset::IndexStatus;
use crate::search::{EpisodeHit, TurnHit};
use crate::subset::SubsetReport;
use crate::window::{TurnWindow, WindowStatistics};

/// Format duration in seconds to human-readable string.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    if h > 0 {
        format!("{h}h{m:02}m")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

/// Truncate a string to fit within max_width (respecting unicode width).
fn truncate(s: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(s) <= max_width {
        return s.to_string();
    }
    let mut result = String::new();
    let mut width = 0;
    for ch in s.chars() {
        let cw = unicode_width::UnicodeWidthChar::width(ch).unwrap_or(0);
        if width + cw + 3 > max_width {
            result.push_str("...");
            break;
        }
        result.push(ch);
        width += cw;
    }
    result
}

/// Pad to a display width; `format!` padding counts chars, not columns.
fn pad(s: &str, width: usize) -> String {
    let t = truncate(s, width);
    let used = UnicodeWidthStr::width(t.as_str());
    format!("{t}{}", " ".repeat(width.saturating_sub(used)))
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

/// Format episode search results as a table.
pub fn print_episode_results(results: &[std::sync::Arc<Episode>]) {
    if results.is_empty() {
        println!("No matching episodes.");
        return;
    }

    println!("{} episode{}:\n", results.len(), plural(results.len()));
    println!(
        "  {} {} {:<8} {:<4}",
        pad("TITLE", 40),
        pad("PODCAST", 26),
        "DURATION",
        "SPKR"
    );
    println!("  {}", "-".repeat(82));

    for ep in results {
        println!(
            "  {} {} {:<8} {:<4}",
            pad(&ep.title, 40),
            pad(&ep.podcast_title, 26),
            format_duration(ep.duration_seconds),
            ep.num_main_speakers(),
        );
        println!("  key: {}\n", ep.mp3_url);
    }
}

/// Podcast summary for `sporc podcast`.
pub fn print_podcast_detail(p: &Podcast) {
    println!("Podcast: {}", p.title);
    println!("  Episodes: {}", p.episode_count());
    println!("  Duration: {}", format_duration(p.total_duration_seconds()));
    println!("  Language: {}", p.language);
    if let Some(cat) = p.primary_category() {
        println!("  Category: {cat}");
    }
    let hosts = p.host_names();
    if !hosts.is_empty() {
        println!("  Hosts:    {}", truncate(&hosts.join(", "), 70));
    }
    if !p.description.is_empty() {
        println!("\n  {}", truncate(&p.description.replace('\n', " "), 76));
    }

    println!();
    for ep in p.iterate() {
        println!(
            "  {} {:<8}",
            pad(&ep.title, 60),
            format_duration(ep.duration_seconds)
        );
    }
}

/// Turn listing for `sporc turns`.
pub fn print_turns(episode: &Episode, turns: &[&Turn]) {
    println!("Episode: {} ({})", episode.title, episode.mp3_url);
    println!("{} turn{}:\n", turns.len(), plural(turns.len()));

    let mut last_speaker = "";
    for turn in turns {
        let speaker = turn.primary_speaker();
        if speaker != last_speaker {
            if !last_speaker.is_empty() {
                println!();
            }
            let role = turn
                .inferred_role
                .as_deref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default();
            println!("  {speaker}{role} [{}]:", format_timestamp(turn.start_time));
            last_speaker = speaker;
        }
        println!("    {}", turn.text);
    }
    println!();
}

/// One line per window for `sporc windows`.
pub fn print_windows(windows: &[TurnWindow<'_>], stats: &WindowStatistics) {
    if windows.is_empty() {
        println!("No windows.");
        return;
    }

    println!(
        "  {:<6} {:<12} {:<17} {:<5} {:<5} {}",
        "WINDOW", "TURNS", "TIME", "NEW", "OVLP", "SPEAKERS"
    );
    println!("  {}", "-".repeat(76));
    for w in windows {
        let (start, end) = w.time_range();
        let speakers: Vec<String> = w
            .speaker_distribution()
            .into_iter()
            .map(|(s, n)| format!("{s}:{n}"))
            .collect();
        println!(
            "  {:<6} {:<12} {:<17} {:<5} {:<5} {}",
            w.window_index,
            format!("{}..{}", w.start_index, w.end_index),
            format!("{}-{}", format_timestamp(start), format_timestamp(end)),
            w.new_turns.len(),
            w.overlap_turns.len(),
            truncate(&speakers.join(" "), 30),
        );
    }

    println!(
        "\n  {} window{}, avg {:.1} turns, avg overlap {:.1}",
        stats.total_windows,
        plural(stats.total_windows),
        stats.avg_window_size,
        stats.avg_overlap
    );
}

/// Matching turns for `sporc grep`.
pub fn print_turn_hits(hits: &[TurnHit]) {
    if hits.is_empty() {
        println!("No matching turns.");
        return;
    }

    println!("{} turn{}:\n", hits.len(), plural(hits.len()));
    for hit in hits {
        let role = hit.role.as_deref().map(|r| format!(" ({r})")).unwrap_or_default();
        println!(
            "  {} [{}] {}{role}",
            truncate(&hit.podcast_title, 40),
            format_timestamp(hit.start_time),
            hit.speaker
        );
        println!("    {}", truncate(&hit.text.replace('\n', " "), 100));
        println!("    key: {}\n", hit.mp3url);
    }
}

/// Per-episode match counts for `sporc grep --episodes`.
pub fn print_episode_text_hits(hits: &[EpisodeHit]) {
    if hits.is_empty() {
        println!("No matching episodes.");
        return;
    }

    println!("  {} {:<7} {:<8} {}", pad("PODCAST", 30), "MATCHES", "SCORE", "KEY");
    println!("  {}", "-".repeat(82));
    for hit in hits {
        println!(
            "  {} {:<7} {:<8.2} {}",
            pad(&hit.podcast_title, 30),
            hit.match_count,
            hit.best_score,
            hit.mp3url
        );
    }
}

pub fn print_index_status(status: &IndexStatus) {
    println!("Turn index:");
    println!("  Built:       {}", if status.index_built { "yes" } else { "no" });
    if let Some(ref state) = status.build_state {
        println!("  State:       {state:?}");
    }
    println!("  Indexed:     {}", status.episodes_indexed);
    println!("  Fragmented:  {}", status.fragmented);
    println!("  Malformed:   {}", status.malformed);
    if status.incomplete_loads > 0 {
        println!("  Incomplete:  {} (loaded before the build finished)", status.incomplete_loads);
    }
    println!("  Turn files:  {}", status.turn_files);
    println!("  Local:       {}", if status.local_mode { "yes" } else { "no (full scans only)" });
    if let Some(ref path) = status.index_path {
        println!("  Path:        {}", path.display());
    }
}

pub fn print_subset_report(report: &SubsetReport, podcasts: usize, episodes: usize) {
    println!(
        "Examined {}, matched {}, kept {}{}",
        report.examined,
        report.matched,
        report.kept,
        if report.stopped_early { " (stopped early)" } else { "" }
    );
    println!(
        "Subset: {podcasts} podcast{}, {episodes} episode{}",
        plural(podcasts),
        plural(episodes)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45.0), "45s");
        assert_eq!(format_duration(125.0), "2m05s");
        assert_eq!(format_duration(3720.0), "1h02m");
        assert_eq!(format_duration(-3.0), "0s");
    }

    #[test]
    fn test_truncate_and_pad_use_display_width() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a long podcast title", 10), "a long ...");
        assert_eq!(UnicodeWidthStr::width(pad("日本語のポッドキャスト", 12).as_str()), 12);
        assert_eq!(pad("ab", 4), "ab  ");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(65.0), "01:05");
        assert_eq!(format_timestamp(3725.0), "1:02:05");
    }
}
