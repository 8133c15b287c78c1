use std::fs;
use std::path::Path;

use sporc::source::{EPISODE_FILE, TURN_FILE};
use sporc::{
    CorpusSource, Dataset, DatasetOptions, EpisodeQuery, IndexPolicy, LookupScope, Mode,
    PodcastFilter, Sampling, SporcError, TurnOffsetIndex, TurnState,
};
use tempfile::TempDir;

fn episode_row(podcast: &str, key: &str, secs: f64, category: &str) -> String {
    format!(
        r#"{{"podTitle": "{podcast}", "mp3url": "{key}", "epTitle": "Episode {key}", "durationSeconds": {secs}, "category1": "{category}", "language": "en", "mainEpSpeakers": ["SPEAKER_00", "SPEAKER_01"]}}"#
    )
}

fn turn_row(key: &str, speaker: &str, text: &str, start: f64, end: f64) -> String {
    format!(
        r#"{{"mp3url": "{key}", "speaker": ["{speaker}"], "turnText": "{text}", "startTime": {start}, "endTime": {end}}}"#
    )
}

/// Four podcasts, seven episodes. `b1` has no turns; `a2` turns come as one chunk line.
fn write_corpus(dir: &Path) {
    let episodes = [
        episode_row("Alpha Radio", "a1", 1800.0, "Technology"),
        episode_row("Alpha Radio", "a2", 2400.0, "Technology"),
        episode_row("Beta Cast", "b1", 600.0, "Comedy"),
        episode_row("Gamma Science", "g1", 3600.0, "Science"),
        episode_row("Gamma Science", "g2", 900.0, "Science"),
        episode_row("Gamma Science", "g3", 1200.0, "Science"),
        episode_row("Delta Kitchen", "d1", 300.0, "Food"),
    ];
    fs::write(dir.join(EPISODE_FILE), episodes.join("\n") + "\n").unwrap();

    let mut turns = Vec::new();
    for i in 0..23 {
        let speaker = if i % 2 == 0 { "SPEAKER_00" } else { "SPEAKER_01" };
        turns.push(turn_row("a1", speaker, &format!("a1 turn {i}"), i as f64 * 10.0, i as f64 * 10.0 + 9.0));
    }
    turns.push(
        r#"{"mp3url": "a2", "turns": [{"speaker": ["SPEAKER_00"], "turnText": "chunked one", "startTime": 0, "endTime": 4}, {"speaker": ["SPEAKER_01"], "turnText": "chunked two", "startTime": 4, "endTime": 9}]}"#
            .to_string(),
    );
    turns.push(turn_row("g1", "SPEAKER_00", "welcome", 0.0, 100.0));
    turns.push(turn_row("g1", "SPEAKER_01", "thanks", 100.0, 250.0));
    turns.push(turn_row("g1", "SPEAKER_00", "so", 250.0, 620.0));
    turns.push(turn_row("g2", "SPEAKER_00", "short", 0.0, 5.0));
    turns.push(turn_row("g3", "SPEAKER_00", "hi", 0.0, 5.0));
    turns.push(turn_row("d1", "SPEAKER_00", "stir", 0.0, 5.0));
    fs::write(dir.join(TURN_FILE), turns.join("\n") + "\n").unwrap();
}

fn corpus() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_corpus(dir.path());
    dir
}

fn streaming() -> DatasetOptions {
    DatasetOptions {
        streaming: true,
        ..Default::default()
    }
}

#[test]
fn memory_mode_loads_turns_lazily_and_idempotently() {
    let dir = corpus();
    let ds = Dataset::open_dir(dir.path(), false, DatasetOptions::default()).unwrap();
    assert_eq!(ds.mode(), Mode::Memory);
    assert_eq!(ds.len().unwrap(), 7);
    assert_eq!(ds.podcast_count().unwrap(), 4);

    let a1 = ds.episode("a1").unwrap();
    assert!(matches!(ds.turn_state(&a1), TurnState::Unloaded));

    let first = ds.load_turns_for(&a1).unwrap();
    assert_eq!(first.len(), 23);
    let second = ds.load_turns_for(&a1).unwrap();
    assert!(std::ptr::eq(first, second));
    assert!(first.windows(2).all(|w| w[0].start_time <= w[1].start_time));

    let a2 = ds.episode("a2").unwrap();
    let chunked = ds.load_turns_for(&a2).unwrap();
    assert_eq!(chunked.len(), 2);
    assert_eq!(chunked[1].text, "chunked two");

    // No turn lines at all: loaded, but empty.
    let b1 = ds.episode("b1").unwrap();
    assert!(ds.load_turns_for(&b1).unwrap().is_empty());
    assert!(b1.turns_loaded());
}

#[test]
fn streaming_mode_reports_unknown_size_and_restarts_traversals() {
    let dir = corpus();
    let ds = Dataset::open_dir(dir.path(), false, streaming()).unwrap();
    assert_eq!(ds.mode(), Mode::Streaming);
    assert!(matches!(ds.len(), Err(SporcError::SizeUnknown)));

    let first: Vec<String> = ds.iterate_episodes().unwrap().map(|e| e.unwrap().mp3_url.clone()).collect();
    let second: Vec<String> = ds.iterate_episodes().unwrap().map(|e| e.unwrap().mp3_url.clone()).collect();
    assert_eq!(first.len(), 7);
    assert_eq!(first, second);
    assert_eq!(ds.iterate_podcasts().unwrap().count(), 4);

    let source = CorpusSource::local_dir(dir.path(), false)
        .unwrap()
        .with_known_total(Some(7));
    let known = Dataset::open(source, streaming()).unwrap();
    assert_eq!(known.len().unwrap(), 7);
}

#[test]
fn selective_mode_from_podcast_subset() {
    let dir = corpus();
    let mut ds = Dataset::open_dir(dir.path(), false, streaming()).unwrap();
    let filter = PodcastFilter {
        categories: vec!["Technology".into()],
        ..Default::default()
    };
    let report = ds.load_podcast_subset(&filter, Sampling::All).unwrap();
    assert_eq!(ds.mode(), Mode::Selective);
    assert_eq!(report.kept, 1);
    assert_eq!(ds.len().unwrap(), 2);

    let store = ds.store().unwrap();
    let summary = ds.load_turns_for_many(store.episodes()).unwrap();
    assert_eq!(summary.loaded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(ds.episode("a1").unwrap().turn_count().unwrap(), 23);

    assert!(matches!(
        ds.episode("g1"),
        Err(SporcError::NotFound { scope: LookupScope::LoadedSubset, .. })
    ));
    assert!(matches!(
        ds.load_podcast_subset(&PodcastFilter::default(), Sampling::All),
        Err(SporcError::SubsetAlreadyLoaded)
    ));
}

#[test]
fn empty_subset_is_not_an_error() {
    let dir = corpus();
    let mut ds = Dataset::open_dir(dir.path(), false, streaming()).unwrap();
    let report = ds
        .load_podcast_subset(
            &PodcastFilter {
                categories: vec!["Gardening".into()],
                ..Default::default()
            },
            Sampling::Random(3),
        )
        .unwrap();
    assert_eq!(report.kept, 0);
    assert_eq!(ds.mode(), Mode::Selective);
    assert_eq!(ds.len().unwrap(), 0);
    assert!(ds.search(&EpisodeQuery::default()).unwrap().is_empty());
    assert!(ds.all_episodes().unwrap().is_empty());
    assert!(ds.all_podcasts().unwrap().is_empty());
    assert_eq!(ds.podcast_count().unwrap(), 0);
}

#[test]
fn random_subset_is_bounded_and_reproducible() {
    let dir = corpus();
    let take = |seed| {
        let mut ds = Dataset::open_dir(
            dir.path(),
            false,
            DatasetOptions {
                streaming: true,
                seed: Some(seed),
                ..Default::default()
            },
        )
        .unwrap();
        ds.load_episode_subset(&EpisodeQuery::default(), Sampling::Random(3))
            .unwrap();
        ds.all_episodes()
            .unwrap()
            .iter()
            .map(|e| e.mp3_url.clone())
            .collect::<Vec<_>>()
    };
    let a = take(11);
    assert_eq!(a.len(), 3);
    assert_eq!(a, take(11));
}

#[test]
fn persisted_index_round_trip_and_staleness() {
    let dir = corpus();
    let source = CorpusSource::local_dir(dir.path(), false).unwrap();
    let index = TurnOffsetIndex::build(&source).unwrap();
    assert!(index.is_complete());
    assert_eq!(index.len(), 6);
    assert!(index.lookup("b1").is_none());

    let path = TurnOffsetIndex::default_path(dir.path());
    index.persist(&path).unwrap();
    let loaded = TurnOffsetIndex::load(&path, &source).unwrap();
    assert_eq!(loaded.len(), index.len());
    for (key, entry) in index.entries() {
        assert_eq!(loaded.lookup(key), Some(entry));
    }

    // Appending to the turn file invalidates the fingerprint.
    let turn_path = dir.path().join(TURN_FILE);
    let mut content = fs::read_to_string(&turn_path).unwrap();
    content.push_str(&turn_row("b1", "SPEAKER_00", "late", 0.0, 1.0));
    content.push('\n');
    fs::write(&turn_path, content).unwrap();
    assert!(matches!(
        TurnOffsetIndex::load(&path, &source),
        Err(SporcError::StaleIndex(_))
    ));

    // Opening the dataset ignores the stale file and the rebuild sees b1.
    let ds = Dataset::open_dir(dir.path(), false, DatasetOptions::default()).unwrap();
    let b1 = ds.episode("b1").unwrap();
    assert_eq!(ds.load_turns_for(&b1).unwrap()[0].text, "late");
}

#[test]
fn count_windows_over_loaded_turns() {
    let dir = corpus();
    let ds = Dataset::open_dir(
        dir.path(),
        false,
        DatasetOptions {
            index_policy: IndexPolicy::Eager,
            ..Default::default()
        },
    )
    .unwrap();
    let a1 = ds.episode("a1").unwrap();
    let windows: Vec<_> = ds.sliding_window(&a1, 10, 2).unwrap().collect();

    let ranges: Vec<(usize, usize)> = windows.iter().map(|w| (w.start_index, w.end_index)).collect();
    assert_eq!(ranges, vec![(0, 10), (8, 18), (16, 23)]);
    assert!(windows.iter().all(|w| w.total_windows == 3));
    assert!(windows[0].overlap_turns.is_empty());
    assert_eq!(windows[1].overlap_turns.len(), 2);
    assert_eq!(windows[2].new_turns.len(), 5);
}

#[test]
fn time_windows_cover_episode_duration() {
    let dir = corpus();
    let ds = Dataset::open_dir(dir.path(), false, DatasetOptions::default()).unwrap();
    let g1 = ds.episode("g1").unwrap();
    let windows: Vec<_> = ds.sliding_window_by_time(&g1, 300.0, 60.0).unwrap().collect();
    assert!(!windows.is_empty());

    // Every turn lands in at least one window and is never split.
    let turns = g1.turns().unwrap();
    for turn in turns {
        assert!(windows.iter().any(|w| w.turns.iter().any(|t| t == turn)));
    }
    assert!(matches!(
        ds.sliding_window_by_time(&g1, 60.0, 60.0),
        Err(SporcError::InvalidWindowParameters(_))
    ));
}
