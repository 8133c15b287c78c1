use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use sporc::config::{self, SporcConfig};
use sporc::index::BuildState;
use sporc::output::{json as json_out, table};
use sporc::source::remote::RemoteClient;
use sporc::source::CorpusSource;
use sporc::window::window_statistics;
use sporc::{
    Dataset, DatasetOptions, EpisodeQuery, IndexPolicy, PodcastFilter, Sampling, SporcError, TextMatch, TurnFilters,
    TurnQuery,
};

#[derive(Parser)]
#[command(
    name = "sporc",
    version,
    about = "Reader for the Structured Podcast Open Research Corpus with lazy, indexed turn loading"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log progress (INFO level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the corpus JSONL files
    #[arg(long, global = true, env = "SPORC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Base URL of a remote mirror; files are streamed over HTTP
    #[arg(long, global = true, env = "SPORC_REMOTE_URL")]
    remote: Option<String>,

    /// Access token for the remote mirror (else SPORC_TOKEN, then config)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Read metadata lazily instead of loading it into memory
    #[arg(long, global = true)]
    streaming: bool,

    /// Use the sample files instead of the full corpus
    #[arg(long, global = true)]
    sample: bool,

    /// Turn index database (default: <data-dir>/.sporc/turn_index.db)
    #[arg(long, global = true, env = "SPORC_INDEX")]
    index_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show corpus and index summary
    Info,

    /// Manage the turn offset index
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Search episodes by metadata
    Search {
        #[command(flatten)]
        criteria: SearchArgs,

        /// Max results
        #[arg(long, short = 'n', default_value = "20")]
        limit: usize,
    },

    /// Search the text of speaker turns
    Grep {
        /// Query (FTS5 syntax for fts, a substring for exact, a pattern for regex)
        query: String,

        /// fts (ranked, needs `index text`), exact or regex
        #[arg(long, default_value = "fts")]
        mode: TextMatch,

        /// Podcast title (exact, case-insensitive)
        #[arg(long)]
        podcast: Option<String>,

        /// Episode key (mp3url)
        #[arg(long)]
        episode: Option<String>,

        /// Inferred speaker role (host, guest)
        #[arg(long)]
        role: Option<String>,

        /// Group matches by episode
        #[arg(long)]
        episodes: bool,

        /// Max results
        #[arg(long, short = 'n', default_value = "20")]
        limit: usize,

        /// Results to skip
        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Show a podcast and its episodes
    Podcast {
        /// Podcast title (exact, case-insensitive, or substring)
        name: String,
    },

    /// Load a filtered subset of podcasts in one pass over the corpus
    Subset {
        #[command(flatten)]
        filter: FilterArgs,

        /// Which matches to keep: all, first:N or random:N
        #[arg(long, default_value = "all")]
        sampling: Sampling,

        /// Seed for random:N sampling
        #[arg(long)]
        seed: Option<u64>,

        /// Also attach turns for every episode in the subset
        #[arg(long)]
        with_turns: bool,
    },

    /// Print an episode's speaker turns
    Turns {
        /// Episode key (mp3url)
        mp3url: String,

        /// Only turns by this speaker label
        #[arg(long)]
        speaker: Option<String>,

        /// Only turns with this inferred role (host, guest)
        #[arg(long, conflicts_with = "speaker")]
        role: Option<String>,
    },

    /// Slide a window over an episode's turns
    Windows {
        /// Episode key (mp3url)
        mp3url: String,

        /// Window size in turns
        #[arg(long, required_unless_present = "duration", conflicts_with = "duration")]
        size: Option<usize>,

        /// Turns shared by consecutive windows
        #[arg(long, default_value = "0")]
        overlap: usize,

        /// Window length in seconds
        #[arg(long)]
        duration: Option<f64>,

        /// Seconds shared by consecutive windows
        #[arg(long, default_value = "0")]
        overlap_duration: f64,

        /// Include window text in JSON output
        #[arg(long)]
        text: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Build (or rebuild) the turn offset index
    Build {
        /// Build on a worker thread and report progress
        #[arg(long)]
        background: bool,

        /// Rebuild even if a valid index exists
        #[arg(long)]
        force: bool,
    },
    /// Show index state
    Status,
    /// Build (or rebuild) the full-text index over turn text
    Text,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Create default config file at ~/.sporc/config.toml
    Init,
    /// Show current config (token redacted)
    Show,
}

#[derive(Args)]
struct SearchArgs {
    /// Podcast title (partial match)
    #[arg(long)]
    podcast: Option<String>,

    /// Category (partial match, repeatable)
    #[arg(long)]
    category: Vec<String>,

    /// Secondary category (partial match, repeatable)
    #[arg(long)]
    subcategory: Vec<String>,

    /// Predicted host name (repeatable)
    #[arg(long)]
    host: Vec<String>,

    /// Predicted guest name (repeatable)
    #[arg(long)]
    guest: Vec<String>,

    /// Language code (repeatable)
    #[arg(long)]
    language: Vec<String>,

    /// Minimum duration in seconds
    #[arg(long)]
    min_duration: Option<f64>,

    /// Maximum duration in seconds
    #[arg(long)]
    max_duration: Option<f64>,

    #[arg(long)]
    min_speakers: Option<usize>,

    #[arg(long)]
    max_speakers: Option<usize>,

    /// Explicit flag (true/false)
    #[arg(long)]
    explicit: Option<bool>,
}

impl From<SearchArgs> for EpisodeQuery {
    fn from(a: SearchArgs) -> Self {
        EpisodeQuery {
            podcast_name: a.podcast,
            categories: a.category,
            subcategories: a.subcategory,
            host_names: a.host,
            guest_names: a.guest,
            languages: a.language,
            min_duration: a.min_duration,
            max_duration: a.max_duration,
            min_speakers: a.min_speakers,
            max_speakers: a.max_speakers,
            explicit: a.explicit,
            ..Default::default()
        }
    }
}

#[derive(Args)]
struct FilterArgs {
    /// Category (partial match, repeatable)
    #[arg(long)]
    category: Vec<String>,

    /// Host name (repeatable)
    #[arg(long)]
    host: Vec<String>,

    #[arg(long)]
    min_episodes: Option<usize>,

    #[arg(long)]
    max_episodes: Option<usize>,

    /// Minimum total podcast duration in hours
    #[arg(long)]
    min_hours: Option<f64>,

    /// Maximum total podcast duration in hours
    #[arg(long)]
    max_hours: Option<f64>,

    #[arg(long)]
    language: Option<String>,

    #[arg(long)]
    explicit: Option<bool>,
}

impl From<FilterArgs> for PodcastFilter {
    fn from(a: FilterArgs) -> Self {
        PodcastFilter {
            categories: a.category,
            hosts: a.host,
            min_episodes: a.min_episodes,
            max_episodes: a.max_episodes,
            min_total_duration_hours: a.min_hours,
            max_total_duration_hours: a.max_hours,
            language: a.language,
            explicit: a.explicit,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let json_output = cli.json;
    let cfg = SporcConfig::load()?;

    let configured_policy = if cfg.index.build_async {
        IndexPolicy::Background
    } else {
        IndexPolicy::Lazy
    };
    let open = |streaming: bool, seed: Option<u64>, index_policy: IndexPolicy| -> Result<Dataset> {
        let source = open_source(&cli.data_dir, &cli.remote, cli.token.as_deref(), cli.sample, &cfg)?;
        let options = DatasetOptions {
            streaming: streaming || cli.streaming,
            index_policy,
            index_path: cli.index_path.clone().or_else(|| cfg.index.path.clone()),
            seed,
            ..Default::default()
        };
        Dataset::open(source, options).context("Failed to open corpus")
    };

    match cli.command {
        Commands::Info => {
            let ds = open(false, None, configured_policy)?;
            let files: Vec<String> = ds
                .source()
                .episode_files()
                .iter()
                .chain(ds.source().turn_files())
                .map(|f| f.describe())
                .collect();
            let local_bytes: u64 = ds
                .source()
                .episode_files()
                .iter()
                .chain(ds.source().turn_files())
                .filter_map(|f| f.local_path())
                .filter_map(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .sum();
            let episodes = optional_count(ds.len())?;
            let podcasts = optional_count(ds.podcast_count())?;
            let status = ds.index_status();

            if json_output {
                json_out::print_json(&serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "mode": ds.mode(),
                    "files": files,
                    "size_bytes": local_bytes,
                    "episodes": episodes,
                    "podcasts": podcasts,
                    "index": status,
                }))?;
            } else {
                let count = |n: Option<usize>| n.map_or("unknown (streaming)".to_string(), |n| n.to_string());
                println!("sporc v{}", env!("CARGO_PKG_VERSION"));
                println!("  Mode:        {}", ds.mode());
                for f in &files {
                    println!("  File:        {f}");
                }
                if local_bytes > 0 {
                    println!("  Size:        {}", format_bytes(local_bytes));
                }
                println!("  Episodes:    {}", count(episodes));
                println!("  Podcasts:    {}", count(podcasts));
                println!(
                    "  Turn index:  {}",
                    if status.index_built {
                        format!("{} episodes", status.episodes_indexed)
                    } else {
                        "not built".to_string()
                    }
                );
            }
        }

        Commands::Index { action } => match action {
            IndexAction::Build { background, force } => {
                let ds = open(true, None, IndexPolicy::Lazy)?;
                let index = if background && (force || !ds.index_status().index_built) {
                    ds.build_index_async()?;
                    while matches!(ds.index_status().build_state, Some(BuildState::Building)) {
                        if !json_output {
                            eprint!("\rIndexed {} episodes...", ds.index_status().episodes_indexed);
                        }
                        std::thread::sleep(Duration::from_millis(500));
                    }
                    if !json_output {
                        eprintln!();
                    }
                    ds.wait_for_index()?
                        .context("Background build did not attach an index")?
                } else {
                    ds.build_index(force)?
                };

                if json_output {
                    json_out::print_json(&serde_json::json!({
                        "episodes_indexed": index.len(),
                        "fragmented": index.fragmented_count(),
                        "malformed": index.malformed(),
                        "built_at": index.built_at(),
                        "index_path": ds.index_status().index_path,
                    }))?;
                } else {
                    println!(
                        "Indexed {} episode{} ({} fragmented, {} malformed lines)",
                        index.len(),
                        if index.len() == 1 { "" } else { "s" },
                        index.fragmented_count(),
                        index.malformed()
                    );
                    if let Some(path) = ds.index_status().index_path {
                        println!("Saved to {}", path.display());
                    }
                }
            }
            IndexAction::Status => {
                let status = open(true, None, IndexPolicy::Lazy)?.index_status();
                if json_output {
                    json_out::print_json(&status)?;
                } else {
                    table::print_index_status(&status);
                }
            }
            IndexAction::Text => {
                let summary = open(true, None, IndexPolicy::Lazy)?.build_text_index()?;
                if json_output {
                    json_out::print_json(&summary)?;
                } else {
                    println!(
                        "Indexed text of {} turns from {} episodes ({} undecodable lines)",
                        summary.turns, summary.records, summary.skipped_lines
                    );
                    println!("Saved to {}", summary.path.display());
                }
            }
        },

        Commands::Grep {
            query,
            mode,
            podcast,
            episode,
            role,
            episodes,
            limit,
            offset,
        } => {
            let ds = open(false, None, configured_policy)?;
            let query = TurnQuery {
                text: query,
                mode,
                filters: TurnFilters { podcast, episode, role },
                limit,
                offset,
            };
            if episodes {
                let hits = with_text_index_hint(ds.search_episodes_by_text(&query))?;
                if json_output {
                    json_out::print_json(&serde_json::json!({ "query": query, "episodes": hits }))?;
                } else {
                    table::print_episode_text_hits(&hits);
                }
            } else {
                let hits = with_text_index_hint(ds.search_turns(&query))?;
                if json_output {
                    json_out::print_json(&serde_json::json!({ "query": query, "turns": hits }))?;
                } else {
                    table::print_turn_hits(&hits);
                }
            }
        }

        Commands::Search { criteria, limit } => {
            let ds = open(false, None, configured_policy)?;
            let query = EpisodeQuery::from(criteria);
            let mut results = ds.search(&query)?;
            let total = results.len();
            results.truncate(limit);
            if json_output {
                json_out::print_json(&serde_json::json!({
                    "query": query,
                    "total": total,
                    "episodes": results,
                }))?;
            } else {
                table::print_episode_results(&results);
                if total > results.len() {
                    println!("({} more, raise --limit to see them)", total - results.len());
                }
            }
        }

        Commands::Podcast { name } => {
            let podcast = open(false, None, configured_policy)?.search_podcast(&name)?;
            if json_output {
                json_out::print_json(&*podcast)?;
            } else {
                table::print_podcast_detail(&podcast);
            }
        }

        Commands::Subset {
            filter,
            sampling,
            seed,
            with_turns,
        } => {
            // Subsets are drawn from a streaming pass.
            let mut ds = open(true, seed, configured_policy)?;
            let filter = PodcastFilter::from(filter);
            let report = ds.load_podcast_subset(&filter, sampling)?;
            let store = ds.store()?;
            let turns = if with_turns {
                Some(ds.load_turns_for_many(store.episodes())?)
            } else {
                None
            };

            if json_output {
                for podcast in store.podcasts() {
                    json_out::print_json_line(&serde_json::json!({
                        "title": podcast.title,
                        "episodes": podcast.episode_count(),
                        "hours": podcast.total_duration_hours(),
                        "category": podcast.primary_category(),
                    }))?;
                }
                json_out::print_json_line(&serde_json::json!({
                    "sampling": sampling.to_string(),
                    "report": report,
                    "turns": turns,
                }))?;
            } else {
                for podcast in store.podcasts() {
                    println!(
                        "  {} ({} episode{}, {})",
                        podcast.title,
                        podcast.episode_count(),
                        if podcast.episode_count() == 1 { "" } else { "s" },
                        table::format_duration(podcast.total_duration_seconds())
                    );
                }
                println!();
                table::print_subset_report(&report, store.podcast_count(), store.episode_count());
                if let Some(s) = turns {
                    println!(
                        "Turns: {} loaded ({} by offset, {} by scan), {} failed",
                        s.loaded, s.by_offset, s.by_scan, s.failed
                    );
                }
            }
        }

        Commands::Turns {
            mp3url,
            speaker,
            role,
        } => {
            let ds = open(false, None, configured_policy)?;
            let episode = ds.episode(&mp3url)?;
            let all = ds.load_turns_for(&episode)?;
            let turns = match (speaker.as_deref(), role.as_deref()) {
                (Some(s), _) => episode.turns_by_speaker(s)?,
                (_, Some(r)) => episode.turns_by_role(r)?,
                _ => all.iter().collect(),
            };

            if json_output {
                json_out::print_json(&serde_json::json!({
                    "mp3url": episode.mp3_url,
                    "title": episode.title,
                    "total": all.len(),
                    "turns": turns,
                }))?;
            } else {
                table::print_turns(&episode, &turns);
            }
        }

        Commands::Windows {
            mp3url,
            size,
            overlap,
            duration,
            overlap_duration,
            text,
        } => {
            let ds = open(false, None, configured_policy)?;
            let episode = ds.episode(&mp3url)?;
            let windows: Vec<_> = match (size, duration) {
                (Some(size), _) => ds.sliding_window(&episode, size, overlap)?.collect(),
                (None, Some(secs)) => ds
                    .sliding_window_by_time(&episode, secs, overlap_duration)?
                    .collect(),
                (None, None) => bail!("Pass --size or --duration"),
            };
            let stats = window_statistics(windows.iter().copied());

            if json_output {
                let rows: Vec<_> = windows
                    .iter()
                    .map(|w| {
                        let (start, end) = w.time_range();
                        serde_json::json!({
                            "window_index": w.window_index,
                            "start_index": w.start_index,
                            "end_index": w.end_index,
                            "start_time": start,
                            "end_time": end,
                            "overlap_turns": w.overlap_turns.len(),
                            "new_turns": w.new_turns.len(),
                            "speakers": w.speaker_distribution(),
                            "text": text.then(|| w.text(" ")),
                        })
                    })
                    .collect();
                json_out::print_json(&serde_json::json!({
                    "mp3url": episode.mp3_url,
                    "statistics": stats,
                    "windows": rows,
                }))?;
            } else {
                println!("Episode: {} ({})\n", episode.title, episode.mp3_url);
                table::print_windows(&windows, &stats);
            }
        }

        Commands::Config { action } => run_config(action, &cfg)?,
    }

    Ok(())
}

fn run_config(action: ConfigAction, cfg: &SporcConfig) -> Result<()> {
    match action {
        ConfigAction::Init => {
            if config::init_config()? {
                println!("Created {}", config::config_path()?.display());
            } else {
                println!("Config already exists: {}", config::config_path()?.display());
            }
        }
        ConfigAction::Show => {
            println!("# {}", config::config_path()?.display());
            println!("{}", cfg.display_redacted());
        }
    }
    Ok(())
}

/// CLI > config for every source setting; a remote URL wins over a directory.
fn open_source(
    data_dir: &Option<PathBuf>,
    remote: &Option<String>,
    token: Option<&str>,
    sample: bool,
    cfg: &SporcConfig,
) -> Result<CorpusSource> {
    let use_sample = sample || cfg.data.use_sample;
    let remote_url = remote
        .clone()
        .or_else(|| cfg.remote.as_ref().and_then(|r| r.base_url.clone()));

    let source = if let Some(url) = remote_url {
        let token = config::resolve_token(token, "SPORC_TOKEN", cfg.remote.as_ref())?;
        let client = RemoteClient::new(url, token)?;
        CorpusSource::remote(client, use_sample)
    } else {
        let dir = data_dir
            .clone()
            .or_else(|| cfg.data.dir.clone())
            .context("No corpus location: pass --data-dir or set [data] dir in ~/.sporc/config.toml")?;
        CorpusSource::local_dir(&dir, use_sample)
            .with_context(|| format!("Cannot open corpus in {}", dir.display()))?
    };
    Ok(source.with_known_total(cfg.data.known_total))
}

/// Point at the build command when a ranked search has no index to use.
fn with_text_index_hint<T>(result: sporc::Result<T>) -> Result<T> {
    match result {
        Err(SporcError::TextIndexMissing(path)) => bail!(
            "No turn text index at {}. Build it with `sporc index text`, or pass --mode exact",
            path.display()
        ),
        other => Ok(other?),
    }
}

/// Counts a streaming dataset cannot answer are reported as unknown.
fn optional_count(n: sporc::Result<usize>) -> Result<Option<usize>> {
    match n {
        Ok(n) => Ok(Some(n)),
        Err(SporcError::SizeUnknown) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
