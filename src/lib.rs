//! Reader for the Structured Podcast Open Research Corpus (SPORC).
//!
//! Episode metadata is held in memory or streamed from the source. Speaker
//! turns are attached lazily, one episode at a time, through a byte-offset
//! index over the turn file.

pub mod config;
pub mod corpus;
pub mod dataset;
pub mod error;
pub mod index;
pub mod loader;
pub mod output;
pub mod query;
pub mod search;
pub mod source;
pub mod subset;
pub mod window;

pub use corpus::{Episode, Podcast, RecordStore, Turn, TurnState};
pub use dataset::{Dataset, DatasetOptions, IndexPolicy, IndexStatus, Mode};
pub use error::{LookupScope, Result, SporcError};
pub use index::{IndexEntry, TurnOffsetIndex};
pub use loader::{LazyTurnLoader, LoadSummary};
pub use query::{EpisodeQuery, PodcastFilter};
pub use search::{EpisodeHit, TextMatch, TurnFilters, TurnHit, TurnQuery};
pub use source::CorpusSource;
pub use subset::{Sampling, SubsetLoader, SubsetReport};
pub use window::{TurnWindow, WindowStatistics};
