pub mod models;
pub mod rows;
pub mod store;

pub use models::{Episode, Podcast, TimeRangeBehavior, Turn, TurnState, TurnStatistics};
pub use store::RecordStore;
