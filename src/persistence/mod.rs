//! Persistence of the tick windows across restarts

pub mod snapshot;

pub use snapshot::{MarketSnapshot, SnapshotDocument, SnapshotStore};
