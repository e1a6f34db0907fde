//! Hybrid spread collection
//!
//! Streamed quotes for every market feed per-market windows and a cheap
//! candidate score; promising markets are promoted to per-second polling
//! for a bounded analysis period, then cool down.

pub mod candidate;
pub mod hybrid;
pub mod ingest;
pub mod scheduler;
pub mod stability;
pub mod stream_pool;
pub mod window;

pub use candidate::{candidate_score, CandidateBoard};
pub use hybrid::{CollectorStatus, HybridCollector};
pub use ingest::TickPipeline;
pub use scheduler::{AnalysisPhase, AnalysisScheduler, TickPlan};
pub use stability::{metrics, rank, select_source, AnalysisRecord, ScoreBreakdown, StabilityReport};
pub use stream_pool::{
    partition, ConnectionInfo, ConnectionState, ReconnectPolicy, StreamPool, DIRECT_CONNECTION,
};
pub use window::{IngestOutcome, MarketWindows, TickWindow, WindowStore};
