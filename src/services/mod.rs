pub mod api;
pub mod metrics;
pub mod session;

pub use api::{create_router, ApiState};
pub use metrics::{PipelineGauges, TrafficSnapshot, TrafficStats};
pub use session::{MonitoringController, MonitoringStatus, StartOutcome};
