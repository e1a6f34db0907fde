pub mod adapters;
pub mod cli;
pub mod collector;
pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod services;

pub use collector::{AnalysisRecord, HybridCollector};
pub use config::AppConfig;
pub use error::{Result, SpreadwatchError};
pub use services::{MonitoringController, TrafficStats};
