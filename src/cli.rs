use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{Table, Tabled};

use crate::adapters::{HttpTransport, ProxyRegistry, VenueClient};
use crate::collector::{AnalysisRecord, HybridCollector};
use crate::config::AppConfig;
use crate::error::{Result, SpreadwatchError};

#[derive(Parser)]
#[command(name = "spreadwatch")]
#[command(version = "0.1.0")]
#[command(about = "Spread stability monitor for perpetual-futures markets", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config directory (default.toml and $SPREADWATCH_ENV.toml)
    #[arg(short, long, default_value = "config", env = "SPREADWATCH_CONFIG_DIR")]
    pub config: PathBuf,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the collector and query API (default)
    Serve,
    /// List the venue's perpetual markets
    Markets {
        #[arg(long)]
        json: bool,
    },
    /// Rank markets from a saved snapshot without connecting anywhere
    Rank {
        /// Snapshot file (defaults to the configured snapshot path)
        #[arg(short, long)]
        snapshot: Option<PathBuf>,
        /// Show only the top N markets
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
}

/// Output mode for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

/// Print a vec of Tabled + Serialize items in the chosen mode.
pub fn print_items<T: Tabled + Serialize>(items: &[T], mode: OutputMode) -> anyhow::Result<()> {
    match mode {
        OutputMode::Table => {
            if items.is_empty() {
                println!("(no results)");
            } else {
                let table = Table::new(items).to_string();
                println!("{table}");
            }
        }
        OutputMode::Json => {
            let json = serde_json::to_string_pretty(items)?;
            println!("{json}");
        }
    }
    Ok(())
}

#[derive(Debug, Serialize, Tabled)]
pub struct MarketRow {
    pub symbol: String,
}

#[derive(Debug, Serialize, Tabled)]
pub struct RankRow {
    pub rank: usize,
    pub symbol: String,
    pub score: String,
    pub source: String,
    pub points: usize,
    #[tabled(rename = "avg spread %")]
    pub avg_spread: String,
    #[tabled(rename = "zero %")]
    pub zero_freq: String,
    #[tabled(rename = "medium %")]
    pub medium_freq: String,
    #[tabled(rename = "high %")]
    pub high_freq: String,
}

impl RankRow {
    pub fn from_record(rank: usize, record: &AnalysisRecord) -> Self {
        let r = &record.report;
        Self {
            rank,
            symbol: r.symbol.clone(),
            score: format!("{:.1}", r.stability_score),
            source: record.data_source.to_string(),
            points: r.total_points,
            avg_spread: format!("{:.5}", r.avg_spread),
            zero_freq: format!("{:.1}", r.zero_spread_freq),
            medium_freq: format!("{:.1}", r.medium_spread_freq),
            high_freq: format!("{:.1}", r.high_spread_freq),
        }
    }
}

/// `spreadwatch markets`
pub async fn list_markets(config: &AppConfig, mode: OutputMode) -> Result<()> {
    let transport = Arc::new(HttpTransport::new()?);
    let venue = VenueClient::new(
        transport,
        &config.venue.rest_url,
        config.scheduler.request_timeout(),
    );
    let rows: Vec<MarketRow> = venue
        .fetch_markets(None)
        .await?
        .into_iter()
        .map(|symbol| MarketRow { symbol })
        .collect();
    print_items(&rows, mode)?;
    Ok(())
}

/// Ranked rows for a snapshot file
pub async fn rank_rows(config: &AppConfig, snapshot: &Path, limit: Option<usize>) -> Result<Vec<RankRow>> {
    let mut config = config.clone();
    config.snapshot.path = snapshot.to_path_buf();

    let collector = HybridCollector::new(
        config,
        Arc::new(HttpTransport::new()?),
        Arc::new(ProxyRegistry::new()),
    );
    if collector.restore_snapshot().await? == 0 {
        return Err(SpreadwatchError::Internal(format!(
            "no snapshot data in {}",
            snapshot.display()
        )));
    }

    Ok(collector
        .analysis_set()
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .enumerate()
        .map(|(i, record)| RankRow::from_record(i + 1, record))
        .collect())
}

/// `spreadwatch rank`
pub async fn rank_snapshot(
    config: &AppConfig,
    snapshot: Option<&Path>,
    limit: Option<usize>,
    mode: OutputMode,
) -> Result<()> {
    let path = snapshot.unwrap_or(config.snapshot.path.as_path());
    let rows = rank_rows(config, path, limit).await?;
    print_items(&rows, mode)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Tick, TickSource};
    use crate::persistence::{MarketSnapshot, SnapshotDocument, SnapshotStore};

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from(["spreadwatch", "rank", "--snapshot", "x.json", "--limit", "5"]);
        match cli.command {
            Some(Commands::Rank { snapshot, limit, json }) => {
                assert_eq!(snapshot, Some(PathBuf::from("x.json")));
                assert_eq!(limit, Some(5));
                assert!(!json);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::parse_from(["spreadwatch"]);
        assert!(cli.command.is_none());
    }

    #[tokio::test]
    async fn test_rank_rows_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.json");

        let ticks = |bid: f64, ask: f64| -> Vec<Tick> {
            (0..5)
                .map(|i| Tick::new("", bid, ask, i * 1_000, TickSource::Streamed).unwrap())
                .collect()
        };
        let mut doc = SnapshotDocument::default();
        doc.markets.insert(
            "WIDE".to_string(),
            MarketSnapshot {
                streamed: ticks(100.0, 101.0),
                polled: vec![],
            },
        );
        doc.markets.insert(
            "TIGHT".to_string(),
            MarketSnapshot {
                streamed: ticks(100.0, 100.0),
                polled: vec![],
            },
        );
        SnapshotStore::new(&path).save(&doc).await.unwrap();

        let rows = rank_rows(&AppConfig::default(), &path, None).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].symbol, "TIGHT");
        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[0].score, "100.0");
        assert_eq!(rows[1].symbol, "WIDE");

        let top = rank_rows(&AppConfig::default(), &path, Some(1)).await.unwrap();
        assert_eq!(top.len(), 1);
    }

    #[tokio::test]
    async fn test_rank_rows_missing_snapshot_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(rank_rows(&AppConfig::default(), &dir.path().join("none.json"), None)
            .await
            .is_err());
    }
}
