//! Window snapshots
//!
//! One JSON document keyed by symbol; each value holds the streamed and the
//! polled window. Older documents stored a single array per symbol; those
//! load as the streamed window with an empty polled one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::domain::Tick;
use crate::error::Result;

/// Both windows of one market
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    #[serde(default, alias = "ws")]
    pub streamed: Vec<Tick>,
    #[serde(default, alias = "http")]
    pub polled: Vec<Tick>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotEntry {
    Legacy(Vec<Tick>),
    Split(MarketSnapshot),
}

impl From<SnapshotEntry> for MarketSnapshot {
    fn from(entry: SnapshotEntry) -> Self {
        match entry {
            SnapshotEntry::Legacy(ticks) => MarketSnapshot {
                streamed: ticks,
                polled: Vec::new(),
            },
            SnapshotEntry::Split(snapshot) => snapshot,
        }
    }
}

/// Full persisted state, symbol -> windows
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SnapshotDocument {
    pub markets: BTreeMap<String, MarketSnapshot>,
}

impl<'de> Deserialize<'de> for SnapshotDocument {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = BTreeMap::<String, SnapshotEntry>::deserialize(deserializer)?;
        Ok(Self {
            markets: raw.into_iter().map(|(k, v)| (k, v.into())).collect(),
        })
    }
}

impl SnapshotDocument {
    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}

/// File-backed snapshot store
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. A missing file is a cold start, not an error.
    pub async fn load(&self) -> Result<Option<SnapshotDocument>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot at {}, cold start", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let document: SnapshotDocument = serde_json::from_str(&text)?;
        info!(
            "Loaded snapshot with {} markets from {}",
            document.len(),
            self.path.display()
        );
        Ok(Some(document))
    }

    /// Write the snapshot via a temp file and rename so readers never see a torn file.
    pub async fn save(&self, document: &SnapshotDocument) -> Result<()> {
        let json = serde_json::to_vec(document)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(
            "Saved snapshot with {} markets to {}",
            document.len(),
            self.path.display()
        );
        Ok(())
    }
}
