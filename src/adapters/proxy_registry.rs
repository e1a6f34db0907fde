//! Upstream proxy pool
//!
//! Pure in-memory bookkeeping: round-robin selection that skips failed
//! entries, idempotent failure marking and a full reset once every proxy
//! has failed. Selection happens under a single short-lived lock so
//! concurrent requesters never observe a torn cursor.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::Result;

/// One upstream HTTP proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Proxy {
    /// Parse a `host:port[:user:pass]` line
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut parts = line.splitn(4, ':');
        let host = parts.next()?.trim();
        let port = parts.next()?.trim().parse::<u16>().ok()?;
        if host.is_empty() {
            return None;
        }
        let username = parts.next().map(str::to_string).filter(|s| !s.is_empty());
        let password = parts.next().map(str::to_string).filter(|s| !s.is_empty());

        Some(Self {
            host: host.to_string(),
            port,
            username,
            password,
        })
    }

    /// Identity used for health bookkeeping and connection ids
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Credentials, only when both halves are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    /// `http://[user:pass@]host:port`
    pub fn url(&self) -> String {
        match self.credentials() {
            Some((u, p)) => format!("http://{}:{}@{}:{}", u, p, self.host, self.port),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

impl std::fmt::Display for Proxy {
    // Never print credentials
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyUsage {
    pub proxy: String,
    pub requests: u64,
    pub failures: u64,
    pub last_used: i64,
    pub failed: bool,
}

/// Registry health summary
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProxyStats {
    pub total: usize,
    pub active: usize,
    pub failed: usize,
    pub stats: Vec<ProxyUsage>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    proxies: Vec<Proxy>,
    cursor: usize,
    failed: HashSet<String>,
    usage: HashMap<String, ProxyUsage>,
}

impl RegistryInner {
    fn touch(&mut self, key: &str) {
        if let Some(usage) = self.usage.get_mut(key) {
            usage.requests += 1;
            usage.last_used = Utc::now().timestamp_millis();
        }
    }
}

#[derive(Debug, Default)]
pub struct ProxyRegistry {
    inner: Mutex<RegistryInner>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a proxy list file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let registry = Self::new();
        let count = registry.load(&text);
        info!("Proxy mode enabled with {} proxies", count);
        Ok(registry)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the pool with the entries of a flat list. Returns how many were loaded.
    /// Repeated `host:port` entries are kept once, first occurrence wins.
    pub fn load(&self, list: &str) -> usize {
        let mut seen = HashSet::new();
        let proxies: Vec<Proxy> = list
            .lines()
            .filter_map(Proxy::parse_line)
            .filter(|p| seen.insert(p.key()))
            .collect();

        let mut inner = self.lock();
        inner.usage = proxies
            .iter()
            .map(|p| {
                let key = p.key();
                let usage = ProxyUsage {
                    proxy: key.clone(),
                    ..Default::default()
                };
                (key, usage)
            })
            .collect();
        inner.failed.clear();
        inner.cursor = 0;
        inner.proxies = proxies;
        inner.proxies.len()
    }

    /// Next healthy proxy in round-robin order.
    ///
    /// When every entry is marked failed the failed set is cleared and the
    /// first proxy is returned.
    pub fn next(&self) -> Option<Proxy> {
        let mut inner = self.lock();
        let len = inner.proxies.len();
        if len == 0 {
            return None;
        }

        for _ in 0..len {
            let idx = inner.cursor;
            inner.cursor = (inner.cursor + 1) % len;
            let key = inner.proxies[idx].key();
            if !inner.failed.contains(&key) {
                inner.touch(&key);
                return Some(inner.proxies[idx].clone());
            }
        }

        warn!("All {} proxies failed, resetting", len);
        inner.failed.clear();
        for usage in inner.usage.values_mut() {
            usage.failed = false;
        }
        let first = inner.proxies[0].clone();
        inner.touch(&first.key());
        Some(first)
    }

    /// Exclude a proxy from selection. Idempotent.
    pub fn mark_failed(&self, proxy: &Proxy) {
        let key = proxy.key();
        let mut inner = self.lock();
        if !inner.usage.contains_key(&key) || !inner.failed.insert(key.clone()) {
            return;
        }
        if let Some(usage) = inner.usage.get_mut(&key) {
            usage.failures += 1;
            usage.failed = true;
        }
        warn!(
            "Marked proxy {} as failed. Total failed: {}",
            key,
            inner.failed.len()
        );
    }

    /// Clear every failure mark
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.failed.clear();
        for usage in inner.usage.values_mut() {
            usage.failed = false;
        }
    }

    pub fn proxies(&self) -> Vec<Proxy> {
        self.lock().proxies.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().proxies.is_empty()
    }

    pub fn stats(&self) -> ProxyStats {
        let inner = self.lock();
        let total = inner.proxies.len();
        let failed = inner.failed.len();
        let stats = inner
            .proxies
            .iter()
            .filter_map(|p| inner.usage.get(&p.key()).cloned())
            .collect();

        ProxyStats {
            total,
            active: total - failed,
            failed,
            stats,
        }
    }
}
