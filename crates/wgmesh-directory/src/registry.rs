//! Directory registry

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use wgmesh_proto::CoordinatorInfo;

/// Eviction and freshness tuning
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Entries older than this are evicted by the sweeper
    pub ttl: Duration,
    /// Entries older than this are invisible to `candidates`
    pub query_freshness: Duration,
    /// Sweeper cadence
    pub sweep_interval: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            query_freshness: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct CoordinatorEntry {
    region: String,
    address: String,
    port: u16,
    current_load: u32,
    max_capacity: u32,
    last_heartbeat: DateTime<Utc>,
}

/// Registry of known coordinators, keyed by coordinator id.
///
/// Multiple entries per region are expected; `candidates` does the
/// region scoping.
#[derive(Clone)]
pub struct DirectoryRegistry {
    entries: Arc<RwLock<HashMap<String, CoordinatorEntry>>>,
    config: DirectoryConfig,
}

impl DirectoryRegistry {
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Insert or refresh an entry and stamp its heartbeat.
    /// Always succeeds for well-formed input.
    pub fn register(
        &self,
        coordinator_id: &str,
        region: &str,
        address: &str,
        port: u16,
        current_load: u32,
        max_capacity: u32,
    ) {
        let mut entries = self.entries.write().unwrap();
        let replaced = entries
            .insert(
                coordinator_id.to_string(),
                CoordinatorEntry {
                    region: region.to_string(),
                    address: address.to_string(),
                    port,
                    current_load,
                    max_capacity,
                    last_heartbeat: Utc::now(),
                },
            )
            .is_some();

        if !replaced {
            info!(
                coordinator_id = %coordinator_id,
                region = %region,
                address = %address,
                port = port,
                "Registered new coordinator"
            );
        }
    }

    /// Fresh, non-saturated coordinators for a region, least loaded
    /// first with a stable id tie-break.
    pub fn candidates(&self, region: &str) -> Vec<CoordinatorInfo> {
        let entries = self.entries.read().unwrap();
        let now = Utc::now();
        let freshness = chrono::TimeDelta::from_std(self.config.query_freshness)
            .unwrap_or(chrono::TimeDelta::zero());

        let mut matches: Vec<CoordinatorInfo> = entries
            .iter()
            .filter(|(_, entry)| entry.region == region)
            .filter(|(_, entry)| entry.current_load < entry.max_capacity)
            .filter(|(_, entry)| now - entry.last_heartbeat < freshness)
            .map(|(id, entry)| to_info(id, entry))
            .collect();

        matches.sort_by(|a, b| {
            a.current_load
                .cmp(&b.current_load)
                .then_with(|| a.coordinator_id.cmp(&b.coordinator_id))
        });

        matches
    }

    /// Administrative snapshot of every entry
    pub fn list_all(&self) -> Vec<CoordinatorInfo> {
        let entries = self.entries.read().unwrap();
        let mut all: Vec<CoordinatorInfo> = entries
            .iter()
            .map(|(id, entry)| to_info(id, entry))
            .collect();
        all.sort_by(|a, b| a.coordinator_id.cmp(&b.coordinator_id));
        all
    }

    /// Evict entries whose heartbeat is past the TTL; returns the count.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write().unwrap();
        let now = Utc::now();
        let ttl = chrono::TimeDelta::from_std(self.config.ttl).unwrap_or(chrono::TimeDelta::zero());

        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now - entry.last_heartbeat > ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(entry) = entries.remove(id) {
                warn!(
                    coordinator_id = %id,
                    region = %entry.region,
                    "Removed stale coordinator"
                );
            }
        }

        stale.len()
    }

    pub fn count(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Spawn the background sweeper; it exits when `shutdown` flips true.
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self.clone();
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep();
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn to_info(id: &str, entry: &CoordinatorEntry) -> CoordinatorInfo {
    CoordinatorInfo {
        coordinator_id: id.to_string(),
        region: entry.region.clone(),
        address: entry.address.clone(),
        port: entry.port,
        current_load: entry.current_load,
        max_capacity: entry.max_capacity,
        last_heartbeat: entry.last_heartbeat.timestamp(),
    }
}
