//! Fleet membership shared through a locked JSON document.
//!
//! Each host owns exactly one record and is the only writer of it.  Records
//! are never removed: a host that stops heartbeating simply ages out of the
//! live set, and registering again after a restart overwrites its record.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::store::LockedStore;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostRecord {
    /// Unix seconds.
    pub last_heartbeat: f64,
    pub is_primary: bool,
    pub primary_host_id: String,
    pub workload_count: usize,
    pub version: String,
}

pub type RegistryDocument = BTreeMap<String, HostRecord>;

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// The registry as read at one instant.  Every routing decision is made
/// against one snapshot so that it is internally consistent.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    records: RegistryDocument,
    now: f64,
    timeout: Duration,
}

impl RegistrySnapshot {
    pub fn new(records: RegistryDocument, now: f64, timeout: Duration) -> Self {
        Self {
            records,
            now,
            timeout,
        }
    }

    pub fn is_live(&self, host: &str) -> bool {
        self.records
            .get(host)
            .map(|r| self.now - r.last_heartbeat < self.timeout.as_secs_f64())
            .unwrap_or(false)
    }

    /// Live hosts in lexicographic order.
    pub fn active_hosts(&self) -> Vec<String> {
        // BTreeMap iteration is already sorted by key.
        self.records
            .keys()
            .filter(|host| self.is_live(host))
            .cloned()
            .collect()
    }

    pub fn record(&self, host: &str) -> Option<&HostRecord> {
        self.records.get(host)
    }

    pub fn heartbeat_age(&self, host: &str) -> Option<Duration> {
        self.records
            .get(host)
            .map(|r| Duration::from_secs_f64((self.now - r.last_heartbeat).max(0.0)))
    }

    /// First live host that claims the primary role.
    pub fn claimed_primary(&self) -> Option<String> {
        self.active_hosts()
            .into_iter()
            .find(|h| self.records.get(h).map(|r| r.is_primary).unwrap_or(false))
    }

    /// The host responsible for address-free commands: the configured primary
    /// when it is live, else the smallest live id, else `local`.
    pub fn coordinator(&self, configured_primary: &str, local: &str) -> String {
        if !configured_primary.is_empty() && self.is_live(configured_primary) {
            return configured_primary.to_string();
        }
        self.active_hosts()
            .into_iter()
            .next()
            .unwrap_or_else(|| local.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct FleetRegistry {
    store: LockedStore,
    host_id: String,
    primary_host_id: String,
    timeout: Duration,
}

impl FleetRegistry {
    pub fn new(
        store: LockedStore,
        host_id: impl Into<String>,
        primary_host_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            host_id: host_id.into(),
            primary_host_id: primary_host_id.into(),
            timeout,
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    fn is_primary(&self) -> bool {
        self.host_id == self.primary_host_id
    }

    pub async fn register(&self, workload_count: usize) -> bool {
        self.register_at(unix_now(), workload_count).await
    }

    pub async fn register_at(&self, now: f64, workload_count: usize) -> bool {
        let record = HostRecord {
            last_heartbeat: now,
            is_primary: self.is_primary(),
            primary_host_id: self.primary_host_id.clone(),
            workload_count,
            version: VERSION.to_string(),
        };
        let host = self.host_id.clone();
        let saved = self
            .store
            .modify(move |doc: &mut RegistryDocument| {
                doc.insert(host.clone(), record.clone());
                true
            })
            .await;
        if saved {
            let role = if self.is_primary() { "primary" } else { "secondary" };
            info!(
                "Registered {} ({}) with {} monitored containers",
                self.host_id, role, workload_count
            );
        } else {
            error!("Failed to register {}", self.host_id);
        }
        saved
    }

    /// Refreshes this host's record.  A host that never registered is left
    /// absent.
    pub async fn heartbeat(&self, workload_count: usize) -> bool {
        self.heartbeat_at(unix_now(), workload_count).await
    }

    pub async fn heartbeat_at(&self, now: f64, workload_count: usize) -> bool {
        let host = self.host_id.clone();
        let is_primary = self.is_primary();
        let saved = self
            .store
            .modify(move |doc: &mut RegistryDocument| match doc.get_mut(&host) {
                Some(record) => {
                    record.last_heartbeat = now;
                    record.is_primary = is_primary;
                    record.workload_count = workload_count;
                    true
                }
                None => false,
            })
            .await;
        debug!("Heartbeat from {} (saved: {})", self.host_id, saved);
        saved
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.snapshot_at(unix_now()).await
    }

    pub async fn snapshot_at(&self, now: f64) -> RegistrySnapshot {
        let records: RegistryDocument = self.store.read().await;
        RegistrySnapshot::new(records, now, self.timeout)
    }
}
