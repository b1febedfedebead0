//! Containers each host has opted out of monitoring and update notices.
//!
//! Stored as `{ "<hostId>": { "excluded": [..] } }`.  The set is a
//! `BTreeSet`, so the list on disk is always sorted.

use std::collections::{BTreeMap, BTreeSet};

use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::store::LockedStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostExclusions {
    #[serde(default)]
    pub excluded: BTreeSet<String>,
}

pub type ExclusionDocument = BTreeMap<String, HostExclusions>;

#[derive(Debug, Clone)]
pub struct ExclusionConfig {
    store: LockedStore,
    host_id: String,
}

impl ExclusionConfig {
    pub fn new(store: LockedStore, host_id: impl Into<String>) -> Self {
        Self {
            store,
            host_id: host_id.into(),
        }
    }

    pub async fn excluded(&self) -> BTreeSet<String> {
        let mut doc: ExclusionDocument = self.store.read().await;
        doc.remove(&self.host_id)
            .map(|h| h.excluded)
            .unwrap_or_default()
    }

    pub async fn is_monitored(&self, container: &str) -> bool {
        !self.excluded().await.contains(container)
    }

    /// Drops excluded names from `containers`, keeping order.
    pub async fn monitored(&self, containers: Vec<String>) -> Vec<String> {
        let excluded = self.excluded().await;
        containers
            .into_iter()
            .filter(|c| !excluded.contains(c))
            .collect()
    }

    /// Stop monitoring `container` on this host.
    pub async fn exclude(&self, container: &str) -> bool {
        let host = self.host_id.clone();
        let name = container.to_string();
        let saved = self
            .store
            .modify(move |doc: &mut ExclusionDocument| {
                doc.entry(host.clone()).or_default().excluded.insert(name.clone());
                true
            })
            .await;
        self.log_outcome(saved, "Excluded", container);
        saved
    }

    /// Resume monitoring `container` on this host.
    pub async fn include(&self, container: &str) -> bool {
        let host = self.host_id.clone();
        let name = container.to_string();
        let saved = self
            .store
            .modify(move |doc: &mut ExclusionDocument| {
                doc.entry(host.clone()).or_default().excluded.remove(&name);
                true
            })
            .await;
        self.log_outcome(saved, "Included", container);
        saved
    }

    fn log_outcome(&self, saved: bool, verb: &str, container: &str) {
        if saved {
            info!("{} {} on {}", verb, container, self.host_id);
        } else {
            error!("Failed to persist exclusion change for {}", container);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir, host: &str) -> ExclusionConfig {
        ExclusionConfig::new(LockedStore::new(dir.path().join("monitor_config.json")), host)
    }

    #[tokio::test]
    async fn exclusions_are_stored_sorted_per_host() {
        let dir = TempDir::new().unwrap();
        let alpha = config(&dir, "alpha");
        let beta = config(&dir, "beta");

        assert!(alpha.exclude("zeta").await);
        assert!(alpha.exclude("app").await);
        assert!(beta.exclude("db").await);

        let raw = std::fs::read_to_string(dir.path().join("monitor_config.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["alpha"]["excluded"], serde_json::json!(["app", "zeta"]));
        assert_eq!(json["beta"]["excluded"], serde_json::json!(["db"]));

        assert!(!alpha.is_monitored("app").await);
        assert!(alpha.is_monitored("db").await);
    }

    #[tokio::test]
    async fn including_the_last_container_keeps_an_empty_set() {
        let dir = TempDir::new().unwrap();
        let alpha = config(&dir, "alpha");
        alpha.exclude("app").await;
        alpha.include("app").await;

        let doc: ExclusionDocument = LockedStore::new(dir.path().join("monitor_config.json"))
            .read()
            .await;
        assert_eq!(doc["alpha"], HostExclusions::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_edits_from_two_handles_are_all_kept() {
        let dir = TempDir::new().unwrap();
        let first = config(&dir, "alpha");
        let second = config(&dir, "alpha");
        second.exclude("shared").await;

        let adds = async {
            for i in 0..10 {
                first.exclude(&format!("a{}", i)).await;
            }
        };
        let mixed = async {
            for i in 0..10 {
                second.exclude(&format!("b{}", i)).await;
            }
            second.include("shared").await;
        };
        tokio::join!(adds, mixed);

        let excluded = first.excluded().await;
        assert_eq!(excluded.len(), 20);
        assert!(!excluded.contains("shared"));
    }

    #[tokio::test]
    async fn monitored_filters_excluded_names() {
        let dir = TempDir::new().unwrap();
        let alpha = config(&dir, "alpha");
        alpha.exclude("b").await;
        let kept = alpha
            .monitored(vec!["a".into(), "b".into(), "c".into()])
            .await;
        assert_eq!(kept, vec!["a".to_string(), "c".to_string()]);
    }
}
