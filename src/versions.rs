//! Human-readable version labels for containers.
//!
//! A label is either a product version read from inside the container
//! (`v2.1.0 (3f2a9c8d1b7e)`) or the image tag (`latest (3f2a9c8d1b7e)`),
//! always followed by the first 12 hex characters of the image digest.

use std::time::Duration;

use anyhow::Result;
use log::debug;
use regex::Regex;

use crate::config::VersionProbe;
use crate::runtime::{split_reference, ContainerRuntime};

pub fn short_digest(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    hex.chars().take(12).collect()
}

pub fn image_tag(image: &str) -> String {
    split_reference(image).1
}

pub fn format_label(image: &str, digest: &str, marker: Option<&str>) -> String {
    let short = if digest.is_empty() {
        "unknown".to_string()
    } else {
        short_digest(digest)
    };
    match marker {
        Some(version) => format!("v{} ({})", version, short),
        None => format!("{} ({})", image_tag(image), short),
    }
}

struct CompiledProbe {
    name_contains: String,
    path: String,
    pattern: Regex,
}

pub struct VersionProber {
    probes: Vec<CompiledProbe>,
    poll_delay: Duration,
}

impl VersionProber {
    pub fn new(probes: &[VersionProbe]) -> Result<Self> {
        let probes = probes
            .iter()
            .map(|p| {
                Ok(CompiledProbe {
                    name_contains: p.name_contains.to_lowercase(),
                    path: p.path.clone(),
                    pattern: Regex::new(&p.pattern)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            probes,
            poll_delay: Duration::from_secs(1),
        })
    }

    #[cfg(test)]
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    fn probe_for(&self, container: &str) -> Option<&CompiledProbe> {
        let name = container.to_lowercase();
        self.probes.iter().find(|p| name.contains(&p.name_contains))
    }

    /// Reads the product version of `container`, waiting up to `attempts`
    /// polls for the version file to appear.  `None` when the container is
    /// not part of a known product family or the version cannot be read.
    pub async fn read_marker(
        &self,
        runtime: &dyn ContainerRuntime,
        container: &str,
        attempts: usize,
    ) -> Option<String> {
        let probe = self.probe_for(container)?;

        for attempt in 1..=attempts.max(1) {
            match runtime.exec(container, &["test", "-f", probe.path.as_str()]).await {
                Ok(out) if out.exit_code == 0 => break,
                Ok(_) | Err(_) if attempt < attempts => tokio::time::sleep(self.poll_delay).await,
                _ => {}
            }
        }

        let output = match runtime.exec(container, &["cat", probe.path.as_str()]).await {
            Ok(out) if out.exit_code == 0 => out.stdout,
            Ok(out) => {
                debug!("Version file missing in {} (exit {})", container, out.exit_code);
                return None;
            }
            Err(e) => {
                debug!("Could not read version of {}: {}", container, e);
                return None;
            }
        };

        output
            .lines()
            .find_map(|line| probe.pattern.captures(line))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Label for a container that may or may not belong to a product family.
    pub async fn label(
        &self,
        runtime: &dyn ContainerRuntime,
        container: &str,
        image: &str,
        digest: &str,
        attempts: usize,
    ) -> String {
        let marker = self.read_marker(runtime, container, attempts).await;
        format_label(image, digest, marker.as_deref())
    }
}
