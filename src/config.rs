use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Reads a product version from inside a container whose name contains
/// `name_contains` (case-insensitive).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct VersionProbe {
    pub name_contains: String,
    pub path: String,
    /// Regex whose first capture group is the version.
    pub pattern: String,
}

/// Environment values such as a numeric chat id arrive typed; identities are
/// always kept as strings.
fn lossy_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Uint(u64),
        Float(f64),
        Bool(bool),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(i) => i.to_string(),
        Raw::Uint(u) => u.to_string(),
        Raw::Float(f) => f.to_string(),
        Raw::Bool(b) => b.to_string(),
    })
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(deserialize_with = "lossy_string")]
    pub host_id: String,
    /// Intended leader.  Empty means none is configured.
    #[serde(deserialize_with = "lossy_string")]
    pub primary_host_id: String,
    #[serde(deserialize_with = "lossy_string")]
    pub chat_id: String,
    #[serde(default, skip_serializing, deserialize_with = "lossy_string")]
    pub bot_token: String,
    pub api_base: String,
    pub data_dir: PathBuf,
    pub heartbeat_interval_secs: u64,
    pub lock_timeout_ms: u64,
    pub watcher_container: String,
    pub ignored_containers: Vec<String>,
    pub version_probes: Vec<VersionProbe>,
    pub update_settle_secs: u64,
    pub stop_timeout_secs: u64,
    pub pull_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub running_wait_secs: u64,
    pub pending_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_id: String::new(),
            primary_host_id: String::new(),
            chat_id: String::new(),
            bot_token: String::new(),
            api_base: "https://api.telegram.org".into(),
            data_dir: "/data".into(),
            heartbeat_interval_secs: 30,
            lock_timeout_ms: 5000,
            watcher_container: "watchtower".into(),
            ignored_containers: vec!["watchtower".into(), "watchtower-notifier".into()],
            version_probes: vec![VersionProbe {
                name_contains: "danmu".into(),
                path: "/app/danmu_api/configs/globals.js".into(),
                pattern: r#"VERSION:\s*['"]([^'"]+)['"]"#.into(),
            }],
            update_settle_secs: 5,
            stop_timeout_secs: 30,
            pull_timeout_secs: 300,
            run_timeout_secs: 60,
            running_wait_secs: 60,
            pending_ttl_secs: 900,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("fleetwarden.toml"))
            .merge(Json::file("fleetwarden.json"))
            .merge(Env::prefixed("FLEETWARDEN_"));
        Self::from_figment(figment)
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("FLEETWARDEN_BOT_TOKEN_FILE") {
            config.bot_token = std::fs::read_to_string(secret_file)?.trim().to_string();
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let missing: Vec<&str> = [
            ("host_id", &self.host_id),
            ("chat_id", &self.chat_id),
            ("bot_token", &self.bot_token),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(key, _)| key)
        .collect();
        if !missing.is_empty() {
            anyhow::bail!("Missing required settings: {}", missing.join(", "));
        }
        Ok(())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("server_registry.json")
    }

    pub fn exclusions_path(&self) -> PathBuf {
        self.data_dir.join("monitor_config.json")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// A host is live while its last heartbeat is younger than this.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval() * 3
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn is_primary(&self) -> bool {
        self.host_id == self.primary_host_id
    }
}
