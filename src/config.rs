use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Remote enumeration endpoint and the pacing rules used against it.
#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Per-resource record cap. Unset means no cap.
    #[serde(default)]
    pub max_records: Option<usize>,
    #[serde(default = "default_min_request_delay_ms")]
    pub min_request_delay_ms: u64,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_initial_cursor")]
    pub initial_cursor: String,
    /// Extra query parameters sent with every page request.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            page_size: default_page_size(),
            max_records: None,
            min_request_delay_ms: default_min_request_delay_ms(),
            backoff_ms: default_backoff_ms(),
            max_transient_retries: default_max_transient_retries(),
            timeout_secs: default_timeout_secs(),
            initial_cursor: default_initial_cursor(),
            query: BTreeMap::new(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080/records".to_string()
}
fn default_page_size() -> usize {
    100
}
fn default_min_request_delay_ms() -> u64 {
    500
}
fn default_backoff_ms() -> u64 {
    5000
}
fn default_max_transient_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_initial_cursor() -> String {
    "*".to_string()
}
fn default_user_agent() -> String {
    concat!("harvest-ledger/", env!("CARGO_PKG_VERSION")).to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HarvestConfig {
    #[serde(default = "default_job")]
    pub job: String,
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            job: default_job(),
            flush_every: default_flush_every(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_job() -> String {
    "catalog".to_string()
}
fn default_flush_every() -> usize {
    20
}
fn default_chunk_size() -> usize {
    500
}

/// Which record fields end up in a snapshot.
#[derive(Debug, Deserialize, Clone)]
pub struct SnapshotConfig {
    /// Scalar fields to keep. Empty keeps every field.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Fields holding lists of free-form terms, stored as vocabulary ids.
    #[serde(default = "default_tag_fields")]
    pub tag_fields: Vec<String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            tag_fields: default_tag_fields(),
        }
    }
}

fn default_tag_fields() -> Vec<String> {
    vec!["tags".to_string()]
}

/// Optional JSON file backends in place of the SQLite tables.
///
/// The files are only safe for a single `hl` process: writes are atomic
/// within one process, but two processes sharing a file can hand the same
/// term id to different strings. Run concurrent workers against SQLite.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub checkpoint_file: Option<PathBuf>,
    #[serde(default)]
    pub vocabulary_file: Option<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.fetch.page_size == 0 {
        anyhow::bail!("fetch.page_size must be >= 1");
    }
    if config.fetch.timeout_secs == 0 {
        anyhow::bail!("fetch.timeout_secs must be >= 1");
    }
    if config.fetch.max_records == Some(0) {
        anyhow::bail!("fetch.max_records must be >= 1 when set");
    }
    if !config.fetch.base_url.starts_with("http://")
        && !config.fetch.base_url.starts_with("https://")
    {
        anyhow::bail!(
            "fetch.base_url must be an http(s) URL, got '{}'",
            config.fetch.base_url
        );
    }
    if config.harvest.flush_every == 0 {
        anyhow::bail!("harvest.flush_every must be >= 1");
    }
    if config.harvest.chunk_size == 0 {
        anyhow::bail!("harvest.chunk_size must be >= 1");
    }
    if config.harvest.job.trim().is_empty() {
        anyhow::bail!("harvest.job must not be empty");
    }
    for tag in &config.snapshot.tag_fields {
        if !config.snapshot.fields.is_empty() && config.snapshot.fields.contains(tag) {
            anyhow::bail!(
                "snapshot field '{}' is listed both as a scalar field and a tag field",
                tag
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Config> {
        let config: Config = toml::from_str(s)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/hl.sqlite\"\n").unwrap();
        assert_eq!(config.fetch.page_size, 100);
        assert_eq!(config.fetch.initial_cursor, "*");
        assert_eq!(config.harvest.flush_every, 20);
        assert_eq!(config.harvest.chunk_size, 500);
        assert_eq!(config.snapshot.tag_fields, vec!["tags".to_string()]);
        assert!(config.storage.checkpoint_file.is_none());
    }

    #[test]
    fn test_zero_flush_every_rejected() {
        let err = parse("[db]\npath = \"x\"\n[harvest]\nflush_every = 0\n").unwrap_err();
        assert!(err.to_string().contains("flush_every"));
    }

    #[test]
    fn test_query_table_parsed() {
        let config = parse(
            "[db]\npath = \"x\"\n[fetch]\nbase_url = \"https://example.com/r\"\n[fetch.query]\njson = \"1\"\nlanguage = \"english\"\n",
        )
        .unwrap();
        assert_eq!(config.fetch.query.get("language").unwrap(), "english");
    }

    #[test]
    fn test_tag_field_overlap_rejected() {
        let err = parse(
            "[db]\npath = \"x\"\n[snapshot]\nfields = [\"name\", \"tags\"]\ntag_fields = [\"tags\"]\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("tags"));
    }
}
