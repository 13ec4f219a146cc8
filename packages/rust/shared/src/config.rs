//! Application configuration for refkb.
//!
//! User config lives at `~/.refkb/refkb.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RefKbError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "refkb.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".refkb";

// ---------------------------------------------------------------------------
// Config structs (matching refkb.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Remote knowledge-base service.
    #[serde(default)]
    pub knowledge_base: KnowledgeBaseConfig,

    /// Auxiliary metadata API and summaries.
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Build run tuning.
    #[serde(default)]
    pub build: BuildSection,

    /// Reference store location.
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// `[knowledge_base]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_kb_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Ceiling for 5xx exponential backoff.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Delay used when a 429 carries no usable `Retry-After`.
    #[serde(default = "default_retry_after")]
    pub default_retry_after_secs: u64,

    #[serde(default = "default_permission")]
    pub permission: String,

    #[serde(default = "default_indexing_technique")]
    pub indexing_technique: String,

    /// `automatic` or `custom`.
    #[serde(default = "default_process_mode")]
    pub process_mode: String,

    /// Segment separator for `custom` mode.
    #[serde(default = "default_separator")]
    pub separator: String,

    /// Segment size for `custom` mode.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_kb_timeout(),
            max_retries: default_max_retries(),
            max_backoff_secs: default_max_backoff(),
            default_retry_after_secs: default_retry_after(),
            permission: default_permission(),
            indexing_technique: default_indexing_technique(),
            process_mode: default_process_mode(),
            separator: default_separator(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.dify.ai".into()
}
fn default_api_key_env() -> String {
    "REFKB_API_KEY".into()
}
fn default_kb_timeout() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_backoff() -> u64 {
    30
}
fn default_retry_after() -> u64 {
    60
}
fn default_permission() -> String {
    "only_me".into()
}
fn default_indexing_technique() -> String {
    "high_quality".into()
}
fn default_process_mode() -> String {
    "automatic".into()
}
fn default_separator() -> String {
    "###".into()
}
fn default_max_tokens() -> u32 {
    500
}

/// `[enrichment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Base URL joined with a record's `source_id` when it has no `api_url`.
    #[serde(default)]
    pub api_base_url: Option<String>,

    #[serde(default = "default_enrichment_timeout")]
    pub timeout_secs: u64,

    /// Worker permits for the enrich and attachment stages.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            timeout_secs: default_enrichment_timeout(),
            concurrency: default_concurrency(),
            summary_max_chars: default_summary_max_chars(),
        }
    }
}

fn default_enrichment_timeout() -> u64 {
    30
}
fn default_concurrency() -> usize {
    4
}
fn default_summary_max_chars() -> usize {
    200
}

/// `[build]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between publish batches, in milliseconds.
    #[serde(default = "default_batch_pause")]
    pub batch_pause_ms: u64,

    /// Record count selected when neither id nor conditions are given.
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,

    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,

    #[serde(default = "default_ledger_path")]
    pub ledger_path: String,

    /// Dataset metadata fields created before publishing.
    #[serde(default = "default_metadata_fields")]
    pub metadata_fields: Vec<String>,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_pause_ms: default_batch_pause(),
            recent_limit: default_recent_limit(),
            scratch_dir: default_scratch_dir(),
            ledger_path: default_ledger_path(),
            metadata_fields: default_metadata_fields(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}
fn default_batch_pause() -> u64 {
    1000
}
fn default_recent_limit() -> usize {
    100
}
fn default_scratch_dir() -> String {
    "~/.refkb/scratch".into()
}
fn default_ledger_path() -> String {
    "~/.refkb/doc_id_store.json".into()
}
fn default_metadata_fields() -> Vec<String> {
    ["source_type", "source_id", "author", "published_time"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.refkb/references.db".into()
}

// ---------------------------------------------------------------------------
// Runtime configs (derived from AppConfig, overridable by CLI flags)
// ---------------------------------------------------------------------------

/// Runtime transport configuration for the knowledge-base service.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub max_backoff: Duration,
    pub default_retry_after: Duration,
}

impl From<&AppConfig> for TransportConfig {
    fn from(config: &AppConfig) -> Self {
        let kb = &config.knowledge_base;
        Self {
            base_url: kb.base_url.clone(),
            timeout: Duration::from_secs(kb.timeout_secs),
            max_retries: kb.max_retries,
            max_backoff: Duration::from_secs(kb.max_backoff_secs),
            default_retry_after: Duration::from_secs(kb.default_retry_after_secs),
        }
    }
}

/// Runtime build configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub permission: String,
    pub indexing_technique: String,
    pub process_mode: String,
    pub separator: String,
    pub max_tokens: u32,
    pub api_base_url: Option<String>,
    pub concurrency: usize,
    pub summary_max_chars: usize,
    pub batch_pause: Duration,
    pub recent_limit: usize,
    pub scratch_dir: PathBuf,
    pub metadata_fields: Vec<String>,
}

impl From<&AppConfig> for BuildConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            permission: config.knowledge_base.permission.clone(),
            indexing_technique: config.knowledge_base.indexing_technique.clone(),
            process_mode: config.knowledge_base.process_mode.clone(),
            separator: config.knowledge_base.separator.clone(),
            max_tokens: config.knowledge_base.max_tokens,
            api_base_url: config.enrichment.api_base_url.clone(),
            concurrency: config.enrichment.concurrency.max(1),
            summary_max_chars: config.enrichment.summary_max_chars,
            batch_pause: Duration::from_millis(config.build.batch_pause_ms),
            recent_limit: config.build.recent_limit,
            scratch_dir: expand_home(&config.build.scratch_dir),
            metadata_fields: config.build.metadata_fields.clone(),
        }
    }
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.refkb/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| RefKbError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.refkb/refkb.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| RefKbError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| RefKbError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RefKbError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| RefKbError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RefKbError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the knowledge-base API key from the env var named in config.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.knowledge_base.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(RefKbError::config(format!(
            "knowledge-base API key not found. Set the {var_name} environment variable."
        ))),
    }
}
