use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for artsync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub s3: S3Config,

    #[serde(default)]
    pub gcs: GcsConfig,
}

// ====== Backend ======

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub entity: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,
}

// ====== HTTP transfers ======

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor_secs: f64,

    #[serde(default = "default_pool_size")]
    pub pool_max_idle_per_host: usize,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

// ====== Uploads ======

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_hash_workers")]
    pub hash_workers: usize,

    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    #[serde(default = "default_batch_time_ms")]
    pub prepare_batch_time_ms: u64,

    #[serde(default = "default_inter_event_ms")]
    pub prepare_inter_event_ms: u64,

    #[serde(default = "default_max_batch")]
    pub prepare_max_batch: usize,
}

// ====== Object stores ======

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub endpoint_url: Option<String>,

    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcsConfig {
    #[serde(default)]
    pub access_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            backend: BackendConfig::default(),
            http: HttpConfig::default(),
            upload: UploadConfig::default(),
            s3: S3Config::default(),
            gcs: GcsConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            entity: None,
            api_key: None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_factor_secs: default_backoff_factor(),
            pool_max_idle_per_host: default_pool_size(),
            timeout_secs: None,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            hash_workers: default_hash_workers(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            prepare_batch_time_ms: default_batch_time_ms(),
            prepare_inter_event_ms: default_inter_event_ms(),
            prepare_max_batch: default_max_batch(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("com", "artsync", "artsync") {
        dirs.cache_dir().join("artifacts")
    } else {
        PathBuf::from("~/.cache/artsync/artifacts")
    }
}

fn default_base_url() -> String {
    "https://api.wandb.ai".to_string()
}

fn default_max_retries() -> u32 {
    16
}

fn default_backoff_factor() -> f64 {
    1.0
}

fn default_pool_size() -> usize {
    64
}

fn default_hash_workers() -> usize {
    8
}

fn default_max_concurrent_uploads() -> usize {
    64
}

fn default_batch_time_ms() -> u64 {
    100
}

fn default_inter_event_ms() -> u64 {
    10
}

fn default_max_batch() -> usize {
    1000
}

impl Config {
    /// Load config from default location or create default if not found
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load config from `path`, writing the defaults there if it is missing
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(path, content)?;
            Ok(config)
        }
    }

    /// Environment variables take precedence over the file
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("ARTSYNC_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(key) = lookup("ARTSYNC_API_KEY") {
            self.backend.api_key = Some(key);
        }
        if let Some(url) = lookup("ARTSYNC_BASE_URL") {
            self.backend.base_url = url;
        }
        if let Some(endpoint) = lookup("AWS_S3_ENDPOINT_URL") {
            self.s3.endpoint_url = Some(endpoint);
        }
        if let Some(region) = lookup("AWS_REGION") {
            self.s3.region = Some(region);
        }
        if let Some(token) = lookup("GOOGLE_OAUTH_ACCESS_TOKEN") {
            self.gcs.access_token = Some(token);
        }
    }

    /// Get config file path
    pub fn config_path() -> PathBuf {
        if let Some(dirs) = directories::ProjectDirs::from("com", "artsync", "artsync") {
            dirs.config_dir().join("config.toml")
        } else {
            PathBuf::from("~/.artsync/config.toml")
        }
    }
}
