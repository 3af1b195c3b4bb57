//! Configuration management for the queue worker using the prefer crate.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::{CommandUploader, LogArchiver};
use crate::classify::{OutcomeClassifier, DEFAULT_FAULT_SIGNATURE};
use crate::command::CommandSpec;
use crate::executor::JobExecutor;
use crate::runner::ProcessRunner;
use crate::status::{CommandStatusSink, StatusReporter};

/// Name used for config discovery and the default data directory.
pub const APP_NAME: &str = "queue-worker";

/// Default queue to subscribe to.
pub const DEFAULT_QUEUE_NAME: &str = "jobs";

/// Default logs subdirectory name.
const LOGS_SUBDIR: &str = "logs";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {format} config '{path}': {message}")]
    Parse {
        path: PathBuf,
        format: &'static str,
        message: String,
    },

    #[error("Invalid fault signature '{signature}': {source}")]
    Signature {
        signature: String,
        #[source]
        source: regex::Error,
    },
}

/// Application settings.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Root for per-job log staging directories.
    pub logs_dir: PathBuf,
    /// Broker URL for the AMQP queue. Set via BROKER_URL env var or config.
    pub broker_url: Option<String>,
    /// Queue to subscribe to.
    pub queue_name: String,
    /// Jobs processed at once.
    pub concurrency: usize,
    /// Pattern in stderr that marks a run as failed despite a zero exit.
    pub fault_signature: String,
    /// Processor invoked once per job with the identity appended.
    pub process: CommandSpec,
    /// Kill the processor after this many seconds. None waits forever.
    pub process_timeout_secs: Option<u64>,
    /// Log uploader invoked with `identity dir namespace` appended.
    pub upload: CommandSpec,
    /// Status recorder invoked with `identity status` appended.
    pub status: CommandSpec,
}

impl Default for Settings {
    fn default() -> Self {
        // Falls back gracefully: local data dir -> home dir -> current dir
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME);

        Self {
            logs_dir: data_dir.join(LOGS_SUBDIR),
            data_dir,
            broker_url: None,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            concurrency: 1,
            fault_signature: DEFAULT_FAULT_SIGNATURE.to_string(),
            process: CommandSpec::shell_script("process_task.sh"),
            process_timeout_secs: None,
            upload: CommandSpec::shell_script("copy_to_s3.sh"),
            status: CommandSpec::shell_script("set_seismo_status.sh"),
        }
    }
}

impl Settings {
    /// Create settings with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            logs_dir: data_dir.join(LOGS_SUBDIR),
            data_dir,
            ..Default::default()
        }
    }

    pub fn process_timeout(&self) -> Option<Duration> {
        self.process_timeout_secs.map(Duration::from_secs)
    }

    /// Ensure all directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for (dir, label) in [(&self.data_dir, "data"), (&self.logs_dir, "logs")] {
            fs::create_dir_all(dir).map_err(|e| {
                std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create {} directory '{}': {}",
                        label,
                        dir.display(),
                        e
                    ),
                )
            })?;
        }
        Ok(())
    }

    /// Wire the job pipeline from these settings.
    pub fn build_executor(&self) -> Result<JobExecutor, ConfigError> {
        let classifier =
            OutcomeClassifier::new(&self.fault_signature).map_err(|source| {
                ConfigError::Signature {
                    signature: self.fault_signature.clone(),
                    source,
                }
            })?;

        let runner = ProcessRunner::new(self.process.clone()).with_timeout(self.process_timeout());
        let archiver = LogArchiver::new(
            &self.logs_dir,
            Arc::new(CommandUploader::new(self.upload.clone())),
        );
        let reporter =
            StatusReporter::new(Arc::new(CommandStatusSink::new(self.status.clone())));

        Ok(JobExecutor::new(runner, classifier, archiver, reporter))
    }

    /// Every external command the worker invokes, labelled.
    pub fn commands(&self) -> [(&'static str, &CommandSpec); 3] {
        [
            ("process", &self.process),
            ("upload", &self.upload),
            ("status", &self.status),
        ]
    }
}

/// Processor command plus its optional time limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(flatten)]
    pub command: CommandSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data directory path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Log staging directory (defaults to `<data_dir>/logs`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_dir: Option<String>,
    /// Worker queue broker URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_url: Option<String>,
    /// Queue name.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "queue")]
    pub queue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<CommandSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CommandSpec>,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration using prefer crate for discovery.
    /// Automatically discovers queue-worker config files in standard locations.
    pub async fn load() -> Self {
        // Use prefer for file discovery, then parse with serde
        match prefer::load(APP_NAME).await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => match Self::load_from_path(path).await {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!("{}; using defaults", e);
                        Self::default()
                    }
                },
                None => Self::default(),
            },
            // No config file found
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific file path.
    /// Supports JSON, TOML and YAML based on file extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let parse_error = |format: &'static str, message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            format,
            message,
        };

        let mut config: Config = match ext {
            "toml" => toml::from_str(&contents).map_err(|e| parse_error("TOML", e.to_string()))?,
            "yaml" | "yml" => {
                serde_yaml::from_str(&contents).map_err(|e| parse_error("YAML", e.to_string()))?
            }
            _ => serde_json::from_str(&contents).map_err(|e| parse_error("JSON", e.to_string()))?,
        };

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Get the base directory for resolving relative paths.
    /// Returns the config file's parent directory if available, otherwise None.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path that may be relative to the config file.
    /// - Absolute paths are returned as-is
    /// - Paths starting with ~ are expanded
    /// - Relative paths are resolved relative to `base_dir`
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Apply configuration to settings.
    /// `base_dir` is used to resolve relative paths (typically config file dir or CWD).
    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref data_dir) = self.data_dir {
            settings.data_dir = self.resolve_path(data_dir, base_dir);
            settings.logs_dir = settings.data_dir.join(LOGS_SUBDIR);
        }
        if let Some(ref logs_dir) = self.logs_dir {
            settings.logs_dir = self.resolve_path(logs_dir, base_dir);
        }
        if let Some(ref broker) = self.broker_url {
            settings.broker_url = Some(broker.clone());
        }
        if let Some(ref queue) = self.queue_name {
            settings.queue_name = queue.clone();
        }
        if let Some(concurrency) = self.concurrency {
            settings.concurrency = concurrency.max(1);
        }
        if let Some(ref signature) = self.fault_signature {
            settings.fault_signature = signature.clone();
        }
        if let Some(ref process) = self.process {
            settings.process = process.command.clone();
            settings.process_timeout_secs = process.timeout_secs;
        }
        if let Some(ref upload) = self.upload {
            settings.upload = upload.clone();
        }
        if let Some(ref status) = self.status {
            settings.status = status.clone();
        }
    }
}

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides auto-discovery).
    pub config_path: Option<PathBuf>,
    /// Use CWD for relative paths instead of config file directory.
    pub use_cwd: bool,
}

/// Apply environment overrides. `lookup` is `std::env::var` outside tests.
fn apply_env_overrides<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

    // BROKER_URL environment variable takes precedence over config
    if let Some(broker) = non_empty("BROKER_URL") {
        tracing::debug!("Using BROKER_URL from environment");
        settings.broker_url = Some(broker);
    }
    if let Some(queue) = non_empty("QUEUE_NAME") {
        tracing::debug!("Using QUEUE_NAME from environment: {}", queue);
        settings.queue_name = queue;
    }
}

/// Load settings with explicit options.
/// Returns (Settings, Config) tuple.
pub async fn load_settings_with_options(
    options: LoadOptions,
) -> Result<(Settings, Config), ConfigError> {
    // Priority 1: explicit --config flag. Priority 2: auto-discover via prefer.
    let config = match options.config_path {
        Some(ref path) => Config::load_from_path(path).await?,
        None => Config::load().await,
    };

    if let Some(ref path) = config.source_path {
        tracing::debug!("Loaded config from {}", path.display());
    }

    let mut settings = Settings::default();

    // Determine base directory for resolving relative paths
    let cwd = || std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let base_dir = if options.use_cwd {
        cwd()
    } else {
        config.base_dir().unwrap_or_else(cwd)
    };

    config.apply_to_settings(&mut settings, &base_dir);
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());

    Ok((settings, config))
}
