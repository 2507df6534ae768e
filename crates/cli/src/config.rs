use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use topograph_core::task::TaskOptions;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Retry policy applied to operation tasks built by workflows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_task_max_attempts")]
    pub task_max_attempts: u32,

    #[serde(default)]
    pub task_retry_interval_ms: u64,

    #[serde(default)]
    pub task_ignore_failure: bool,
}

fn default_task_max_attempts() -> u32 {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_max_attempts: default_task_max_attempts(),
            task_retry_interval_ms: 0,
            task_ignore_failure: false,
        }
    }
}

impl EngineConfig {
    pub fn task_defaults(&self) -> TaskOptions {
        TaskOptions {
            max_attempts: self.task_max_attempts.max(1),
            retry_interval: Duration::from_millis(self.task_retry_interval_ms),
            ignore_failure: self.task_ignore_failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Inline,
    ThreadPool,
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_kind")]
    pub kind: ExecutorKind,

    /// Thread pool size, and the process executor's concurrency limit
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_process_timeout_secs")]
    pub process_timeout_secs: u64,

    /// Worker binary; defaults to this executable
    #[serde(default)]
    pub worker_program: Option<PathBuf>,
}

fn default_executor_kind() -> ExecutorKind {
    ExecutorKind::ThreadPool
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_process_timeout_secs() -> u64 {
    300
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: default_executor_kind(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            process_timeout_secs: default_process_timeout_secs(),
            worker_program: None,
        }
    }
}

impl ExecutorConfig {
    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_model_file")]
    pub model_file: String,

    #[serde(default = "default_resource_dir")]
    pub resource_dir: String,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,
}

fn default_model_file() -> String {
    "model.redb".to_string()
}

fn default_resource_dir() -> String {
    "resources".to_string()
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            model_file: default_model_file(),
            resource_dir: default_resource_dir(),
            event_log_dir: default_event_log_dir(),
        }
    }
}

impl Config {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::debug!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the model store path
    pub fn model_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.model_file)
    }

    /// Get the resource store path
    pub fn resource_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.resource_dir)
    }

    /// Get the event log path
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let config = Config::load(&dir.path().join("absent.toml"), data_dir.clone()).unwrap();

        assert!(data_dir.is_dir());
        assert_eq!(config.executor.kind, ExecutorKind::ThreadPool);
        assert_eq!(config.model_path(), data_dir.join("model.redb"));
        assert_eq!(config.engine.task_defaults(), TaskOptions::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topograph.toml");
        std::fs::write(
            &path,
            r#"
[engine]
task_max_attempts = 3
task_retry_interval_ms = 250

[executor]
kind = "process"
process_timeout_secs = 10
"#,
        )
        .unwrap();

        let config = Config::load(&path, dir.path().to_path_buf()).unwrap();
        let defaults = config.engine.task_defaults();
        assert_eq!(defaults.max_attempts, 3);
        assert_eq!(defaults.retry_interval, Duration::from_millis(250));
        assert!(!defaults.ignore_failure);
        assert_eq!(config.executor.kind, ExecutorKind::Process);
        assert_eq!(config.executor.process_timeout(), Duration::from_secs(10));
        assert_eq!(config.executor.workers, 4);
        assert_eq!(config.storage.event_log_dir, "events");
    }
}
