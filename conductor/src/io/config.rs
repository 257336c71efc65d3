//! Orchestrator configuration stored in `conductor.toml`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::envelope::ErrorKind;
use crate::core::validator::EnvelopeValidator;
use crate::invoke::InvokerSettings;
use crate::io::worker::{ProcessWorker, WorkerRegistry};

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "conductor.toml";

/// Orchestrator configuration (TOML).
///
/// Missing fields default to the values the invoker and scheduler use when
/// no file is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConductorConfig {
    pub invoker: InvokerConfig,
    pub contract: ContractConfig,
    pub scheduler: SchedulerConfig,
    pub process: ProcessConfig,
    /// Subprocess transport per worker id.
    pub workers: BTreeMap<String, WorkerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InvokerConfig {
    /// Per-attempt wall-clock limit in seconds.
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub backoff_base_ms: u64,
    /// Extra random delay as a fraction of the backoff (`0.0..=1.0`).
    pub jitter: f64,
    /// Worker error kinds that are retried.
    pub transient_errors: Vec<ErrorKind>,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            max_retries: 2,
            backoff_base_ms: 1000,
            jitter: 0.0,
            transient_errors: vec![ErrorKind::Timeout, ErrorKind::InternalError],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContractConfig {
    pub supported_major_versions: Vec<u64>,
}

impl Default for ContractConfig {
    fn default() -> Self {
        Self {
            supported_major_versions: vec![1],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of leaves invoked concurrently.
    pub pool_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { pool_size: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessConfig {
    /// Discard worker stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Program and arguments (e.g. `["python3", "workers/ticket.py"]`).
    pub command: Vec<String>,
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.invoker.timeout_secs == 0 {
            return Err(anyhow!("invoker.timeout_secs must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.invoker.jitter) {
            return Err(anyhow!("invoker.jitter must be between 0.0 and 1.0"));
        }
        if self.contract.supported_major_versions.is_empty() {
            return Err(anyhow!(
                "contract.supported_major_versions must not be empty"
            ));
        }
        if self.scheduler.pool_size == 0 {
            return Err(anyhow!("scheduler.pool_size must be > 0"));
        }
        if self.process.output_limit_bytes == 0 {
            return Err(anyhow!("process.output_limit_bytes must be > 0"));
        }
        for (id, worker) in &self.workers {
            if worker.command.is_empty() || worker.command[0].trim().is_empty() {
                return Err(anyhow!("workers.{id}.command must be a non-empty array"));
            }
        }
        Ok(())
    }

    pub fn invoker_settings(&self) -> InvokerSettings {
        InvokerSettings {
            timeout: Duration::from_secs(self.invoker.timeout_secs),
            max_retries: self.invoker.max_retries,
            backoff_base: Duration::from_millis(self.invoker.backoff_base_ms),
            jitter: self.invoker.jitter,
            transient: self
                .invoker
                .transient_errors
                .iter()
                .copied()
                .collect::<BTreeSet<_>>(),
        }
    }

    pub fn validator(&self) -> EnvelopeValidator {
        EnvelopeValidator::new(self.contract.supported_major_versions.iter().copied())
    }

    /// Registry with one [`ProcessWorker`] per configured worker.
    pub fn process_registry(&self) -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        for (id, worker) in &self.workers {
            registry.register(
                id.clone(),
                Arc::new(ProcessWorker::new(
                    worker.command.clone(),
                    self.process.output_limit_bytes,
                )),
            );
        }
        registry
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
