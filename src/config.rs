//! Dispatcher configuration from a JSON document.

use std::{fs, path::Path};

use serde::Deserialize;
use time::{macros::format_description, Time};
use tracing::debug;

/// A config document that failed validation. Fatal at startup.
#[derive(Debug, thiserror::Error)]
#[error("config field '{field}': {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Which runtime the worker slots execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRuntime {
    Granian,
    Robyn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Loopback port range the worker slots are spawned on.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn len(&self) -> usize {
        if self.from > self.to {
            return 0;
        }
        (self.to - self.from) as usize + 1
    }
}

mod default {
    use super::{LogLevel, PortRange};

    pub fn host() -> String {
        "0.0.0.0".to_string()
    }

    pub fn timeout_worker_response() -> u64 {
        5
    }

    pub fn timeout_pull_job() -> u64 {
        60
    }

    pub fn thread_workers() -> u32 {
        1
    }

    pub fn blocking_threads() -> u32 {
        1
    }

    pub fn worker_ports() -> PortRange {
        PortRange {
            from: 8100,
            to: 8199,
        }
    }

    pub fn reload_time() -> String {
        "03:00:00".to_string()
    }

    pub fn reload_periodicity_days() -> u32 {
        1
    }

    pub fn reload_repeat_minutes() -> u64 {
        5
    }

    pub fn reload_repeat_attempts() -> u64 {
        3
    }

    pub fn log_level() -> LogLevel {
        LogLevel::Info
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Worker runtime spawned into the slots.
    #[serde(rename = "type")]
    pub worker_runtime: WorkerRuntime,

    /// Public address of this node. Presence makes it a master.
    #[serde(default)]
    pub address: Option<String>,

    /// Local bind address.
    #[serde(default = "default::host")]
    pub host: String,
    pub port: u16,

    /// Per-request budget against a worker or remote node, in seconds.
    #[serde(default = "default::timeout_worker_response")]
    pub timeout_worker_response: u64,

    /// Queue poll interval, in seconds.
    #[serde(default = "default::timeout_pull_job")]
    pub timeout_pull_job: u64,

    #[serde(default = "default::thread_workers")]
    pub thread_workers: u32,
    pub processes_workers: u32,
    #[serde(default = "default::blocking_threads")]
    pub blocking_threads: u32,

    #[serde(default = "default::worker_ports")]
    pub worker_ports: PortRange,

    /// Daily wall-clock time a rolling reload fires, as HH:MM:SS.
    #[serde(default = "default::reload_time")]
    pub reload_time: String,
    #[serde(default = "default::reload_periodicity_days")]
    pub reload_periodicity_days: u32,
    #[serde(default = "default::reload_repeat_minutes")]
    pub reload_repeat_minutes: u64,
    #[serde(default = "default::reload_repeat_attempts")]
    pub reload_repeat_attempts: u64,

    /// Admission-gate ceiling across the whole process.
    pub max_concurrent_tile_requests: usize,

    #[serde(default = "default::log_level")]
    pub log_level: LogLevel,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let str = fs::read_to_string(path)
            .map_err(|e| ConfigError::new("document", format!("{}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&str)
            .map_err(|e| ConfigError::new("document", e.to_string()))?;

        config.validate()?;
        debug!("Loaded config:\n{config:#?}");
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_worker_response == 0 {
            return Err(ConfigError::new("timeout_worker_response", "must be >= 1"));
        }
        if self.timeout_pull_job == 0 {
            return Err(ConfigError::new("timeout_pull_job", "must be >= 1"));
        }
        if self.thread_workers == 0 {
            return Err(ConfigError::new("thread_workers", "must be >= 1"));
        }
        if self.processes_workers == 0 {
            return Err(ConfigError::new("processes_workers", "must be >= 1"));
        }
        if self.blocking_threads == 0 {
            return Err(ConfigError::new("blocking_threads", "must be >= 1"));
        }
        if self.worker_ports.len() < self.processes_workers as usize {
            return Err(ConfigError::new(
                "worker_ports",
                format!(
                    "range {}-{} holds fewer ports than processes_workers = {}",
                    self.worker_ports.from, self.worker_ports.to, self.processes_workers
                ),
            ));
        }
        if self.reload_periodicity_days == 0 {
            return Err(ConfigError::new("reload_periodicity_days", "must be >= 1"));
        }
        if self.reload_repeat_minutes == 0 {
            return Err(ConfigError::new("reload_repeat_minutes", "must be >= 1"));
        }
        if self.reload_repeat_attempts == 0 {
            return Err(ConfigError::new("reload_repeat_attempts", "must be >= 1"));
        }
        if self.max_concurrent_tile_requests == 0 {
            return Err(ConfigError::new("max_concurrent_tile_requests", "must be >= 1"));
        }
        self.parse_reload_time()?;
        if let Some(address) = &self.address {
            if !address.contains(':') {
                return Err(ConfigError::new("address", "expected HOST:PORT"));
            }
        }
        Ok(())
    }

    /// The validated HH:MM:SS reload time.
    pub fn parse_reload_time(&self) -> Result<Time, ConfigError> {
        Time::parse(
            &self.reload_time,
            format_description!("[hour]:[minute]:[second]"),
        )
        .map_err(|e| ConfigError::new("reload_time", e.to_string()))
    }

    /// Whether this node owns the public entry point and queue execution.
    pub fn is_master(&self) -> bool {
        self.address.is_some()
    }

    /// Whether an upstream `(host, port)` names this node itself.
    pub fn is_self_address(&self, host: &str, port: u16) -> bool {
        self.address.as_deref() == Some(format!("{host}:{port}").as_str())
    }
}
