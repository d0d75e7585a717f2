//! Host configuration.

use std::env;
use std::fs;
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::ConfigError;

/// Which waiting requests take free batch slots first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// First submitted, first admitted.
    #[default]
    Fifo,
    /// Shortest input first, ties broken by submission order.
    ShortestInputFirst,
}

/// What happens to in-flight work when the host shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Keep ticking until every accepted request has resolved.
    #[default]
    Drain,
    /// Resolve every accepted request as cancelled.
    Cancel,
}

impl FromStr for AdmissionPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "shortest" | "shortest_input_first" => Ok(Self::ShortestInputFirst),
            _ => Err(()),
        }
    }
}

impl FromStr for ShutdownPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "cancel" => Ok(Self::Cancel),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Upper bound on requests evaluated in one tick.
    pub max_batch_size: usize,
    /// Generated tokens after which a request is truncated.
    pub max_output_length: usize,
    pub admission: AdmissionPolicy,
    pub shutdown: ShutdownPolicy,
    /// Pause after waking from idle, so requests arriving together share
    /// their first tick.
    #[serde(rename = "batch_window_ms", with = "millis")]
    pub batch_window: Duration,
    /// How long an idle scheduler waits for a submission before it
    /// re-checks whether it should stop.
    #[serde(rename = "idle_poll_ms", with = "millis")]
    pub idle_poll: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 16,
            max_output_length: 64,
            admission: AdmissionPolicy::Fifo,
            shutdown: ShutdownPolicy::Drain,
            batch_window: Duration::ZERO,
            idle_poll: Duration::from_millis(100),
        }
    }
}

impl HostConfig {
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_max_output_length(mut self, max_output_length: usize) -> Self {
        self.max_output_length = max_output_length;
        self
    }

    pub fn with_admission(mut self, admission: AdmissionPolicy) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownPolicy) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_batch_window(mut self, batch_window: Duration) -> Self {
        self.batch_window = batch_window;
        self
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.max_output_length == 0 {
            return Err(ConfigError::ZeroOutputLength);
        }
        Ok(())
    }

    /// Defaults overridden by `TEPPAN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the YAML file named by `TEPPAN_CONFIG`, if set, and applies
    /// the `TEPPAN_*` overrides on top of it.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| env::var(key).ok())
    }

    /// Parses a YAML document. Missing fields keep their defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_yaml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn load_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let base = match lookup("TEPPAN_CONFIG") {
            None => Self::default(),
            Some(path) => {
                let text = fs::read_to_string(&path)
                    .map_err(|err| ConfigError::Io { path: path.clone(), message: err.to_string() })?;
                Self::from_yaml_str(&text)?
            }
        };
        base.with_overrides(&lookup)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        Self::default().with_overrides(&lookup)
    }

    fn with_overrides<F>(mut self, lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(v) = parse_var(lookup, "TEPPAN_MAX_BATCH_SIZE")? { self.max_batch_size = v; }
        if let Some(v) = parse_var(lookup, "TEPPAN_MAX_OUTPUT_LENGTH")? { self.max_output_length = v; }
        if let Some(v) = parse_var(lookup, "TEPPAN_BATCH_WINDOW_MS")? { self.batch_window = Duration::from_millis(v); }
        if let Some(v) = parse_var(lookup, "TEPPAN_IDLE_POLL_MS")? { self.idle_poll = Duration::from_millis(v); }
        if let Some(v) = parse_var(lookup, "TEPPAN_SHUTDOWN")? { self.shutdown = v; }
        if let Some(v) = parse_var(lookup, "TEPPAN_ADMISSION")? { self.admission = v; }
        self.validate()?;
        Ok(self)
    }
}

/// Durations as whole milliseconds, matching the `*_MS` variables.
mod millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&'static str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(ConfigError::InvalidEnv { key, value }),
        },
    }
}
