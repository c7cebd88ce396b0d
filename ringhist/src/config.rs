//! Collector configuration.
//!
//! [`CollectorConfig`] controls how often metrics are collected, how often
//! a write-back store is flushed and which counters and gauges are collected
//! for each metric group. The defaults match the conventional `jvm`, `core`
//! and `node` groups; a JSON file can override any of them.
//!
//! ```json
//! {
//!   "collect_period": 60,
//!   "sync_period": 0,
//!   "groups": [
//!     { "name": "jvm", "gauges": ["memory.heap.used"] }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default seconds between collection cycles (also the base step).
pub const DEFAULT_COLLECT_PERIOD: u64 = 60;

/// Configuration of the collection scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Seconds between collection cycles; also the base step of every
    /// series the scheduler creates.
    pub collect_period: u64,

    /// Seconds between write-back flushes; 0 persists every sample.
    pub sync_period: u64,

    /// Groups collected each cycle, in order.
    pub groups: Vec<GroupConfig>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            collect_period: DEFAULT_COLLECT_PERIOD,
            sync_period: 0,
            groups: vec![
                GroupConfig::new(
                    "jvm",
                    &[],
                    &["memory.heap.used", "os.processCpuLoad", "os.systemLoadAverage"],
                ),
                GroupConfig::new(
                    "core",
                    &["QUERY./select.requests", "UPDATE./update.requests"],
                    &["INDEX.sizeInBytes"],
                ),
                GroupConfig::new("node", &[], &["CONTAINER.fs.coreRoot.usableSpace"]),
            ],
        }
    }
}

impl CollectorConfig {
    /// Loads and validates a JSON config file. Missing fields take their
    /// default values.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Read`] if the file cannot be read
    /// - [`ConfigError::Parse`] if it is not valid JSON for this schema
    /// - [`ConfigError::Invalid`] if validation fails
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the collect period is zero, a group
    /// name is empty or repeated, a group has no metrics, or a group lists a
    /// metric twice.
    pub fn validate(&self) -> Result<()> {
        if self.collect_period == 0 {
            return Err(invalid("collect_period must be greater than zero"));
        }
        let mut names = HashSet::new();
        for group in &self.groups {
            if group.name.is_empty() {
                return Err(invalid("group name cannot be empty"));
            }
            if !names.insert(group.name.as_str()) {
                return Err(invalid(format!("duplicate group '{}'", group.name)));
            }
            if group.is_empty() {
                return Err(invalid(format!("group '{}' has no metrics", group.name)));
            }
            let mut metrics = HashSet::new();
            for metric in group.counters.iter().chain(&group.gauges) {
                if !metrics.insert(metric.as_str()) {
                    return Err(invalid(format!(
                        "group '{}' lists metric '{metric}' more than once",
                        group.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Collection period as a [`Duration`].
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.collect_period)
    }

    /// Returns the named group.
    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.name == name)
    }
}

/// Metrics collected for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Group name passed to the metric source.
    pub name: String,

    /// Monotonic counters, stored as per-second rates.
    #[serde(default)]
    pub counters: Vec<String>,

    /// Gauges, stored as levels.
    #[serde(default)]
    pub gauges: Vec<String>,
}

impl GroupConfig {
    /// Creates a group config.
    pub fn new(name: &str, counters: &[&str], gauges: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            counters: counters.iter().map(ToString::to_string).collect(),
            gauges: gauges.iter().map(ToString::to_string).collect(),
        }
    }

    /// Returns `true` if the group collects nothing.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.gauges.is_empty()
    }
}

fn invalid(reason: impl Into<String>) -> crate::error::HistoryError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
    .into()
}
