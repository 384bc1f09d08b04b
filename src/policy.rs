use crate::error::ConfigError;
use crate::rules::types::{policy_seconds, validate_rules, DiagnosticRule, RuleSpec};
use crate::telemetry::Channel;
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Plausible range for a numeric channel. Values outside it are rejected at decode.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub unit: Option<String>,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    sweep_interval_seconds: Option<u64>,
    #[serde(default)]
    stale_after_seconds: Option<u64>,
    #[serde(default)]
    offline_after_seconds: Option<u64>,
    #[serde(default)]
    window_capacity: Option<usize>,
    #[serde(default)]
    channels: HashMap<String, ChannelFile>,
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelFile {
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
}

/// Deployment policy: timing thresholds, channel sanity ranges and rules.
/// None of these carry built-in defaults.
#[derive(Debug, Clone)]
pub struct DiagnosticPolicy {
    pub sweep_interval: Duration,
    pub stale_after: ChronoDuration,
    pub offline_after: ChronoDuration,
    pub window_capacity: usize,
    pub channels: Arc<HashMap<Channel, ChannelSpec>>,
    pub rules: Arc<Vec<DiagnosticRule>>,
    pub digest: String,
}

impl DiagnosticPolicy {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_slice(&mut bytes)
    }

    pub fn from_slice(bytes: &mut [u8]) -> Result<Self, ConfigError> {
        let digest = format!("{:x}", Sha256::digest(&*bytes));
        let file: PolicyFile = simd_json::serde::from_slice(bytes)?;

        let sweep_interval_seconds = require(file.sweep_interval_seconds, "sweep_interval_seconds")?;
        let stale_after_seconds = require(file.stale_after_seconds, "stale_after_seconds")?;
        let offline_after_seconds = require(file.offline_after_seconds, "offline_after_seconds")?;
        let window_capacity = require(file.window_capacity, "window_capacity")?;

        let sweep_interval = timing(sweep_interval_seconds, "sweep_interval_seconds")?;
        let stale_after = timing(stale_after_seconds, "stale_after_seconds")?;
        let offline_after = timing(offline_after_seconds, "offline_after_seconds")?;
        if stale_after >= offline_after {
            return Err(ConfigError::Policy(
                "expected 0 < stale_after_seconds < offline_after_seconds".to_string(),
            ));
        }
        if window_capacity == 0 {
            return Err(ConfigError::Policy("window_capacity must be > 0".to_string()));
        }

        let channels = validate_channels(file.channels)?;
        let rules = validate_rules(file.rules, &channels).map_err(ConfigError::Policy)?;

        Ok(Self {
            sweep_interval: Duration::from_secs(sweep_interval_seconds),
            stale_after,
            offline_after,
            window_capacity,
            channels: Arc::new(channels),
            rules: Arc::new(rules),
            digest,
        })
    }

    /// Shortest non-zero clearing window across all rules.
    pub fn shortest_hysteresis(&self) -> Option<ChronoDuration> {
        self.rules
            .iter()
            .map(|rule| rule.hysteresis)
            .filter(|window| *window > ChronoDuration::zero())
            .min()
    }
}

/// Positive, bounded seconds field of the policy root.
fn timing(seconds: u64, key: &str) -> Result<ChronoDuration, ConfigError> {
    let seconds = i64::try_from(seconds)
        .map_err(|_| ConfigError::Policy(format!("{key} is out of range")))?;
    policy_seconds(seconds, 1, key).map_err(ConfigError::Policy)
}

fn require<T>(value: Option<T>, key: &str) -> Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::Policy(format!("{key} is required")))
}

fn validate_channels(
    raw: HashMap<String, ChannelFile>,
) -> Result<HashMap<Channel, ChannelSpec>, ConfigError> {
    let mut specs = HashMap::new();
    for (name, entry) in raw {
        let channel: Channel = name
            .parse()
            .map_err(|_| ConfigError::Policy(format!("unknown channel `{name}`")))?;
        if channel.is_boolean() {
            if entry.unit.is_some() || entry.min.is_some() || entry.max.is_some() {
                return Err(ConfigError::Policy(format!(
                    "{channel} is boolean and takes no unit or range"
                )));
            }
            continue;
        }
        let unit = entry
            .unit
            .map(|unit| unit.trim().to_string())
            .filter(|unit| !unit.is_empty())
            .ok_or_else(|| ConfigError::Policy(format!("{channel} requires a unit")))?;
        let (Some(min), Some(max)) = (entry.min, entry.max) else {
            return Err(ConfigError::Policy(format!(
                "{channel} requires min and max"
            )));
        };
        if !min.is_finite() || !max.is_finite() || min >= max {
            return Err(ConfigError::Policy(format!(
                "{channel} range must be finite with min < max"
            )));
        }
        specs.insert(
            channel,
            ChannelSpec {
                unit: Some(unit),
                min,
                max,
            },
        );
    }

    if let Some(missing) = Channel::ALL
        .into_iter()
        .find(|channel| !channel.is_boolean() && !specs.contains_key(channel))
    {
        return Err(ConfigError::Policy(format!(
            "{missing} has no sanity range configured"
        )));
    }

    Ok(specs)
}
