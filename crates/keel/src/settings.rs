//! Reactor settings.
//!
//! Built once at startup (usually deserialized from a config file) and shared
//! read-only as `Arc<Settings>` by every worker.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::diff::FieldPath;
use crate::execution::Backoff;

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub batching: BatchingSettings,
    pub persistence: PersistenceSettings,
    pub execution: ExecutionSettings,
    pub diffing: DiffingSettings,
    pub posting: PostingSettings,
}

/// Per-lane queueing behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingSettings {
    /// How long to wait for newer notifications before processing the latest.
    #[serde(with = "seconds")]
    pub batch_window: Duration,
    /// An empty lane with no notifications for this long is torn down.
    #[serde(with = "seconds")]
    pub idle_timeout: Duration,
    /// How long shutdown waits for workers before aborting them.
    #[serde(with = "seconds")]
    pub exit_timeout: Duration,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(5 * 60),
            exit_timeout: Duration::from_secs(2),
        }
    }
}

/// Where and how progress is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Upper bound for any consistency wait, and the window applied after
    /// the reactor's own patch.
    #[serde(with = "seconds")]
    pub consistency_timeout: Duration,
    /// Finalizer that blocks deletion until deletion handlers are done.
    pub finalizer: String,
    /// Prefix for the reactor's own annotations.
    pub annotation_prefix: String,
    /// Status field holding handler progress for status-based stores.
    pub status_field: String,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            consistency_timeout: Duration::from_secs(5),
            finalizer: "keel.dev/finalizer".to_owned(),
            annotation_prefix: "keel.dev".to_owned(),
            status_field: "keel".to_owned(),
        }
    }
}

/// Defaults applied to handlers that declare nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub default_backoff: Backoff,
    #[serde(with = "optional_seconds")]
    pub default_timeout: Option<Duration>,
    pub default_retries: Option<u32>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_backoff: Backoff::default(),
            default_timeout: None,
            default_retries: None,
        }
    }
}

/// Change-detection rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffingSettings {
    /// Fields excluded from the essence, in addition to the built-in ones.
    pub ignored_fields: Vec<FieldPath>,
}

/// Posting of handler outcomes as events on the entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostingSettings {
    pub enabled: bool,
}

impl Default for PostingSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Durations as float seconds.
pub(crate) mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod optional_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
