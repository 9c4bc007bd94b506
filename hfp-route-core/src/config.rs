//! Configuration types for the hfp-route-core crate
//!
//! This module defines the timing and policy knobs of the route state
//! machine, and the [`TimeoutProvider`] seam through which the surrounding
//! platform supplies retry and pending-connection delays.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, RouteError};

/// Source of the delays used when arming timers
///
/// Queried every time a timer is armed, so an implementation backed by live
/// settings takes effect on the next attempt without restarting anything.
pub trait TimeoutProvider: Send {
    /// Delay before a failed connect command is retried
    fn retry_backoff(&self) -> Duration;

    /// How long a connection may stay pending before it is resolved
    fn pending_timeout(&self) -> Duration;
}

/// Configuration for the route state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Delay before retrying a rejected connect command
    /// Default: 1 second
    #[serde(rename = "retry_backoff_ms", with = "duration_ms")]
    pub retry_backoff: Duration,

    /// How long a `Connecting` state waits for audio before resolving
    /// Default: 5 seconds
    #[serde(rename = "pending_timeout_ms", with = "duration_ms")]
    pub pending_timeout: Duration,

    /// Retries allowed per connection attempt
    /// Default: 1
    pub max_connect_retries: u32,

    /// Poll interval for checking that a connected device still carries audio
    /// Default: disabled
    #[serde(rename = "reconcile_interval_ms", with = "optional_duration_ms")]
    pub reconcile_interval: Option<Duration>,

    /// Prefer the most recently used device over the most recently connected one on fallback
    /// Default: false
    pub prefer_recently_used: bool,

    /// How long synchronous introspection waits for queued work to drain
    /// Default: 1 second
    #[serde(rename = "sync_timeout_ms", with = "duration_ms")]
    pub sync_timeout: Duration,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_millis(1000),
            pending_timeout: Duration::from_millis(5000),
            max_connect_retries: 1,
            reconcile_interval: None,
            prefer_recently_used: false,
            sync_timeout: Duration::from_millis(1000),
        }
    }
}

impl RouteConfig {
    /// Create a new RouteConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RouteConfig with immediate retries, for deterministic tests
    pub fn immediate_retry() -> Self {
        Self {
            retry_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Create a RouteConfig that double-checks connected devices every few seconds
    pub fn reconciling() -> Self {
        Self {
            reconcile_interval: Some(Duration::from_secs(5)),
            ..Default::default()
        }
    }

    /// Parse a configuration from JSON, filling missing fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RouteConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        if self.pending_timeout == Duration::ZERO {
            return Err(RouteError::Configuration(
                "Pending timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_connect_retries > 1 {
            return Err(RouteError::Configuration(format!(
                "At most one connect retry is supported, got {}",
                self.max_connect_retries
            )));
        }

        if self.reconcile_interval == Some(Duration::ZERO) {
            return Err(RouteError::Configuration(
                "Reconcile interval must be greater than 0 when enabled".to_string(),
            ));
        }

        if self.sync_timeout == Duration::ZERO {
            return Err(RouteError::Configuration(
                "Sync timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    pub fn with_max_connect_retries(mut self, retries: u32) -> Self {
        self.max_connect_retries = retries;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Option<Duration>) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_recently_used_preference(mut self, enabled: bool) -> Self {
        self.prefer_recently_used = enabled;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }
}

impl TimeoutProvider for RouteConfig {
    fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    fn pending_timeout(&self) -> Duration {
        self.pending_timeout
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Whole milliseconds, saturating at `u64::MAX`
    pub(super) fn millis(value: &Duration) -> u64 {
        u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(millis(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod optional_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&super::duration_ms::millis(duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
