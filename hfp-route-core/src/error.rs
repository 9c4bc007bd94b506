//! Error types for the hfp-route-core crate.
//!
//! Routing itself never fails: transport failures are retried, fall back to
//! another device or settle in `AudioOff`. These errors only cover
//! configuration and lifecycle misuse.

/// Errors that can occur while configuring or driving the route state machine.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// A configuration file could not be read
    #[error("Failed to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// An empty or otherwise unusable device address was supplied
    #[error("Invalid device address: {0:?}")]
    InvalidAddress(String),

    /// The state machine has quit and no longer accepts messages
    #[error("Route state machine has quit")]
    Quit,
}

/// Convenience type alias for Results using RouteError.
pub type Result<T> = std::result::Result<T, RouteError>;
