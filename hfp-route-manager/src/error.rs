use std::time::Duration;
use thiserror::Error;

use hfp_route_core::RouteError;

/// Errors that can occur in the Bluetooth Route Manager
#[derive(Error, Debug)]
pub enum RouteManagerError {
    /// The background worker has exited, usually after `quit`
    #[error("Route worker has shut down")]
    WorkerDisconnected,

    /// The background worker thread could not be spawned
    #[error("Failed to start route worker: {0}")]
    WorkerStart(#[source] std::io::Error),

    /// The worker did not reach a queued query in time
    #[error("Route worker did not respond within {0:?}")]
    Timeout(Duration),

    /// Error from the route state machine
    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Result type for Route Manager operations
pub type Result<T> = std::result::Result<T, RouteManagerError>;
