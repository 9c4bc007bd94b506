//! HFP Route Core
//!
//! Decides which Bluetooth hands-free device carries call audio and sequences
//! the unreliable connect/disconnect handshake with the headset service.
//!
//! # Architecture
//!
//! ```text
//! device / audio events ──┐
//! connect / disconnect  ──┼─→ MessageQueue ─→ RouteStateMachine ─→ AudioTransport
//! retry / timeout timers ─┘                        │
//!                                                  ├─→ DeviceRegistry
//!                                                  └─→ RouteListener (category changes)
//! ```
//!
//! Everything runs on one logical thread. The machine does not own a thread of
//! its own; `hfp-route-manager` drives it from a background worker.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use hfp_route_core::prelude::*;
//!
//! let mut machine = RouteStateMachine::new(Box::new(headset), RouteConfig::default())?;
//! machine.set_listener(Box::new(|old: RouteCategory, new: RouteCategory| {
//!     println!("route {old} -> {new}");
//! }));
//!
//! machine.post(Message::NewDeviceConnected(DeviceAddress::new("00:11:22:33:44:55")))?;
//! machine.post(Message::ConnectRequest(None))?;
//! machine.run_pending();
//!
//! assert!(machine.state().is_connecting());
//! ```

// Core modules
pub mod model;
pub mod queue;
pub mod registry;
pub mod state_machine;
pub mod transport;

// Messages and notifications
pub mod listener;
pub mod message;

// Configuration
pub mod config;

// Error types
pub mod error;

// Logging infrastructure
pub mod logging;

// Fakes for tests
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{RouteConfig, TimeoutProvider};
pub use listener::{ChannelListener, RouteListener};
pub use message::{EnqueuedWork, Message};
pub use model::{
    DeviceAddress, RouteCategory, RouteChange, RouteState, AUDIO_OFF_STATE_NAME,
    CONNECTED_STATE_NAME_PREFIX, CONNECTING_STATE_NAME_PREFIX,
};
pub use queue::{MessageQueue, TimerToken};
pub use registry::DeviceRegistry;
pub use state_machine::RouteStateMachine;
pub use transport::AudioTransport;

pub use error::{Result, RouteError};

pub use logging::{init_logging, init_logging_from_env, init_silent, LoggingError, LoggingMode};

// ============================================================================
// Prelude
// ============================================================================

/// Commonly used types for convenient importing
pub mod prelude {
    pub use crate::config::{RouteConfig, TimeoutProvider};
    pub use crate::listener::RouteListener;
    pub use crate::message::Message;
    pub use crate::model::{DeviceAddress, RouteCategory, RouteChange, RouteState};
    pub use crate::state_machine::RouteStateMachine;
    pub use crate::transport::AudioTransport;
}
