//! # HFP Route Manager
//!
//! A sync-first facade that runs the hands-free call-audio route state machine
//! on a background worker thread.
//!
//! ## Overview
//!
//! The platform's headset service reports link-layer connections and audio
//! state changes from its own threads, while the call-audio orchestrator asks
//! for Bluetooth audio to be connected or dropped. This crate funnels all of
//! those calls into one ordered queue, so routing decisions never race.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hfp_route_manager::prelude::*;
//!
//! let manager = BluetoothRouteManager::with_config(Box::new(headset), RouteConfig::default())?;
//! manager.register_listener(|old: RouteCategory, new: RouteCategory| {
//!     println!("Bluetooth route {old} -> {new}");
//! })?;
//!
//! manager.on_device_connected("00:11:22:33:44:55")?;
//! manager.request_connect(None)?;
//! manager.on_audio_granted("00:11:22:33:44:55")?;
//!
//! assert_eq!(manager.current_state_name()?, "Connected:00:11:22:33:44:55");
//! manager.quit()?;
//! ```
//!
//! ## Architecture
//!
//! 1. **Ingestion**: every public call becomes a message on an unbounded channel
//! 2. **Worker**: a dedicated thread with a single-threaded tokio runtime feeds the
//!    messages into the state machine and sleeps until the next timer is due
//! 3. **Introspection**: queries ride the same queue as a run-enqueued marker, so
//!    they observe every earlier event

pub mod error;
pub mod iter;
pub mod manager;
pub mod worker;

// Re-export main types for convenience
pub use error::{Result, RouteManagerError};
pub use iter::RouteChangeIterator;
pub use manager::BluetoothRouteManager;

// Re-export commonly used types from the core
pub use hfp_route_core::{
    AudioTransport, DeviceAddress, RouteCategory, RouteChange, RouteConfig, RouteListener,
    RouteState,
};

/// Prelude module for convenient imports
///
/// ```rust
/// use hfp_route_manager::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AudioTransport, BluetoothRouteManager, DeviceAddress, Result, RouteCategory, RouteChange,
        RouteChangeIterator, RouteConfig, RouteListener, RouteManagerError, RouteState,
    };
}
