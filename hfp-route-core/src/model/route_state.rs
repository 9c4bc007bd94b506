//! Routing state and its externally visible category

use serde::{Deserialize, Serialize};
use std::fmt;

use super::DeviceAddress;

/// State name reported while no device carries call audio
pub const AUDIO_OFF_STATE_NAME: &str = "AudioOff";
/// Prefix of the state name while a connection attempt is pending
pub const CONNECTING_STATE_NAME_PREFIX: &str = "Connecting";
/// Prefix of the state name while a device carries call audio
pub const CONNECTED_STATE_NAME_PREFIX: &str = "Connected";

/// Where call audio is currently routed
///
/// The device address travels with the variant, so a state can never claim
/// to be connecting without also naming the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteState {
    /// No device carries audio and no attempt is pending
    #[default]
    AudioOff,
    /// A connect command was issued to this device and audio has not arrived yet
    Connecting(DeviceAddress),
    /// This device carries call audio
    Connected(DeviceAddress),
}

impl RouteState {
    /// The device this state is bound to, if any
    pub fn device(&self) -> Option<&DeviceAddress> {
        match self {
            RouteState::AudioOff => None,
            RouteState::Connecting(device) | RouteState::Connected(device) => Some(device),
        }
    }

    pub fn is_audio_off(&self) -> bool {
        matches!(self, RouteState::AudioOff)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, RouteState::Connecting(_))
    }

    /// Diagnostic name: `AudioOff`, `Connecting:<addr>` or `Connected:<addr>`
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Project the state onto the coarse category reported to listeners
    ///
    /// `AudioOff` splits into two categories depending on whether any device
    /// is link-layer connected at all.
    pub fn category(&self, connected_devices: usize) -> RouteCategory {
        match self {
            RouteState::AudioOff if connected_devices == 0 => RouteCategory::Disconnected,
            RouteState::AudioOff => RouteCategory::DeviceConnected,
            RouteState::Connecting(_) => RouteCategory::AudioPending,
            RouteState::Connected(_) => RouteCategory::AudioConnected,
        }
    }
}

impl fmt::Display for RouteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteState::AudioOff => write!(f, "{}", AUDIO_OFF_STATE_NAME),
            RouteState::Connecting(device) => {
                write!(f, "{}:{}", CONNECTING_STATE_NAME_PREFIX, device)
            }
            RouteState::Connected(device) => {
                write!(f, "{}:{}", CONNECTED_STATE_NAME_PREFIX, device)
            }
        }
    }
}

/// The four-valued projection of [`RouteState`] seen by listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteCategory {
    /// No hands-free device is connected
    Disconnected,
    /// At least one device is connected but none carries audio
    DeviceConnected,
    /// A connection attempt is pending
    AudioPending,
    /// A device carries call audio
    AudioConnected,
}

impl fmt::Display for RouteCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteCategory::Disconnected => "Disconnected",
            RouteCategory::DeviceConnected => "DeviceConnected",
            RouteCategory::AudioPending => "AudioPending",
            RouteCategory::AudioConnected => "AudioConnected",
        };
        f.write_str(name)
    }
}

/// A single listener notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteChange {
    pub old: RouteCategory,
    pub new: RouteCategory,
}

impl RouteChange {
    pub fn new(old: RouteCategory, new: RouteCategory) -> Self {
        Self { old, new }
    }
}
