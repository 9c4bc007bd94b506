//! Boundary to the platform's hands-free audio service
//!
//! The state machine never talks to hardware directly. Every command and
//! status query goes through an [`AudioTransport`], which the platform
//! binding implements on top of its headset profile proxy.

use crate::model::DeviceAddress;

/// Commands and queries offered by the hands-free audio service
///
/// All calls are non-blocking. A `true` from [`connect_audio`] only means the
/// service accepted the request; the audio path itself is reported later
/// through an audio-granted event.
///
/// [`connect_audio`]: AudioTransport::connect_audio
#[cfg_attr(test, mockall::automock)]
pub trait AudioTransport: Send {
    /// Ask the service to open the audio path to `device`
    ///
    /// Returns `false` if the request was rejected outright.
    fn connect_audio(&self, device: &DeviceAddress) -> bool;

    /// Ask the service to close whatever audio path is open
    fn disconnect_audio(&self);

    /// Whether `device` is carrying audio right now
    fn is_audio_active(&self, device: &DeviceAddress) -> bool;

    /// Devices the service currently holds a link-layer connection to
    fn connected_devices(&self) -> Vec<DeviceAddress>;
}

/// Find the first device the transport reports as carrying audio
///
/// Devices are checked in the transport's own connected-device order.
pub fn audio_connected_device(transport: &dyn AudioTransport) -> Option<DeviceAddress> {
    transport
        .connected_devices()
        .into_iter()
        .find(|device| {
            let active = transport.is_audio_active(device);
            tracing::trace!(device = %device, active, "Checked audio state");
            active
        })
}
