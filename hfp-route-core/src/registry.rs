//! Device registry
//!
//! Tracks the HFP devices that currently have a service-level connection, in
//! the order they connected, together with the transport used to command them.

use tracing::{debug, trace};

use crate::model::DeviceAddress;
use crate::transport::{self, AudioTransport};

/// Connected-device bookkeeping owned by the route state machine
///
/// Devices are kept in connection order with the most recent last. A device
/// that reconnects moves to the end.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Vec<DeviceAddress>,
    transport: Option<Box<dyn AudioTransport>>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices)
            .field("transport_bound", &self.transport.is_some())
            .finish()
    }
}

impl DeviceRegistry {
    /// Create an empty registry with no transport bound
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry bound to `transport`
    pub fn with_transport(transport: Box<dyn AudioTransport>) -> Self {
        Self {
            devices: Vec::new(),
            transport: Some(transport),
        }
    }

    /// Record a device connection, returning true if the device was not yet known
    pub fn device_connected(&mut self, device: &DeviceAddress) -> bool {
        let is_new = match self.devices.iter().position(|d| d == device) {
            Some(index) => {
                self.devices.remove(index);
                false
            }
            None => true,
        };
        self.devices.push(device.clone());
        debug!(%device, is_new, count = self.devices.len(), "Device connected");
        is_new
    }

    /// Remove a device, returning true if it was present
    pub fn device_disconnected(&mut self, device: &DeviceAddress) -> bool {
        match self.devices.iter().position(|d| d == device) {
            Some(index) => {
                self.devices.remove(index);
                debug!(%device, count = self.devices.len(), "Device disconnected");
                true
            }
            None => {
                trace!(%device, "Ignoring disconnect of unknown device");
                false
            }
        }
    }

    pub fn count(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, device: &DeviceAddress) -> bool {
        self.devices.contains(device)
    }

    /// Devices in connection order, most recent last
    pub fn devices(&self) -> &[DeviceAddress] {
        &self.devices
    }

    /// The most recently connected device other than `excluded`
    pub fn most_recent_excluding(&self, excluded: Option<&DeviceAddress>) -> Option<DeviceAddress> {
        self.devices
            .iter()
            .rev()
            .find(|d| Some(*d) != excluded)
            .cloned()
    }

    pub fn transport(&self) -> Option<&dyn AudioTransport> {
        self.transport.as_deref()
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Bind a transport, replacing any previous one
    pub fn attach_transport(&mut self, transport: Box<dyn AudioTransport>) {
        if self.transport.replace(transport).is_some() {
            debug!("Replaced bound audio transport");
        }
    }

    /// Release the bound transport
    pub fn detach_transport(&mut self) -> Option<Box<dyn AudioTransport>> {
        self.transport.take()
    }

    /// Release the transport and return the devices that were connected
    ///
    /// The device list is left intact so the caller can process each loss in
    /// order before calling [`clear`](Self::clear).
    pub fn all_service_lost(&mut self) -> Vec<DeviceAddress> {
        self.transport = None;
        self.devices.clone()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// The device the transport reports as carrying audio, if any
    pub fn active_audio_device(&self) -> Option<DeviceAddress> {
        self.transport().and_then(transport::audio_connected_device)
    }

    /// Whether the transport knows `device` even if the registry does not
    pub fn is_known(&self, device: &DeviceAddress) -> bool {
        self.contains(device)
            || self
                .transport()
                .map(|t| t.connected_devices().contains(device))
                .unwrap_or(false)
    }
}
