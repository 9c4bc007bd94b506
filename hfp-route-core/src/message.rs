//! Messages processed by the route state machine
//!
//! Every input, whether a hardware fact, a routing command or a timer, is one
//! of these variants. They are handled strictly one at a time in post order.

use std::fmt;

use crate::listener::RouteListener;
use crate::model::DeviceAddress;
use crate::state_machine::RouteStateMachine;
use crate::transport::AudioTransport;

/// Work to run on the state machine's own thread once every earlier message is handled
pub type EnqueuedWork = Box<dyn FnOnce(&RouteStateMachine) + Send>;

pub enum Message {
    /// A device gained a link-layer connection
    NewDeviceConnected(DeviceAddress),
    /// A device lost its link-layer connection
    DeviceLost(DeviceAddress),
    /// Route call audio to this device, or to the preferred device when `None`
    ConnectRequest(Option<DeviceAddress>),
    /// Stop routing call audio over Bluetooth
    DisconnectRequest,
    /// The hardware reports audio is on for this device
    AudioGranted(DeviceAddress),
    /// The hardware reports audio is off for this device
    AudioLost(DeviceAddress),
    /// The pending connection was not granted in time
    ConnectionTimeout,
    /// Re-issue a rejected connect command
    RetryConnection {
        target: DeviceAddress,
        attempt: u32,
    },
    /// Check that the connected device still carries audio
    ReconcileAudio,
    /// The hands-free service went away
    ServiceLost,
    /// The hands-free service is available through this transport
    ServiceConnected(Box<dyn AudioTransport>),
    /// Replace the registered listener
    SetListener(Box<dyn RouteListener>),
    /// Marker used to wait for the queue to drain up to this point
    RunEnqueued(EnqueuedWork),
    /// Stop processing and release the transport
    Quit,
}

impl Message {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Message::NewDeviceConnected(_) => "NewDeviceConnected",
            Message::DeviceLost(_) => "DeviceLost",
            Message::ConnectRequest(_) => "ConnectRequest",
            Message::DisconnectRequest => "DisconnectRequest",
            Message::AudioGranted(_) => "AudioGranted",
            Message::AudioLost(_) => "AudioLost",
            Message::ConnectionTimeout => "ConnectionTimeout",
            Message::RetryConnection { .. } => "RetryConnection",
            Message::ReconcileAudio => "ReconcileAudio",
            Message::ServiceLost => "ServiceLost",
            Message::ServiceConnected(_) => "ServiceConnected",
            Message::SetListener(_) => "SetListener",
            Message::RunEnqueued(_) => "RunEnqueued",
            Message::Quit => "Quit",
        }
    }

    /// Wrap a closure as a run-enqueued marker
    pub fn run_enqueued<F>(work: F) -> Self
    where
        F: FnOnce(&RouteStateMachine) + Send + 'static,
    {
        Message::RunEnqueued(Box::new(work))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::NewDeviceConnected(device)
            | Message::DeviceLost(device)
            | Message::AudioGranted(device)
            | Message::AudioLost(device) => f.debug_tuple(self.name()).field(device).finish(),
            Message::ConnectRequest(device) => f.debug_tuple(self.name()).field(device).finish(),
            Message::RetryConnection { target, attempt } => f
                .debug_struct(self.name())
                .field("target", target)
                .field("attempt", attempt)
                .finish(),
            _ => f.write_str(self.name()),
        }
    }
}
