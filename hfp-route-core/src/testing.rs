//! Fakes for exercising the route state machine without hardware.
//!
//! [`FakeTransport`] records every command and answers queries from state the
//! test controls. Clones share that state, so a test can keep one handle while
//! the state machine owns another. [`RecordingListener`] captures every
//! category notification in order.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::listener::RouteListener;
use crate::model::{DeviceAddress, RouteCategory, RouteChange};
use crate::transport::AudioTransport;

/// A command the state machine sent to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect(DeviceAddress),
    Disconnect,
}

#[derive(Debug, Default)]
struct FakeTransportState {
    connected: Vec<DeviceAddress>,
    audio_on: Option<DeviceAddress>,
    connect_results: VecDeque<bool>,
    default_connect_result: bool,
    grant_on_connect: bool,
    calls: Vec<TransportCall>,
}

/// Scriptable in-memory transport.
#[derive(Debug, Clone)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeTransportState>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    /// Create a transport with no devices that accepts every connect command.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeTransportState {
                default_connect_result: true,
                ..Default::default()
            })),
        }
    }

    /// Create a transport reporting these devices as link-layer connected.
    pub fn with_devices<I, D>(devices: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceAddress>,
    {
        let transport = Self::new();
        transport.set_connected_devices(devices);
        transport
    }

    /// Box a handle sharing this transport's state.
    pub fn boxed(&self) -> Box<dyn AudioTransport> {
        Box::new(self.clone())
    }

    pub fn set_connected_devices<I, D>(&self, devices: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceAddress>,
    {
        self.state.lock().connected = devices.into_iter().map(Into::into).collect();
    }

    /// Set which device reports audio as active.
    pub fn set_audio_on(&self, device: Option<DeviceAddress>) {
        self.state.lock().audio_on = device;
    }

    /// Result returned by connect commands once queued results are used up.
    pub fn set_connect_result(&self, accepted: bool) {
        self.state.lock().default_connect_result = accepted;
    }

    /// Queue results for the next connect commands, in order.
    pub fn push_connect_results(&self, results: &[bool]) {
        self.state.lock().connect_results.extend(results.iter().copied());
    }

    /// Turn audio on for the target as soon as a connect command is accepted.
    ///
    /// The grant itself still has to be posted as an `AudioGranted` message.
    pub fn set_grant_on_connect(&self, enabled: bool) {
        self.state.lock().grant_on_connect = enabled;
    }

    /// Every command received so far.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    /// Targets of every connect command, in order.
    pub fn connect_targets(&self) -> Vec<DeviceAddress> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Connect(device) => Some(device.clone()),
                TransportCall::Disconnect => None,
            })
            .collect()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, TransportCall::Disconnect))
            .count()
    }

    /// Forget recorded commands.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

impl AudioTransport for FakeTransport {
    fn connect_audio(&self, device: &DeviceAddress) -> bool {
        let mut state = self.state.lock();
        state.calls.push(TransportCall::Connect(device.clone()));
        let accepted = state
            .connect_results
            .pop_front()
            .unwrap_or(state.default_connect_result);
        if accepted && state.grant_on_connect {
            state.audio_on = Some(device.clone());
        }
        accepted
    }

    fn disconnect_audio(&self) {
        let mut state = self.state.lock();
        state.calls.push(TransportCall::Disconnect);
        state.audio_on = None;
    }

    fn is_audio_active(&self, device: &DeviceAddress) -> bool {
        self.state.lock().audio_on.as_ref() == Some(device)
    }

    fn connected_devices(&self) -> Vec<DeviceAddress> {
        self.state.lock().connected.clone()
    }
}

/// Listener that stores every notification.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    changes: Arc<Mutex<Vec<RouteChange>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Box a handle sharing this listener's record.
    pub fn boxed(&self) -> Box<dyn RouteListener> {
        Box::new(self.clone())
    }

    pub fn changes(&self) -> Vec<RouteChange> {
        self.changes.lock().clone()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<RouteChange> {
        std::mem::take(&mut *self.changes.lock())
    }

    pub fn last(&self) -> Option<RouteChange> {
        self.changes.lock().last().cloned()
    }
}

impl RouteListener for RecordingListener {
    fn on_route_change(&mut self, old: RouteCategory, new: RouteCategory) {
        self.changes.lock().push(RouteChange::new(old, new));
    }
}
