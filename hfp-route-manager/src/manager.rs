//! Sync-first Bluetooth route manager
//!
//! Provides a fully synchronous API over the route state machine. The machine
//! runs on a background worker thread; every call here becomes a message on
//! its queue, so callers on any thread see one consistent order of decisions.

use std::sync::{mpsc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use hfp_route_core::{
    AudioTransport, ChannelListener, DeviceAddress, Message, RouteConfig, RouteListener,
    RouteState, RouteStateMachine,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::error::{Result, RouteManagerError};
use crate::iter::RouteChangeIterator;
use crate::worker::spawn_route_worker;

/// Sync-first manager routing call audio to Bluetooth hands-free devices
///
/// Event ingestion and routing commands return as soon as the message is
/// queued. Introspection waits for everything queued before it to be handled,
/// for at most the configured sync timeout.
///
/// # Example
///
/// ```rust,ignore
/// use hfp_route_manager::BluetoothRouteManager;
///
/// let manager = BluetoothRouteManager::new(Box::new(headset))?;
/// manager.on_device_connected("00:11:22:33:44:55")?;
/// manager.request_connect(None)?;
///
/// // later, from the headset service callback
/// manager.on_audio_granted("00:11:22:33:44:55")?;
///
/// for change in manager.changes()? {
///     println!("{} -> {}", change.old, change.new);
/// }
/// ```
pub struct BluetoothRouteManager {
    /// Send messages to the background worker
    message_tx: UnboundedSender<Message>,

    /// How long introspection waits for the worker
    sync_timeout: Duration,

    /// Background worker handle, taken on quit
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BluetoothRouteManager {
    /// Create a manager bound to `transport` with default configuration
    pub fn new(transport: Box<dyn AudioTransport>) -> Result<Self> {
        Self::with_config(transport, RouteConfig::default())
    }

    /// Create a manager bound to `transport`
    pub fn with_config(transport: Box<dyn AudioTransport>, config: RouteConfig) -> Result<Self> {
        Self::from_state_machine(RouteStateMachine::new(transport, config)?)
    }

    /// Create a manager that waits for `on_service_connected` before routing
    pub fn unbound(config: RouteConfig) -> Result<Self> {
        Self::from_state_machine(RouteStateMachine::unbound(config)?)
    }

    /// Run an already configured state machine on a new worker
    pub fn from_state_machine(machine: RouteStateMachine) -> Result<Self> {
        let sync_timeout = machine.config().sync_timeout;
        let (message_tx, message_rx) = unbounded_channel();
        let worker = spawn_route_worker(machine, message_rx).map_err(RouteManagerError::WorkerStart)?;

        Ok(Self {
            message_tx,
            sync_timeout,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn send(&self, message: Message) -> Result<()> {
        self.message_tx
            .send(message)
            .map_err(|_| RouteManagerError::WorkerDisconnected)
    }

    /// Run `query` on the worker after everything queued so far and return its result
    pub fn query<T, F>(&self, query: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RouteStateMachine) -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Message::run_enqueued(move |machine| {
            let _ = reply_tx.send(query(machine));
        }))?;

        reply_rx
            .recv_timeout(self.sync_timeout)
            .map_err(|e| match e {
                mpsc::RecvTimeoutError::Timeout => RouteManagerError::Timeout(self.sync_timeout),
                mpsc::RecvTimeoutError::Disconnected => RouteManagerError::WorkerDisconnected,
            })
    }

    // ------------------------------------------------------------------
    // Event ingestion
    // ------------------------------------------------------------------

    /// A hands-free device gained a link-layer connection
    pub fn on_device_connected(&self, address: impl Into<String>) -> Result<()> {
        let device = DeviceAddress::parse(address)?;
        tracing::debug!("Device connected: {}", device);
        self.send(Message::NewDeviceConnected(device))
    }

    /// A hands-free device lost its link-layer connection
    pub fn on_device_disconnected(&self, address: impl Into<String>) -> Result<()> {
        let device = DeviceAddress::parse(address)?;
        tracing::debug!("Device disconnected: {}", device);
        self.send(Message::DeviceLost(device))
    }

    /// The headset service reports audio on for a device
    pub fn on_audio_granted(&self, address: impl Into<String>) -> Result<()> {
        self.send(Message::AudioGranted(DeviceAddress::parse(address)?))
    }

    /// The headset service reports audio off for a device
    pub fn on_audio_lost(&self, address: impl Into<String>) -> Result<()> {
        self.send(Message::AudioLost(DeviceAddress::parse(address)?))
    }

    /// The headset service went away; every device is treated as lost
    pub fn on_service_disconnected(&self) -> Result<()> {
        tracing::info!("Headset service disconnected");
        self.send(Message::ServiceLost)
    }

    /// The headset service is available again through `transport`
    pub fn on_service_connected(&self, transport: Box<dyn AudioTransport>) -> Result<()> {
        tracing::info!("Headset service connected");
        self.send(Message::ServiceConnected(transport))
    }

    // ------------------------------------------------------------------
    // Routing commands
    // ------------------------------------------------------------------

    /// Route call audio to `address`, or to the preferred device when `None`
    pub fn request_connect(&self, address: Option<&str>) -> Result<()> {
        let device = address.map(DeviceAddress::parse).transpose()?;
        self.send(Message::ConnectRequest(device))
    }

    /// Stop routing call audio over Bluetooth
    pub fn request_disconnect(&self) -> Result<()> {
        self.send(Message::DisconnectRequest)
    }

    /// Register the listener for category changes, replacing any previous one
    pub fn register_listener(&self, listener: impl RouteListener + 'static) -> Result<()> {
        self.send(Message::SetListener(Box::new(listener)))
    }

    /// Get a blocking iterator over category changes
    ///
    /// Installs a forwarding listener, replacing whatever listener was registered.
    pub fn changes(&self) -> Result<RouteChangeIterator> {
        let (tx, rx) = mpsc::channel();
        self.register_listener(ChannelListener::new(tx))?;
        Ok(RouteChangeIterator::new(rx))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn current_state(&self) -> Result<RouteState> {
        self.query(|machine| machine.state().clone())
    }

    /// `AudioOff`, `Connecting:<addr>` or `Connected:<addr>`
    pub fn current_state_name(&self) -> Result<String> {
        self.query(|machine| machine.current_state_name())
    }

    /// The device being connected or carrying audio
    pub fn active_device_address(&self) -> Result<Option<DeviceAddress>> {
        self.query(|machine| machine.active_device_address().cloned())
    }

    pub fn is_bluetooth_available(&self) -> Result<bool> {
        self.query(|machine| machine.is_bluetooth_available())
    }

    pub fn is_audio_connected_or_pending(&self) -> Result<bool> {
        self.query(|machine| machine.is_audio_connected_or_pending())
    }

    /// Connected devices, most recently connected last
    pub fn connected_devices(&self) -> Result<Vec<DeviceAddress>> {
        self.query(|machine| machine.connected_devices())
    }

    /// Block until every message queued before this call has been handled
    pub fn wait_for_idle(&self) -> Result<()> {
        self.query(|_| ())
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop the worker after it handles what is already queued
    ///
    /// Pending timers are discarded and the transport is released. Later calls
    /// fail with `WorkerDisconnected`.
    pub fn quit(&self) -> Result<()> {
        let sent = self.send(Message::Quit);
        self.join_worker();
        sent
    }

    fn join_worker(&self) {
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };

        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Route worker panicked");
            }
        }
    }
}

impl Drop for BluetoothRouteManager {
    fn drop(&mut self) {
        tracing::debug!("BluetoothRouteManager dropping");
        let _ = self.message_tx.send(Message::Quit);
        self.join_worker();
    }
}
