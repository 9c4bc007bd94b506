//! Route state machine
//!
//! Owns the routing state, the device registry, the bound transport and the
//! message queue. Every input arrives as a [`Message`] and is handled to
//! completion before the next one, so no two routing decisions can interleave.
//! Retry and timeout timers are delayed messages on the same queue, which makes
//! cancelling them synchronous: once a timer is cancelled it cannot fire.
//!
//! The machine itself never sleeps or spawns. A driver calls
//! [`run_pending`](RouteStateMachine::run_pending) whenever messages are posted
//! and again at [`next_deadline`](RouteStateMachine::next_deadline).

use std::fmt;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{RouteConfig, TimeoutProvider};
use crate::error::{Result, RouteError};
use crate::listener::RouteListener;
use crate::message::Message;
use crate::model::{DeviceAddress, RouteCategory, RouteState};
use crate::queue::{MessageQueue, TimerToken};
use crate::registry::DeviceRegistry;
use crate::transport::{audio_connected_device, AudioTransport};

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Retry,
    Timeout,
    Reconcile,
}

/// Single-threaded router of hands-free call audio
pub struct RouteStateMachine {
    state: RouteState,
    registry: DeviceRegistry,
    queue: MessageQueue<Message>,
    listener: Option<Box<dyn RouteListener>>,
    config: RouteConfig,
    timeouts: Box<dyn TimeoutProvider>,
    retry_timer: Option<TimerToken>,
    timeout_timer: Option<TimerToken>,
    reconcile_timer: Option<TimerToken>,
    /// Devices in the order they last reached `Connected`, most recent last
    recently_used: Vec<DeviceAddress>,
    quit: bool,
}

impl fmt::Debug for RouteStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteStateMachine")
            .field("state", &self.state)
            .field("registry", &self.registry)
            .field("queued", &self.queue.len())
            .field("quit", &self.quit)
            .finish()
    }
}

impl RouteStateMachine {
    /// Create a state machine bound to `transport`
    pub fn new(transport: Box<dyn AudioTransport>, config: RouteConfig) -> Result<Self> {
        Self::build(DeviceRegistry::with_transport(transport), config)
    }

    /// Create a state machine with no transport bound yet
    ///
    /// Connect requests are no-ops until a `ServiceConnected` message binds one.
    pub fn unbound(config: RouteConfig) -> Result<Self> {
        Self::build(DeviceRegistry::new(), config)
    }

    fn build(registry: DeviceRegistry, config: RouteConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: RouteState::AudioOff,
            registry,
            queue: MessageQueue::new(),
            listener: None,
            timeouts: Box::new(config.clone()),
            config,
            retry_timer: None,
            timeout_timer: None,
            reconcile_timer: None,
            recently_used: Vec::new(),
            quit: false,
        })
    }

    /// Take retry and pending delays from `provider` instead of the config
    pub fn with_timeout_provider(mut self, provider: impl TimeoutProvider + 'static) -> Self {
        self.timeouts = Box::new(provider);
        self
    }

    /// Replace the registered listener
    pub fn set_listener(&mut self, listener: Box<dyn RouteListener>) {
        if self.listener.replace(listener).is_some() {
            debug!("Replaced route listener");
        }
    }

    /// Queue a message for processing
    pub fn post(&mut self, message: Message) -> Result<()> {
        if self.quit {
            debug!(message = message.name(), "Ignoring message posted after quit");
            return Err(RouteError::Quit);
        }
        self.queue.post(message);
        Ok(())
    }

    /// When the earliest queued message becomes due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.next_deadline()
    }

    /// Number of queued messages, timers included
    pub fn queued_messages(&self) -> usize {
        self.queue.len()
    }

    /// Process every message that is due, including ones that become due meanwhile
    ///
    /// Returns how many messages were handled.
    pub fn run_pending(&mut self) -> usize {
        let mut processed = 0;
        while !self.quit {
            let Some(message) = self.queue.pop_due(Instant::now()) else {
                break;
            };
            self.dispatch(message);
            processed += 1;
        }
        processed
    }

    /// Handle what is already due, then stop for good
    pub fn quit(&mut self) {
        self.run_pending();
        self.shut_down();
    }

    pub fn is_quit(&self) -> bool {
        self.quit
    }

    pub fn state(&self) -> &RouteState {
        &self.state
    }

    /// `AudioOff`, `Connecting:<addr>` or `Connected:<addr>`
    pub fn current_state_name(&self) -> String {
        self.state.name()
    }

    /// The device being connected or carrying audio
    pub fn active_device_address(&self) -> Option<&DeviceAddress> {
        self.state.device()
    }

    pub fn category(&self) -> RouteCategory {
        self.state.category(self.registry.count())
    }

    /// Whether any hands-free device is link-layer connected
    pub fn is_bluetooth_available(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn is_audio_connected_or_pending(&self) -> bool {
        !self.state.is_audio_off()
    }

    /// Connected devices, most recently connected last
    pub fn connected_devices(&self) -> Vec<DeviceAddress> {
        self.registry.devices().to_vec()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    /// Put the machine directly into `state` without notifying or commanding the transport
    ///
    /// The timers that belong to `state` are armed as if it had been entered normally.
    #[cfg(any(test, feature = "test-support"))]
    pub fn set_initial_state(&mut self, state: RouteState) {
        self.cancel_timers();
        self.state = state;
        match self.state.clone() {
            RouteState::AudioOff => {}
            RouteState::Connecting(_) => self.arm_timeout(),
            RouteState::Connected(device) => {
                self.mark_recently_used(&device);
                self.arm_reconcile();
            }
        }
    }

    fn dispatch(&mut self, message: Message) {
        debug!(message = ?message, state = %self.state, "Processing message");

        match message {
            Message::NewDeviceConnected(device) => self.observe(|sm| {
                sm.registry.device_connected(&device);
            }),
            Message::DeviceLost(device) => self.observe(|sm| sm.handle_device_lost(&device)),
            Message::ConnectRequest(address) => {
                self.observe(|sm| sm.handle_connect_request(address))
            }
            Message::DisconnectRequest => self.observe(Self::handle_disconnect_request),
            Message::AudioGranted(device) => self.observe(|sm| sm.handle_audio_granted(device)),
            Message::AudioLost(device) => self.observe(|sm| sm.handle_audio_lost(&device)),
            Message::ConnectionTimeout => self.observe(Self::handle_connection_timeout),
            Message::RetryConnection { target, attempt } => {
                self.observe(|sm| sm.handle_retry(target, attempt))
            }
            Message::ReconcileAudio => self.observe(Self::handle_reconcile),
            Message::ServiceLost => self.handle_service_lost(),
            Message::ServiceConnected(transport) => self.handle_service_connected(transport),
            Message::SetListener(listener) => self.set_listener(listener),
            Message::RunEnqueued(work) => work(&*self),
            Message::Quit => self.shut_down(),
        }
    }

    /// Run one processing step and notify the listener if the route moved
    fn observe<F: FnOnce(&mut Self)>(&mut self, step: F) {
        let old_state = self.state.clone();
        let old_category = self.category();

        step(self);

        let new_category = self.category();
        if old_state == self.state && old_category == new_category {
            return;
        }

        info!(
            from = %old_state,
            to = %self.state,
            %old_category,
            %new_category,
            "Route changed"
        );
        if let Some(listener) = self.listener.as_mut() {
            listener.on_route_change(old_category, new_category);
        }
    }

    fn handle_device_lost(&mut self, device: &DeviceAddress) {
        self.registry.device_disconnected(device);
        self.recently_used.retain(|d| d != device);

        if self.state.device() != Some(device) {
            return;
        }

        info!(%device, state = %self.state, "Active device lost");
        match self.preferred_device(Some(device)) {
            Some(next) => self.enter_connecting(next),
            None => self.enter_audio_off(false),
        }
    }

    fn handle_connect_request(&mut self, address: Option<DeviceAddress>) {
        let Some(target) = self.resolve_target(address) else {
            info!(state = %self.state, "No device available to connect");
            return;
        };

        if self.state.device() == Some(&target) {
            debug!(%target, state = %self.state, "Already routing to requested device");
            return;
        }

        self.enter_connecting(target);
    }

    fn handle_disconnect_request(&mut self) {
        if self.state.is_audio_off() {
            debug!("Disconnect requested while audio is already off");
            return;
        }

        info!(state = %self.state, "Disconnecting audio on request");
        self.enter_audio_off(true);
    }

    fn handle_audio_granted(&mut self, device: DeviceAddress) {
        match &self.state {
            RouteState::Connected(current) if *current == device => {
                debug!(%device, "Audio already connected");
                return;
            }
            RouteState::Connecting(current) if *current == device => {
                info!(%device, "Audio connected");
            }
            RouteState::AudioOff => {
                info!(%device, "Audio turned on without a request");
            }
            other => {
                warn!(%device, state = %other, "Audio granted to a different device");
            }
        }

        if !self.registry.contains(&device) {
            debug!(%device, "Audio granted to a device that was never reported connected");
        }
        self.enter_connected(device);
    }

    fn handle_audio_lost(&mut self, device: &DeviceAddress) {
        if self.state.device() != Some(device) {
            debug!(%device, state = %self.state, "Ignoring audio loss for inactive device");
            return;
        }

        if self.state.is_connecting() {
            info!(%device, "Pending audio connection dropped");
            self.resolve_actual_state();
            return;
        }

        info!(%device, "Audio lost");
        match self.preferred_device(Some(device)) {
            Some(next) => self.enter_connecting(next),
            None => self.resolve_actual_state(),
        }
    }

    fn handle_connection_timeout(&mut self) {
        self.release_timer(TimerKind::Timeout);
        if !self.state.is_connecting() {
            debug!(state = %self.state, "Ignoring stale connection timeout");
            return;
        }

        warn!(state = %self.state, "Audio connection timed out");
        self.resolve_actual_state();
    }

    fn handle_retry(&mut self, target: DeviceAddress, attempt: u32) {
        self.release_timer(TimerKind::Retry);
        if self.state != RouteState::Connecting(target.clone()) {
            debug!(%target, state = %self.state, "Ignoring stale connect retry");
            return;
        }

        info!(%target, attempt, "Retrying audio connection");
        self.issue_connect(&target, attempt);
    }

    fn handle_reconcile(&mut self) {
        self.release_timer(TimerKind::Reconcile);
        let RouteState::Connected(device) = self.state.clone() else {
            return;
        };

        let active = self
            .registry
            .transport()
            .map(|t| t.is_audio_active(&device))
            .unwrap_or(false);

        if active {
            self.arm_reconcile();
        } else {
            warn!(%device, "Audio dropped without notice");
            self.handle_audio_lost(&device);
        }
    }

    fn handle_service_lost(&mut self) {
        warn!(devices = self.registry.count(), "Hands-free service lost");

        for device in self.registry.all_service_lost() {
            self.observe(|sm| sm.handle_device_lost(&device));
        }
        self.registry.clear();
        self.recently_used.clear();

        if !self.state.is_audio_off() {
            self.observe(|sm| sm.enter_audio_off(false));
        }
    }

    fn handle_service_connected(&mut self, transport: Box<dyn AudioTransport>) {
        let devices = transport.connected_devices();
        info!(devices = devices.len(), "Hands-free service connected");

        self.registry.attach_transport(transport);
        for device in devices {
            self.observe(|sm| {
                sm.registry.device_connected(&device);
            });
        }
    }

    fn shut_down(&mut self) {
        if self.quit {
            return;
        }

        info!(state = %self.state, "Route state machine quitting");
        self.quit = true;
        self.cancel_timers();
        self.queue.clear();
        self.registry.detach_transport();
    }

    /// Pick a device to route to, honouring an explicit request when the device is known
    fn resolve_target(&self, address: Option<DeviceAddress>) -> Option<DeviceAddress> {
        if !self.registry.has_transport() {
            return None;
        }

        match address {
            Some(device) if self.registry.is_known(&device) => Some(device),
            Some(device) => {
                warn!(%device, "Requested device is not connected, using preferred device");
                self.preferred_device(None)
            }
            None => self.preferred_device(None),
        }
    }

    fn preferred_device(&self, excluded: Option<&DeviceAddress>) -> Option<DeviceAddress> {
        if !self.registry.has_transport() {
            return None;
        }

        if self.config.prefer_recently_used {
            let recent = self
                .recently_used
                .iter()
                .rev()
                .find(|d| Some(*d) != excluded && self.registry.contains(d));
            if let Some(device) = recent {
                return Some(device.clone());
            }
        }

        self.registry.most_recent_excluding(excluded)
    }

    /// Follow whatever the transport says is carrying audio
    fn resolve_actual_state(&mut self) {
        match self.registry.active_audio_device() {
            Some(device) => {
                info!(%device, "Transport reports audio on device");
                self.enter_connected(device);
            }
            None => self.enter_audio_off(false),
        }
    }

    fn enter_connecting(&mut self, target: DeviceAddress) {
        self.cancel_timers();
        self.state = RouteState::Connecting(target.clone());
        self.issue_connect(&target, 0);
    }

    fn enter_connected(&mut self, device: DeviceAddress) {
        self.cancel_timers();
        self.mark_recently_used(&device);
        self.state = RouteState::Connected(device);
        self.arm_reconcile();
    }

    fn enter_audio_off(&mut self, disconnect_requested: bool) {
        self.cancel_timers();
        self.state = RouteState::AudioOff;

        let Some(transport) = self.registry.transport() else {
            return;
        };
        if disconnect_requested {
            transport.disconnect_audio();
        } else if let Some(stray) = audio_connected_device(transport) {
            warn!(device = %stray, "Audio still on while routing is off, disconnecting");
            transport.disconnect_audio();
        }
    }

    fn issue_connect(&mut self, target: &DeviceAddress, attempt: u32) {
        let accepted = match self.registry.transport() {
            Some(transport) => transport.connect_audio(target),
            None => false,
        };

        if accepted {
            debug!(%target, attempt, "Connect command accepted");
            self.arm_timeout();
        } else if attempt < self.config.max_connect_retries {
            let delay = self.timeouts.retry_backoff();
            warn!(%target, attempt, ?delay, "Connect command rejected, scheduling retry");
            let retry = Message::RetryConnection {
                target: target.clone(),
                attempt: attempt + 1,
            };
            self.retry_timer = Some(self.queue.post_delayed(delay, retry));
        } else {
            warn!(%target, attempt, "Connect command rejected, waiting for timeout");
            self.arm_timeout();
        }
    }

    fn arm_timeout(&mut self) {
        let delay = self.timeouts.pending_timeout();
        self.timeout_timer = Some(self.queue.post_delayed(delay, Message::ConnectionTimeout));
    }

    fn arm_reconcile(&mut self) {
        if let Some(interval) = self.config.reconcile_interval {
            self.reconcile_timer = Some(self.queue.post_delayed(interval, Message::ReconcileAudio));
        }
    }

    fn cancel_timers(&mut self) {
        for token in [
            self.retry_timer.take(),
            self.timeout_timer.take(),
            self.reconcile_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.queue.cancel(token);
        }
    }

    /// Forget a timer whose message is being handled, dropping it if it was posted by hand
    fn release_timer(&mut self, kind: TimerKind) {
        let slot = match kind {
            TimerKind::Retry => &mut self.retry_timer,
            TimerKind::Timeout => &mut self.timeout_timer,
            TimerKind::Reconcile => &mut self.reconcile_timer,
        };
        if let Some(token) = slot.take() {
            self.queue.cancel(token);
        }
    }

    fn mark_recently_used(&mut self, device: &DeviceAddress) {
        self.recently_used.retain(|d| d != device);
        self.recently_used.push(device.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RouteChange;
    use crate::testing::{FakeTransport, RecordingListener, TransportCall};
    use crate::transport::MockAudioTransport;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use crate::model::RouteCategory::{AudioConnected, AudioPending, DeviceConnected, Disconnected};

    const D1: &str = "00:00:00:00:00:01";
    const D2: &str = "00:00:00:00:00:02";
    const D3: &str = "00:00:00:00:00:03";
    const D9: &str = "00:00:00:00:00:09";

    fn addr(s: &str) -> DeviceAddress {
        DeviceAddress::new(s)
    }

    fn quiet_config() -> RouteConfig {
        RouteConfig::default()
            .with_retry_backoff(Duration::from_secs(100))
            .with_pending_timeout(Duration::from_secs(100))
    }

    struct Harness {
        sm: RouteStateMachine,
        transport: FakeTransport,
        listener: RecordingListener,
    }

    impl Harness {
        fn send(&mut self, message: Message) {
            self.sm.post(message).unwrap();
            self.sm.run_pending();
        }
    }

    /// Build a machine whose registry holds `devices`, listed most recent first
    fn harness(config: RouteConfig, devices: &[&str]) -> Harness {
        let transport = FakeTransport::with_devices(devices.iter().copied());
        let mut sm = RouteStateMachine::new(transport.boxed(), config).unwrap();
        for device in devices.iter().rev() {
            sm.post(Message::NewDeviceConnected(addr(device))).unwrap();
        }
        sm.run_pending();

        let listener = RecordingListener::new();
        sm.set_listener(listener.boxed());
        Harness {
            sm,
            transport,
            listener,
        }
    }

    #[rstest]
    #[case::new_device_connected_while_audio_off(
        &[], None, RouteState::AudioOff,
        Message::NewDeviceConnected(addr(D1)),
        Some((Disconnected, DeviceConnected)), vec![], RouteState::AudioOff
    )]
    #[case::nonspecific_connect_while_audio_off(
        &[D2, D1], None, RouteState::AudioOff,
        Message::ConnectRequest(None),
        Some((DeviceConnected, AudioPending)),
        vec![TransportCall::Connect(addr(D2))], RouteState::Connecting(addr(D2))
    )]
    #[case::connection_succeeds_after_pending(
        &[D2, D1], Some(D2), RouteState::Connecting(addr(D2)),
        Message::AudioGranted(addr(D2)),
        Some((AudioPending, AudioConnected)), vec![], RouteState::Connected(addr(D2))
    )]
    #[case::audio_lost_without_fallback(
        &[D2], None, RouteState::Connected(addr(D2)),
        Message::AudioLost(addr(D2)),
        Some((AudioConnected, DeviceConnected)), vec![], RouteState::AudioOff
    )]
    #[case::audio_lost_with_fallback(
        &[D2, D1, D3], None, RouteState::Connected(addr(D2)),
        Message::AudioLost(addr(D2)),
        Some((AudioConnected, AudioPending)),
        vec![TransportCall::Connect(addr(D1))], RouteState::Connecting(addr(D1))
    )]
    #[case::switch_active_devices(
        &[D2, D1, D3], None, RouteState::Connected(addr(D2)),
        Message::ConnectRequest(Some(addr(D3))),
        Some((AudioConnected, AudioPending)),
        vec![TransportCall::Connect(addr(D3))], RouteState::Connecting(addr(D3))
    )]
    #[case::switch_before_first_device_connected(
        &[D2, D1, D3], None, RouteState::Connecting(addr(D2)),
        Message::ConnectRequest(Some(addr(D3))),
        Some((AudioPending, AudioPending)),
        vec![TransportCall::Connect(addr(D3))], RouteState::Connecting(addr(D3))
    )]
    #[case::device_lost_while_active_without_fallback(
        &[D2], None, RouteState::Connected(addr(D2)),
        Message::DeviceLost(addr(D2)),
        Some((AudioConnected, Disconnected)), vec![], RouteState::AudioOff
    )]
    #[case::device_lost_while_active_with_fallback(
        &[D2, D3], None, RouteState::Connected(addr(D2)),
        Message::DeviceLost(addr(D2)),
        Some((AudioConnected, AudioPending)),
        vec![TransportCall::Connect(addr(D3))], RouteState::Connecting(addr(D3))
    )]
    #[case::timeout_while_other_device_has_audio(
        &[D2, D1], Some(D1), RouteState::Connecting(addr(D2)),
        Message::ConnectionTimeout,
        Some((AudioPending, AudioConnected)), vec![], RouteState::Connected(addr(D1))
    )]
    #[case::other_device_granted_while_pending(
        &[D2, D1], Some(D1), RouteState::Connecting(addr(D2)),
        Message::AudioGranted(addr(D1)),
        Some((AudioPending, AudioConnected)), vec![], RouteState::Connected(addr(D1))
    )]
    #[case::device_lost_while_pending_with_fallback(
        &[D2, D3], None, RouteState::Connecting(addr(D2)),
        Message::DeviceLost(addr(D2)),
        Some((AudioPending, AudioPending)),
        vec![TransportCall::Connect(addr(D3))], RouteState::Connecting(addr(D3))
    )]
    #[case::device_lost_while_pending_without_fallback(
        &[D2], None, RouteState::Connecting(addr(D2)),
        Message::DeviceLost(addr(D2)),
        Some((AudioPending, Disconnected)), vec![], RouteState::AudioOff
    )]
    #[case::disconnect_request_while_active(
        &[D2, D3], None, RouteState::Connected(addr(D2)),
        Message::DisconnectRequest,
        Some((AudioConnected, DeviceConnected)),
        vec![TransportCall::Disconnect], RouteState::AudioOff
    )]
    #[case::disconnect_request_while_pending(
        &[D2, D3], None, RouteState::Connecting(addr(D2)),
        Message::DisconnectRequest,
        Some((AudioPending, DeviceConnected)),
        vec![TransportCall::Disconnect], RouteState::AudioOff
    )]
    #[case::audio_turns_on_by_itself(
        &[D2, D3], Some(D3), RouteState::AudioOff,
        Message::AudioGranted(addr(D3)),
        Some((DeviceConnected, AudioConnected)), vec![], RouteState::Connected(addr(D3))
    )]
    #[case::other_device_granted_while_connected(
        &[D2, D1], Some(D1), RouteState::Connected(addr(D2)),
        Message::AudioGranted(addr(D1)),
        Some((AudioConnected, AudioConnected)), vec![], RouteState::Connected(addr(D1))
    )]
    #[case::pending_audio_dropped(
        &[D2, D1], None, RouteState::Connecting(addr(D2)),
        Message::AudioLost(addr(D2)),
        Some((AudioPending, DeviceConnected)), vec![], RouteState::AudioOff
    )]
    #[case::connect_request_without_devices(
        &[], None, RouteState::AudioOff,
        Message::ConnectRequest(None),
        None, vec![], RouteState::AudioOff
    )]
    #[case::same_device_connect_while_pending(
        &[D2], None, RouteState::Connecting(addr(D2)),
        Message::ConnectRequest(Some(addr(D2))),
        None, vec![], RouteState::Connecting(addr(D2))
    )]
    #[case::same_device_connect_while_connected(
        &[D1, D2], Some(D2), RouteState::Connected(addr(D2)),
        Message::ConnectRequest(Some(addr(D2))),
        None, vec![], RouteState::Connected(addr(D2))
    )]
    #[case::stale_audio_lost_while_connected(
        &[D2, D1], Some(D2), RouteState::Connected(addr(D2)),
        Message::AudioLost(addr(D1)),
        None, vec![], RouteState::Connected(addr(D2))
    )]
    #[case::stale_timeout_while_connected(
        &[D2], Some(D2), RouteState::Connected(addr(D2)),
        Message::ConnectionTimeout,
        None, vec![], RouteState::Connected(addr(D2))
    )]
    #[case::disconnect_request_while_audio_off(
        &[D1], None, RouteState::AudioOff,
        Message::DisconnectRequest,
        None, vec![], RouteState::AudioOff
    )]
    #[case::unknown_device_lost_while_audio_off(
        &[D1], None, RouteState::AudioOff,
        Message::DeviceLost(addr(D9)),
        None, vec![], RouteState::AudioOff
    )]
    #[case::new_device_while_connected(
        &[D2], Some(D2), RouteState::Connected(addr(D2)),
        Message::NewDeviceConnected(addr(D1)),
        None, vec![], RouteState::Connected(addr(D2))
    )]
    fn test_route_transition(
        #[case] devices: &[&str],
        #[case] audio_on: Option<&str>,
        #[case] initial: RouteState,
        #[case] message: Message,
        #[case] expected_change: Option<(RouteCategory, RouteCategory)>,
        #[case] expected_calls: Vec<TransportCall>,
        #[case] expected_state: RouteState,
    ) {
        let mut h = harness(quiet_config(), devices);
        h.sm.set_initial_state(initial);
        h.transport.set_audio_on(audio_on.map(addr));

        h.send(message);

        let expected: Vec<RouteChange> = expected_change
            .map(|(old, new)| RouteChange::new(old, new))
            .into_iter()
            .collect();
        assert_eq!(h.listener.changes(), expected);
        assert_eq!(h.transport.calls(), expected_calls);
        assert_eq!(h.sm.state(), &expected_state);
    }

    #[test]
    fn test_connect_to_device_only_the_transport_knows() {
        let mut h = harness(quiet_config(), &[]);
        h.transport.set_connected_devices([D1]);

        h.send(Message::ConnectRequest(Some(addr(D1))));

        assert_eq!(
            h.listener.changes(),
            vec![RouteChange::new(Disconnected, AudioPending)]
        );
        assert_eq!(h.transport.calls(), vec![TransportCall::Connect(addr(D1))]);
        assert_eq!(h.sm.state(), &RouteState::Connecting(addr(D1)));
        assert!(h.sm.connected_devices().is_empty());
    }

    #[test]
    fn test_end_to_end_connect() {
        let mut h = harness(quiet_config(), &[]);

        h.send(Message::NewDeviceConnected(addr(D1)));
        assert_eq!(h.sm.connected_devices(), vec![addr(D1)]);

        h.send(Message::ConnectRequest(None));
        assert_eq!(h.transport.connect_targets(), vec![addr(D1)]);
        assert_eq!(h.sm.current_state_name(), format!("Connecting:{}", D1));

        h.send(Message::AudioGranted(addr(D1)));
        assert_eq!(h.sm.state(), &RouteState::Connected(addr(D1)));
        assert_eq!(
            h.listener.changes(),
            vec![
                RouteChange::new(Disconnected, DeviceConnected),
                RouteChange::new(DeviceConnected, AudioPending),
                RouteChange::new(AudioPending, AudioConnected),
            ]
        );
        assert_eq!(h.sm.active_device_address(), Some(&addr(D1)));
        assert!(h.sm.is_audio_connected_or_pending());
        assert_eq!(h.sm.queued_messages(), 0);
    }

    #[test]
    fn test_single_retry_bound() {
        let mut transport = MockAudioTransport::new();
        transport
            .expect_connect_audio()
            .times(2)
            .returning(|_| false);
        transport.expect_disconnect_audio().never();
        transport
            .expect_connected_devices()
            .return_const(vec![addr(D1)]);
        transport.expect_is_audio_active().return_const(false);

        let config = RouteConfig::immediate_retry().with_pending_timeout(Duration::from_secs(100));
        let mut sm = RouteStateMachine::new(Box::new(transport), config).unwrap();
        sm.post(Message::NewDeviceConnected(addr(D1))).unwrap();
        sm.post(Message::ConnectRequest(None)).unwrap();
        sm.run_pending();

        assert_eq!(sm.state(), &RouteState::Connecting(addr(D1)));
        // Abandoned in place: only the connection timeout is left
        assert_eq!(sm.queued_messages(), 1);
    }

    #[test]
    fn test_retry_success_arms_timeout_once() {
        let mut h = harness(RouteConfig::immediate_retry(), &[D1]);
        h.transport.push_connect_results(&[false, true]);

        h.send(Message::ConnectRequest(Some(addr(D1))));

        assert_eq!(h.transport.connect_targets(), vec![addr(D1), addr(D1)]);
        assert_eq!(h.sm.state(), &RouteState::Connecting(addr(D1)));
        assert_eq!(h.sm.queued_messages(), 1);
        assert_eq!(h.listener.changes().len(), 1);

        h.send(Message::AudioGranted(addr(D1)));
        assert_eq!(h.sm.state(), &RouteState::Connected(addr(D1)));
        assert_eq!(h.sm.queued_messages(), 0);
    }

    #[test]
    fn test_retry_cancelled_when_target_changes() {
        let mut h = harness(quiet_config(), &[D2, D1]);
        h.transport.push_connect_results(&[false]);

        h.send(Message::ConnectRequest(Some(addr(D1))));
        assert_eq!(h.sm.queued_messages(), 1);

        h.send(Message::ConnectRequest(Some(addr(D2))));
        assert_eq!(h.transport.connect_targets(), vec![addr(D1), addr(D2)]);
        assert_eq!(h.sm.state(), &RouteState::Connecting(addr(D2)));
        // The retry for D1 is gone, only D2's timeout remains
        assert_eq!(h.sm.queued_messages(), 1);
    }

    #[test]
    fn test_timeout_fires_and_resolves_to_audio_device() {
        let config = RouteConfig::default()
            .with_retry_backoff(Duration::from_secs(100))
            .with_pending_timeout(Duration::from_millis(1));
        let mut h = harness(config, &[D2, D1]);
        h.transport.set_audio_on(Some(addr(D1)));

        h.send(Message::ConnectRequest(Some(addr(D2))));

        thread::sleep(Duration::from_millis(10));
        h.sm.run_pending();

        assert_eq!(h.sm.state(), &RouteState::Connected(addr(D1)));
        assert_eq!(h.listener.last(), Some(RouteChange::new(AudioPending, AudioConnected)));
        assert_eq!(h.transport.connect_targets(), vec![addr(D2)]);
    }

    #[test]
    fn test_timeout_without_audio_goes_off() {
        let config = quiet_config().with_pending_timeout(Duration::from_millis(1));
        let mut h = harness(config, &[D1]);

        h.send(Message::ConnectRequest(None));
        thread::sleep(Duration::from_millis(10));
        h.sm.run_pending();

        assert_eq!(h.sm.state(), &RouteState::AudioOff);
        assert_eq!(h.transport.disconnect_count(), 0);
        assert_eq!(h.listener.last(), Some(RouteChange::new(AudioPending, DeviceConnected)));
    }

    #[test]
    fn test_timeout_provider_overrides_config() {
        struct FastTimeouts;

        impl TimeoutProvider for FastTimeouts {
            fn retry_backoff(&self) -> Duration {
                Duration::ZERO
            }

            fn pending_timeout(&self) -> Duration {
                Duration::from_millis(50)
            }
        }

        let transport = FakeTransport::with_devices([D1]);
        let mut sm = RouteStateMachine::new(transport.boxed(), quiet_config())
            .unwrap()
            .with_timeout_provider(FastTimeouts);
        sm.post(Message::NewDeviceConnected(addr(D1))).unwrap();
        sm.post(Message::ConnectRequest(None)).unwrap();
        sm.run_pending();
        assert!(sm.state().is_connecting());

        thread::sleep(Duration::from_millis(100));
        sm.run_pending();
        assert!(sm.state().is_audio_off());
    }

    #[test]
    fn test_race_tolerance_issues_no_commands() {
        let mut h = harness(quiet_config(), &[D2, D1]);
        h.send(Message::ConnectRequest(Some(addr(D2))));
        h.transport.clear_calls();

        h.send(Message::AudioGranted(addr(D1)));

        assert_eq!(h.sm.state(), &RouteState::Connected(addr(D1)));
        assert!(h.transport.calls().is_empty());
        // The timeout for D2 must not fire later
        assert_eq!(h.sm.queued_messages(), 0);
    }

    #[test]
    fn test_service_loss_sweep() {
        let mut h = harness(quiet_config(), &[D2, D1]);
        h.send(Message::AudioGranted(addr(D2)));
        h.listener.take();
        h.transport.clear_calls();

        h.send(Message::ServiceLost);

        assert_eq!(h.sm.state(), &RouteState::AudioOff);
        assert_eq!(h.sm.registry().count(), 0);
        assert!(!h.sm.is_bluetooth_available());
        assert!(!h.sm.registry().has_transport());
        assert!(h.transport.calls().is_empty());
        assert_eq!(
            h.listener.changes(),
            vec![RouteChange::new(AudioConnected, Disconnected)]
        );

        h.send(Message::ConnectRequest(Some(addr(D1))));
        assert!(h.sm.state().is_audio_off());
        assert!(h.transport.calls().is_empty());
    }

    #[test]
    fn test_service_loss_with_unregistered_active_device() {
        let mut h = harness(quiet_config(), &[D1]);
        h.send(Message::AudioGranted(addr(D9)));
        h.listener.take();

        h.send(Message::ServiceLost);

        assert_eq!(h.sm.state(), &RouteState::AudioOff);
        assert_eq!(
            h.listener.changes(),
            vec![RouteChange::new(AudioConnected, Disconnected)]
        );
    }

    #[test]
    fn test_service_connected_reports_devices() {
        let mut sm = RouteStateMachine::unbound(quiet_config()).unwrap();
        let listener = RecordingListener::new();
        sm.set_listener(listener.boxed());

        sm.post(Message::ConnectRequest(None)).unwrap();
        sm.run_pending();
        assert!(sm.state().is_audio_off());

        let transport = FakeTransport::with_devices([D1, D2]);
        sm.post(Message::ServiceConnected(transport.boxed())).unwrap();
        sm.post(Message::ConnectRequest(None)).unwrap();
        sm.run_pending();

        assert_eq!(sm.connected_devices(), vec![addr(D1), addr(D2)]);
        assert_eq!(transport.connect_targets(), vec![addr(D2)]);
        assert_eq!(
            listener.changes(),
            vec![
                RouteChange::new(Disconnected, DeviceConnected),
                RouteChange::new(DeviceConnected, AudioPending),
            ]
        );
    }

    #[test]
    fn test_idempotent_disconnection() {
        let mut h = harness(quiet_config(), &[D1]);
        h.send(Message::DeviceLost(addr(D9)));
        h.send(Message::DeviceLost(addr(D1)));
        h.send(Message::DeviceLost(addr(D1)));

        assert!(h.sm.state().is_audio_off());
        assert_eq!(
            h.listener.changes(),
            vec![RouteChange::new(DeviceConnected, Disconnected)]
        );
    }

    #[test]
    fn test_unknown_explicit_target_uses_preferred_device() {
        let mut h = harness(quiet_config(), &[D1]);
        h.send(Message::ConnectRequest(Some(addr(D9))));
        assert_eq!(h.transport.connect_targets(), vec![addr(D1)]);
    }

    #[test]
    fn test_explicit_target_known_only_to_transport() {
        let mut h = harness(quiet_config(), &[D1]);
        h.transport.set_connected_devices([D1, D3]);
        h.send(Message::ConnectRequest(Some(addr(D3))));
        assert_eq!(h.sm.state(), &RouteState::Connecting(addr(D3)));
    }

    #[test]
    fn test_audio_off_disconnects_stray_audio() {
        let mut h = harness(quiet_config(), &[D1]);
        h.transport.set_connected_devices([D1, D9]);
        h.sm.set_initial_state(RouteState::Connected(addr(D1)));
        h.transport.set_audio_on(Some(addr(D9)));

        h.send(Message::DeviceLost(addr(D1)));

        assert_eq!(h.sm.state(), &RouteState::AudioOff);
        assert_eq!(h.transport.calls(), vec![TransportCall::Disconnect]);
    }

    #[test]
    fn test_reconcile_detects_silent_audio_drop() {
        let config = quiet_config().with_reconcile_interval(Some(Duration::from_millis(1)));
        let mut h = harness(config, &[D1]);
        h.transport.set_grant_on_connect(true);

        h.send(Message::ConnectRequest(None));
        h.send(Message::AudioGranted(addr(D1)));
        assert_eq!(h.sm.queued_messages(), 1);

        thread::sleep(Duration::from_millis(5));
        h.sm.run_pending();
        assert_eq!(h.sm.state(), &RouteState::Connected(addr(D1)));

        h.transport.set_audio_on(None);
        thread::sleep(Duration::from_millis(5));
        h.sm.run_pending();

        assert_eq!(h.sm.state(), &RouteState::AudioOff);
        assert_eq!(h.listener.last(), Some(RouteChange::new(AudioConnected, DeviceConnected)));
        assert_eq!(h.sm.queued_messages(), 0);
    }

    #[test]
    fn test_reconcile_disabled_by_default() {
        let mut h = harness(quiet_config(), &[D1]);
        h.send(Message::AudioGranted(addr(D1)));
        assert_eq!(h.sm.queued_messages(), 0);
    }

    #[rstest]
    #[case::connection_recency(false, D3)]
    #[case::recently_used(true, D1)]
    fn test_fallback_preference(#[case] prefer_recently_used: bool, #[case] expected: &str) {
        let config = quiet_config().with_recently_used_preference(prefer_recently_used);
        let mut h = harness(config, &[D3, D2, D1]);

        h.send(Message::ConnectRequest(Some(addr(D1))));
        h.send(Message::AudioGranted(addr(D1)));
        h.send(Message::ConnectRequest(Some(addr(D2))));
        h.send(Message::AudioGranted(addr(D2)));
        h.transport.clear_calls();

        h.send(Message::AudioLost(addr(D2)));

        assert_eq!(h.transport.connect_targets(), vec![addr(expected)]);
        assert_eq!(h.sm.state(), &RouteState::Connecting(addr(expected)));
    }

    #[test]
    fn test_quit_processes_due_messages_then_stops() {
        let mut h = harness(quiet_config(), &[D1]);
        h.sm.post(Message::ConnectRequest(None)).unwrap();

        h.sm.quit();

        assert!(h.sm.is_quit());
        assert_eq!(h.sm.state(), &RouteState::Connecting(addr(D1)));
        assert_eq!(h.sm.queued_messages(), 0);
        assert!(!h.sm.registry().has_transport());
        assert!(matches!(
            h.sm.post(Message::DisconnectRequest),
            Err(RouteError::Quit)
        ));
        assert_eq!(h.sm.run_pending(), 0);
    }

    #[test]
    fn test_quit_message_drops_later_posts() {
        let mut h = harness(quiet_config(), &[D1]);
        h.sm.post(Message::Quit).unwrap();
        h.sm.run_pending();

        assert!(h.sm.is_quit());
        assert!(h.sm.post(Message::ConnectRequest(None)).is_err());
        assert!(h.transport.calls().is_empty());
    }

    #[test]
    fn test_run_enqueued_sees_prior_messages() {
        let mut h = harness(quiet_config(), &[D1]);
        let (tx, rx) = mpsc::channel();

        h.sm.post(Message::ConnectRequest(None)).unwrap();
        h.sm.post(Message::run_enqueued(move |sm| {
            tx.send(sm.current_state_name()).unwrap();
        }))
        .unwrap();
        h.sm.run_pending();

        assert_eq!(rx.try_recv().unwrap(), format!("Connecting:{}", D1));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RouteConfig::default().with_max_connect_retries(3);
        assert!(matches!(
            RouteStateMachine::unbound(config),
            Err(RouteError::Configuration(_))
        ));
    }

    fn fallback_scenario() -> impl Strategy<Value = (Vec<usize>, usize, Vec<bool>)> {
        (2usize..7).prop_flat_map(|n| {
            (
                Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
                0..n,
                proptest::collection::vec(any::<bool>(), n),
            )
        })
    }

    proptest! {
        #[test]
        fn prop_fallback_targets_most_recent_remaining(
            (order, active, lost) in fallback_scenario()
        ) {
            let names: Vec<String> = (0..order.len())
                .map(|i| format!("00:00:00:00:01:{:02}", i))
                .collect();
            let transport = FakeTransport::with_devices(names.iter().map(|n| n.as_str()));
            let mut sm = RouteStateMachine::new(transport.boxed(), quiet_config()).unwrap();

            for &i in &order {
                sm.post(Message::NewDeviceConnected(addr(&names[i]))).unwrap();
            }
            sm.post(Message::AudioGranted(addr(&names[active]))).unwrap();
            for (i, &gone) in lost.iter().enumerate() {
                if gone && i != active {
                    sm.post(Message::DeviceLost(addr(&names[i]))).unwrap();
                }
            }
            sm.post(Message::DeviceLost(addr(&names[active]))).unwrap();
            sm.run_pending();

            let expected = order
                .iter()
                .rev()
                .find(|&&i| i != active && !lost[i])
                .map(|&i| RouteState::Connecting(addr(&names[i])))
                .unwrap_or(RouteState::AudioOff);
            prop_assert_eq!(sm.state(), &expected);
        }
    }
}
