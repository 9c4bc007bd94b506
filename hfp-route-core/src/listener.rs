//! Category change notifications

use std::sync::mpsc;

use crate::model::{RouteCategory, RouteChange};

/// Observer of route category transitions
///
/// Called on the state machine's own thread, once per transition, with the
/// category before and after. Implementations must not block.
pub trait RouteListener: Send {
    fn on_route_change(&mut self, old: RouteCategory, new: RouteCategory);
}

impl<F> RouteListener for F
where
    F: FnMut(RouteCategory, RouteCategory) + Send,
{
    fn on_route_change(&mut self, old: RouteCategory, new: RouteCategory) {
        self(old, new)
    }
}

/// Listener that forwards every change into a channel
///
/// Used to turn the callback into a blocking iterator on another thread.
/// A dropped receiver is ignored.
pub struct ChannelListener {
    tx: mpsc::Sender<RouteChange>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::Sender<RouteChange>) -> Self {
        Self { tx }
    }
}

impl RouteListener for ChannelListener {
    fn on_route_change(&mut self, old: RouteCategory, new: RouteCategory) {
        if self.tx.send(RouteChange::new(old, new)).is_err() {
            tracing::debug!("Route change receiver dropped");
        }
    }
}
