//! Blocking access to route category changes
//!
//! [`BluetoothRouteManager::changes`](crate::BluetoothRouteManager::changes)
//! installs a forwarding listener and hands back a [`RouteChangeIterator`].
//! The stream ends when that listener is replaced or the worker quits.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use hfp_route_core::{RouteCategory, RouteChange};

/// Category changes in the order the state machine reported them
#[derive(Debug)]
pub struct RouteChangeIterator {
    rx: mpsc::Receiver<RouteChange>,
}

impl RouteChangeIterator {
    pub(crate) fn new(rx: mpsc::Receiver<RouteChange>) -> Self {
        Self { rx }
    }

    pub fn try_recv(&self) -> Option<RouteChange> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<RouteChange> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Every change reported so far that has not been consumed yet
    pub fn pending(&self) -> Vec<RouteChange> {
        self.rx.try_iter().collect()
    }

    /// Skip changes until one lands in `category`
    ///
    /// Returns `None` if no such change arrives within `timeout` or the stream
    /// ends first.
    pub fn wait_for(&self, category: RouteCategory, timeout: Duration) -> Option<RouteChange> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let change = self.rx.recv_timeout(remaining).ok()?;
            if change.new == category {
                return Some(change);
            }
        }
    }
}

impl Iterator for RouteChangeIterator {
    type Item = RouteChange;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}
