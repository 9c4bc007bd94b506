//! Background worker thread for route processing
//!
//! Spawns a thread with its own single-threaded tokio runtime that owns the
//! route state machine. Messages from the sync `BluetoothRouteManager` arrive
//! on an unbounded channel; between messages the worker sleeps until the next
//! retry or timeout is due.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use hfp_route_core::{Message, RouteStateMachine};
use tokio::sync::mpsc::UnboundedReceiver;

/// Spawns the background route worker thread
///
/// The worker exits after processing a `Quit` message, or after every sender
/// has been dropped.
pub fn spawn_route_worker(
    machine: RouteStateMachine,
    message_rx: UnboundedReceiver<Message>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("hfp-route-worker".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!("Failed to create tokio runtime for route worker: {}", e);
                    return;
                }
            };

            rt.block_on(run_route_loop(machine, message_rx));
        })
}

/// Main loop running inside the tokio runtime
async fn run_route_loop(mut machine: RouteStateMachine, mut message_rx: UnboundedReceiver<Message>) {
    tracing::info!("Route worker started");

    loop {
        machine.run_pending();
        if machine.is_quit() {
            break;
        }

        let deadline = machine.next_deadline();

        tokio::select! {
            message = message_rx.recv() => {
                match message {
                    Some(first) => {
                        // Take everything already sent so it is handled in one pass
                        let mut next = Some(first);
                        while let Some(message) = next {
                            if let Err(e) = machine.post(message) {
                                tracing::debug!("Dropping message: {}", e);
                            }
                            next = message_rx.try_recv().ok();
                        }
                    }
                    None => {
                        tracing::info!("Route manager dropped, shutting down worker");
                        machine.quit();
                        break;
                    }
                }
            }

            _ = sleep_until_due(deadline) => {}
        }
    }

    tracing::info!("Route worker shut down");
}

async fn sleep_until_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
