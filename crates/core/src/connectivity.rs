//! The one place that watches the device link. Other components subscribe
//! to [`ConnectivityObserver::bus`] instead of polling the device themselves.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bus::NotificationBus;
use crate::cancel::CancellationToken;
use crate::platform::Device;
use crate::types::ConnectionState;

pub struct ConnectivityObserver {
    device: Arc<dyn Device>,
    interval: Duration,
    state: Mutex<Option<ConnectionState>>,
    bus: NotificationBus<ConnectionState>,
    stop: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityObserver {
    pub fn new(device: Arc<dyn Device>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            device,
            interval,
            state: Mutex::new(None),
            bus: NotificationBus::new("connectivity"),
            stop: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn bus(&self) -> &NotificationBus<ConnectionState> {
        &self.bus
    }

    /// Last observed link state, `None` before the first poll.
    pub fn state(&self) -> Option<ConnectionState> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Poll once and publish if the link state changed. Returns the state.
    pub fn poll(&self) -> ConnectionState {
        let now = if self.device.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        let changed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let changed = *state != Some(now);
            *state = Some(now);
            changed
        };
        if changed {
            match now {
                ConnectionState::Connected => tracing::info!(target: "connectivity", device = self.device.name(), "device connected"),
                ConnectionState::Disconnected => tracing::warn!(target: "connectivity", device = self.device.name(), "device disconnected"),
            }
            self.bus.notify(&now);
        }
        now
    }

    /// Start the polling thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.stop.reset();
        let this = Arc::clone(self);
        *worker = Some(thread::spawn(move || {
            loop {
                this.poll();
                if this.stop.wait(this.interval) {
                    break;
                }
            }
            tracing::debug!(target: "connectivity", "observer stopped");
        }));
    }

    pub fn stop(&self) {
        self.stop.request();
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}
