use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast;

pub const GPIO_ON_EVENT: &str = "gpios.gpio.on";
pub const GPIO_OFF_EVENT: &str = "gpios.gpio.off";

/// Notification of a device switching on or off.
///
/// `init` is set for transitions applied while configuring a device, as
/// opposed to runtime edges and commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpioEvent {
    pub event: &'static str,
    pub device_id: String,
    pub gpio: String,
    pub init: bool,
    pub on: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub timestamp_ms: u64,
}

impl GpioEvent {
    pub fn on(device_id: &str, gpio: &str, init: bool) -> Self {
        Self {
            event: GPIO_ON_EVENT,
            device_id: device_id.to_string(),
            gpio: gpio.to_string(),
            init,
            on: true,
            duration: None,
            timestamp_ms: epoch_millis(),
        }
    }

    pub fn off(device_id: &str, gpio: &str, init: bool, duration: u64) -> Self {
        Self {
            event: GPIO_OFF_EVENT,
            device_id: device_id.to_string(),
            gpio: gpio.to_string(),
            init,
            on: false,
            duration: Some(duration),
            timestamp_ms: epoch_millis(),
        }
    }
}

pub struct EventCallbackHandler {
    event_tx: broadcast::Sender<GpioEvent>,
    event_history: RwLock<FxHashMap<String, VecDeque<GpioEvent>>>,
    event_history_capacity: usize,
}

impl EventCallbackHandler {
    pub fn new(broadcast_capacity: usize, event_history_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(broadcast_capacity.max(1));

        Self {
            event_tx,
            event_history: RwLock::new(FxHashMap::default()),
            event_history_capacity,
        }
    }

    pub fn dispatch(&self, event: GpioEvent) {
        {
            let mut history = self.event_history.write();
            let device_history = history.entry(event.device_id.clone()).or_default();
            while !device_history.is_empty() && device_history.len() >= self.event_history_capacity
            {
                device_history.pop_front();
            }
            if self.event_history_capacity > 0 {
                device_history.push_back(event.clone());
            }
        }
        // no subscriber is not an error
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GpioEvent> {
        self.event_tx.subscribe()
    }

    pub fn events(&self, device_id: &str, limit: Option<usize>) -> Vec<GpioEvent> {
        self.event_history
            .read()
            .get(device_id)
            .map(|d| {
                let events: Vec<GpioEvent> = if let Some(lim) = limit {
                    d.iter().rev().take(lim).cloned().collect()
                } else {
                    d.iter().cloned().collect()
                };
                if limit.is_some() {
                    events.into_iter().rev().collect()
                } else {
                    events
                }
            })
            .unwrap_or_default()
    }

    pub fn last_event(&self, device_id: &str) -> Option<GpioEvent> {
        self.event_history
            .read()
            .get(device_id)
            .and_then(|d| d.back().cloned())
    }

    pub fn forget(&self, device_id: &str) {
        self.event_history.write().remove(device_id);
    }
}

pub type EventHandler = Arc<EventCallbackHandler>;

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
