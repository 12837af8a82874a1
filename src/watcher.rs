//! Polling edge detection for input devices.
//!
//! Each watcher owns one thread that reads its pin every poll interval. A new
//! level is accepted once it has been read on `debounce_ticks` consecutive
//! ticks, then reported through the on/off callbacks. Off callbacks carry the
//! time elapsed since the matching on transition.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::error::AppError;
use crate::gpio::{GpioBackend, Level};

pub type OnCallback = Arc<dyn Fn(&str) -> Result<(), AppError> + Send + Sync>;
pub type OffCallback = Arc<dyn Fn(&str, u64) -> Result<(), AppError> + Send + Sync>;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct InputWatcher {
    pin: u32,
    uuid: String,
    pending: Option<WatchLoop>,
    poll_interval: Duration,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

struct WatchLoop {
    pin: u32,
    uuid: String,
    backend: Arc<dyn GpioBackend>,
    on_callback: OnCallback,
    off_callback: OffCallback,
    initial_state: Option<bool>,
    confirmed: Option<Level>,
    candidate: Option<(Level, u32)>,
    active_level: Level,
    debounce_ticks: u32,
    last_on: Option<Instant>,
}

impl InputWatcher {
    pub fn new(
        pin: u32,
        uuid: &str,
        backend: Arc<dyn GpioBackend>,
        on_callback: OnCallback,
        off_callback: OffCallback,
    ) -> Self {
        Self {
            pin,
            uuid: uuid.to_string(),
            pending: Some(WatchLoop {
                pin,
                uuid: uuid.to_string(),
                backend,
                on_callback,
                off_callback,
                initial_state: None,
                confirmed: None,
                candidate: None,
                active_level: Level::Low,
                debounce_ticks: 1,
                last_on: None,
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_tx: None,
            handle: None,
        }
    }

    /// Logical state reported once at startup, regardless of what the pin
    /// reads. `true` fires the on callback, `false` the off callback.
    pub fn initial_state(mut self, on: Option<bool>) -> Self {
        if let Some(state) = self.pending.as_mut() {
            state.initial_state = on;
        }
        self
    }

    /// Level considered current at startup. No callback fires for it.
    pub fn baseline(mut self, level: Level) -> Self {
        if let Some(state) = self.pending.as_mut() {
            state.confirmed = Some(level);
        }
        self
    }

    /// Level meaning "on". Inputs are pulled up, so a closed contact reads low.
    pub fn active_level(mut self, level: Level) -> Self {
        if let Some(state) = self.pending.as_mut() {
            state.active_level = level;
        }
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn debounce_ticks(mut self, ticks: u32) -> Self {
        if let Some(state) = self.pending.as_mut() {
            state.debounce_ticks = ticks.max(1);
        }
        self
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn start(&mut self) -> Result<(), AppError> {
        let Some(state) = self.pending.take() else {
            return Err(AppError::CommandError(format!(
                "Input watcher of device \"{}\" already started",
                self.uuid
            )));
        };

        let (stop_tx, stop_rx) = mpsc::channel();
        let poll_interval = self.poll_interval;
        let handle = thread::Builder::new()
            .name(format!("gpio-watch-{}", self.pin))
            .spawn(move || state.run(stop_rx, poll_interval))
            .map_err(|e| AppError::Gpio(format!("spawn watcher for pin {}: {e}", self.pin)))?;

        self.stop_tx = Some(stop_tx);
        self.handle = Some(handle);
        Ok(())
    }

    /// Asks the loop to exit. It wakes up immediately instead of finishing its
    /// current sleep.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }

    /// Waits for the loop thread. Returns false if it panicked.
    pub fn join(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        // a callback may drop the last manager reference from inside the loop
        if handle.thread().id() == thread::current().id() {
            return true;
        }
        match handle.join() {
            Ok(()) => true,
            Err(_) => {
                error!("Input watcher of device {} panicked", self.uuid);
                false
            }
        }
    }
}

impl Drop for InputWatcher {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

impl WatchLoop {
    fn run(mut self, stop_rx: mpsc::Receiver<()>, poll_interval: Duration) {
        debug!("Input watcher started on pin {} for device {}", self.pin, self.uuid);
        loop {
            self.tick();
            match stop_rx.recv_timeout(poll_interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("Input watcher stopped on pin {} for device {}", self.pin, self.uuid);
    }

    fn tick(&mut self) {
        if let Some(on) = self.initial_state.take() {
            let level = if on {
                self.active_level
            } else {
                self.inactive_level()
            };
            self.confirmed = Some(level);
            self.notify(level);
            return;
        }

        let level = match self.backend.read(self.pin) {
            Ok(level) => level,
            Err(e) => {
                warn!("Unable to read pin {}: {e}", self.pin);
                return;
            }
        };

        if self.confirmed == Some(level) {
            self.candidate = None;
            return;
        }

        let seen = match self.candidate {
            Some((candidate, count)) if candidate == level => count + 1,
            _ => 1,
        };
        if seen < self.debounce_ticks {
            self.candidate = Some((level, seen));
            return;
        }

        self.candidate = None;
        self.confirmed = Some(level);
        self.notify(level);
    }

    fn inactive_level(&self) -> Level {
        match self.active_level {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }

    fn notify(&mut self, level: Level) {
        let result = if level == self.active_level {
            self.last_on = Some(Instant::now());
            (self.on_callback)(&self.uuid)
        } else {
            let duration = self
                .last_on
                .take()
                .map(|at| at.elapsed().as_millis() as u64)
                .unwrap_or(0);
            (self.off_callback)(&self.uuid, duration)
        };

        if let Err(e) = result {
            error!(
                "Input watcher of device {} failed to report level {level:?}: {e}",
                self.uuid
            );
        }
    }
}
