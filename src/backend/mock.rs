use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use crate::error::AppError;
use crate::gpio::{Direction, GpioBackend, Level, Pull};

/// In-memory driver. Pins keep the last written level and input levels can be
/// forced with [`MockGpioBackend::set_level`].
pub struct MockGpioBackend {
    pins: RwLock<HashMap<u32, Mutex<MockPinState>>>, // keyed by physical pin
    revision: AtomicU32,
    fail_setup: AtomicBool,
    setups: Mutex<Vec<(u32, Direction, Option<Pull>)>>,
}

#[derive(Clone)]
struct MockPinState {
    direction: Option<Direction>,
    level: Level,
}

impl Default for MockPinState {
    fn default() -> Self {
        Self {
            direction: None,
            level: Level::High,
        }
    }
}

impl Default for MockGpioBackend {
    fn default() -> Self {
        Self::with_revision(3)
    }
}

impl MockGpioBackend {
    pub fn with_revision(revision: u32) -> Self {
        Self {
            pins: RwLock::new(HashMap::new()),
            revision: AtomicU32::new(revision),
            fail_setup: AtomicBool::new(false),
            setups: Mutex::new(Vec::new()),
        }
    }

    pub fn set_revision(&self, revision: u32) {
        self.revision.store(revision, Ordering::SeqCst);
    }

    /// Makes every following `setup` call fail.
    pub fn fail_setup(&self, fail: bool) {
        self.fail_setup.store(fail, Ordering::SeqCst);
    }

    /// Forces the level seen by `read`, as a signal on an input would.
    pub fn set_level(&self, pin: u32, level: Level) -> Result<(), AppError> {
        self.with_pin(pin, |state| state.level = level)
    }

    pub fn level(&self, pin: u32) -> Option<Level> {
        let pins = self.pins.read().ok()?;
        let state = pins.get(&pin)?.lock().ok()?;
        Some(state.level)
    }

    pub fn direction(&self, pin: u32) -> Option<Direction> {
        let pins = self.pins.read().ok()?;
        let state = pins.get(&pin)?.lock().ok()?;
        state.direction
    }

    pub fn setup_calls(&self) -> Vec<(u32, Direction, Option<Pull>)> {
        self.setups
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn with_pin<T>(
        &self,
        pin: u32,
        f: impl FnOnce(&mut MockPinState) -> T,
    ) -> Result<T, AppError> {
        let mut pins = self
            .pins
            .write()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
        let entry = pins
            .entry(pin)
            .or_insert_with(|| Mutex::new(MockPinState::default()));
        let mut state = entry
            .lock()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;

        Ok(f(&mut state))
    }
}

impl GpioBackend for MockGpioBackend {
    fn setup(&self, pin: u32, direction: Direction, pull: Option<Pull>) -> Result<(), AppError> {
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(AppError::Gpio(format!("setup of pin {pin} refused")));
        }

        self.setups
            .lock()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?
            .push((pin, direction, pull));

        self.with_pin(pin, |state| {
            state.direction = Some(direction);
            if direction == Direction::Input {
                state.level = match pull {
                    Some(Pull::Down) => Level::Low,
                    _ => Level::High,
                };
            }
        })
    }

    fn read(&self, pin: u32) -> Result<Level, AppError> {
        let pins = self
            .pins
            .read()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
        let entry = pins
            .get(&pin)
            .ok_or_else(|| AppError::Gpio(format!("pin {pin} not configured, setup first")))?;
        let state = entry
            .lock()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;

        Ok(state.level)
    }

    fn write(&self, pin: u32, level: Level) -> Result<(), AppError> {
        let pins = self
            .pins
            .read()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
        let entry = pins
            .get(&pin)
            .ok_or_else(|| AppError::Gpio(format!("pin {pin} not configured, setup first")))?;
        let mut state = entry
            .lock()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;

        if state.direction != Some(Direction::Output) {
            return Err(AppError::Gpio(format!(
                "pin {pin} must be in output mode to set value"
            )));
        }
        state.level = level;
        Ok(())
    }

    fn board_revision(&self) -> u32 {
        self.revision.load(Ordering::SeqCst)
    }
}
