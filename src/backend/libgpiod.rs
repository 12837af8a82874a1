use log::debug;
use std::path::PathBuf;

use libgpiod::{chip::Chip, line, request};
use parking_lot::{FairMutex, RwLock as PLRwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;

use crate::config::BoardConfig;
use crate::error::AppError;
use crate::gpio::{Direction, GpioBackend, Level, Pull};
use crate::topology;

/// Character-device driver. Physical pins are translated to line offsets
/// through the header layout of the configured board revision.
pub struct LibgpiodBackend {
    chip: String,
    revision: u32,
    pins: PLRwLock<FxHashMap<u32, PinHandle>>, // keyed by physical pin
}

struct PinHandle {
    line: u32,
    direction: Direction,
    gpiod_handle: FairMutex<GpiodHandle>,
}

struct GpiodHandle {
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self, AppError> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self { request })
    }

    fn open_chip(path: &str) -> Result<Chip, AppError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| AppError::Gpio(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, AppError> {
        let mut req_cfg =
            request::Config::new().map_err(|e| AppError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| AppError::Gpio(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| AppError::Gpio(format!("request lines: {e}")))
    }
}

impl LibgpiodBackend {
    pub fn new(board: &BoardConfig) -> Result<Self, AppError> {
        if topology::pin_count(board.revision) == 0 {
            return Err(AppError::Config(format!(
                "unsupported board revision {}",
                board.revision
            )));
        }

        Ok(Self {
            chip: board.chip.clone(),
            revision: board.revision,
            pins: PLRwLock::new(FxHashMap::default()),
        })
    }

    fn line_offset(&self, pin: u32) -> Result<u32, AppError> {
        topology::for_revision(self.revision)
            .gpio_at(pin)
            .and_then(topology::bcm_offset)
            .ok_or_else(|| AppError::Gpio(format!("pin {pin} is not a gpio")))
    }

    fn make_line_settings(
        direction: Direction,
        pull: Option<Pull>,
    ) -> Result<line::Settings, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;

        match direction {
            Direction::Output => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
                ls.set_drive(line::Drive::PushPull)
                    .map_err(|e| AppError::Gpio(format!("set drive: {e}")))?;
            }
            Direction::Input => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
                let bias = match pull {
                    None | Some(Pull::Off) => None,
                    Some(Pull::Up) => Some(line::Bias::PullUp),
                    Some(Pull::Down) => Some(line::Bias::PullDown),
                };
                ls.set_bias(bias)
                    .map_err(|e| AppError::Gpio(format!("set bias: {e}")))?;
            }
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, AppError> {
        let mut cfg =
            line::Config::new().map_err(|e| AppError::Gpio(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| AppError::Gpio(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }
}

impl GpioBackend for LibgpiodBackend {
    fn setup(&self, pin: u32, direction: Direction, pull: Option<Pull>) -> Result<(), AppError> {
        let offset = self.line_offset(pin)?;
        let line_settings = Self::make_line_settings(direction, pull)?;
        let line_cfg = Self::make_line_config(offset, line_settings)?;

        let pins = self.pins.upgradable_read();
        match pins.get(&pin) {
            Some(handle) => {
                handle
                    .gpiod_handle
                    .lock()
                    .request
                    .reconfigure_lines(&line_cfg)
                    .map_err(|e| AppError::Gpio(format!("reconfigure lines: {e}")))?;

                let mut pins = RwLockUpgradableReadGuard::upgrade(pins);
                if let Some(handle) = pins.get_mut(&pin) {
                    handle.direction = direction;
                }
            }
            None => {
                // upgradable guard is exclusive, nobody else requests this line meanwhile
                let gpiod_handle = FairMutex::new(GpiodHandle::new(&self.chip, &line_cfg)?);

                let mut pins = RwLockUpgradableReadGuard::upgrade(pins);
                pins.insert(
                    pin,
                    PinHandle {
                        line: offset,
                        direction,
                        gpiod_handle,
                    },
                );
            }
        }

        debug!("pin {pin} (line {offset}) set up as {direction:?} pull {pull:?}");
        Ok(())
    }

    fn read(&self, pin: u32) -> Result<Level, AppError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin)
            .ok_or_else(|| AppError::Gpio(format!("pin {pin} not configured, setup first")))?;

        let value = handle
            .gpiod_handle
            .lock()
            .request
            .value(handle.line)
            .map_err(|e| AppError::Gpio(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => Level::Low,
            line::Value::Active => Level::High,
        })
    }

    fn write(&self, pin: u32, level: Level) -> Result<(), AppError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin)
            .ok_or_else(|| AppError::Gpio(format!("pin {pin} not configured, setup first")))?;

        if handle.direction != Direction::Output {
            return Err(AppError::Gpio(format!(
                "pin {pin} must be in output mode to set value"
            )));
        }

        handle
            .gpiod_handle
            .lock()
            .request
            .set_value(
                handle.line,
                match level {
                    Level::Low => line::Value::InActive,
                    Level::High => line::Value::Active,
                },
            )
            .map_err(|e| AppError::Gpio(format!("set value: {e}")))?;
        Ok(())
    }

    fn board_revision(&self) -> u32 {
        self.revision
    }
}
