use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::device::{Device, DeviceMode};
use crate::error::AppError;
use crate::events::{EventCallbackHandler, EventHandler, GpioEvent};
use crate::store::DeviceStore;
use crate::topology::{self, GpioInfo, Topology};
use crate::usage::{self, PinUsage};
use crate::watcher::{InputWatcher, OffCallback, OnCallback};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    High,
}

impl From<bool> for Level {
    fn from(value: bool) -> Self {
        if value { Level::High } else { Level::Low }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> Self {
        matches!(level, Level::High)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pull {
    Off,
    Up,
    Down,
}

/// Raw pin access, addressed by physical header pin.
pub trait GpioBackend: Send + Sync {
    fn setup(&self, pin: u32, direction: Direction, pull: Option<Pull>) -> Result<(), AppError>;
    fn read(&self, pin: u32) -> Result<Level, AppError>;
    fn write(&self, pin: u32, level: Level) -> Result<(), AppError>;
    fn board_revision(&self) -> u32;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardInfo {
    pub revision: u32,
    pub pinsnumber: usize,
}

fn require_str<'a>(param: &str, value: Option<&'a str>) -> Result<&'a str, AppError> {
    match value {
        None => Err(AppError::MissingParameter(param.to_string())),
        Some("") => Err(AppError::invalid_value(param, "")),
        Some(value) => Ok(value),
    }
}

fn require_bool(param: &str, value: Option<bool>) -> Result<bool, AppError> {
    value.ok_or_else(|| AppError::MissingParameter(param.to_string()))
}

/// Registry of gpio devices.
///
/// Reservations, additions, updates, deletions and usage snapshots are
/// serialized by the registry lock. Input devices get an [`InputWatcher`]
/// whose callbacks reach the manager through a weak reference and never take
/// the registry lock, so deconfiguring a device can always join its watcher.
/// Rewrites of a stored record go through the persist lock, which callbacks
/// and updates both take around a fresh read of the record.
pub struct GpioManager<B: GpioBackend> {
    config: Arc<AppConfig>,
    backend: Arc<B>,
    store: Arc<dyn DeviceStore>,
    event_handler: EventHandler,
    registry: Mutex<()>,
    persist: Mutex<()>,
    watchers: Mutex<FxHashMap<String, InputWatcher>>,
    observed: RwLock<FxHashMap<String, bool>>,
    on_since: Mutex<FxHashMap<String, Instant>>,
    this: Weak<Self>,
}

impl<B: GpioBackend + 'static> GpioManager<B> {
    pub fn new(
        config: Arc<AppConfig>,
        backend: Arc<B>,
        store: Arc<dyn DeviceStore>,
    ) -> Arc<Self> {
        let event_handler = Arc::new(EventCallbackHandler::new(
            config.broadcast_capacity,
            config.event_history_capacity,
        ));

        Arc::new_cyclic(|this| Self {
            config,
            backend,
            store,
            event_handler,
            registry: Mutex::new(()),
            persist: Mutex::new(()),
            watchers: Mutex::new(FxHashMap::default()),
            observed: RwLock::new(FxHashMap::default()),
            on_since: Mutex::new(FxHashMap::default()),
            this: this.clone(),
        })
    }

    fn topology(&self) -> &'static Topology {
        topology::for_revision(self.backend.board_revision())
    }

    fn gpio_info(&self, gpio: &str) -> Result<&'static GpioInfo, AppError> {
        self.topology().gpio(gpio).ok_or_else(|| {
            AppError::InvalidParameter(format!(
                "Gpio \"{gpio}\" does not exist for this raspberry pi"
            ))
        })
    }

    fn normalize_owner(&self, owner: &str) -> String {
        self.config.module.normalize_owner(owner)
    }

    fn observed_on(&self, device: &Device) -> bool {
        self.observed
            .read()
            .get(&device.uuid)
            .copied()
            .unwrap_or(device.on)
    }

    fn existing_device(&self, uuid: &str) -> Result<Device, AppError> {
        self.store.get_device(uuid).ok_or_else(|| {
            AppError::InvalidParameter(format!("Device \"{uuid}\" does not exist"))
        })
    }

    pub fn get_module_config(&self) -> BoardInfo {
        BoardInfo {
            revision: self.backend.board_revision(),
            pinsnumber: self.get_pins_number(),
        }
    }

    pub fn get_raspi_gpios(&self) -> &'static BTreeMap<&'static str, GpioInfo> {
        self.topology().gpios()
    }

    pub fn get_pins_number(&self) -> usize {
        self.topology().pin_count()
    }

    pub fn get_pins_usage(&self) -> BTreeMap<u32, PinUsage> {
        let _registry = self.registry.lock();
        let devices = self.store.devices();

        usage::pins_usage(self.topology(), &devices)
    }

    pub fn get_assigned_gpios(&self) -> Vec<String> {
        self.store.devices().into_iter().map(|d| d.gpio).collect()
    }

    pub fn get_reserved_gpios(&self, usage: Option<&str>) -> Result<Vec<Device>, AppError> {
        let usage = usage.ok_or_else(|| AppError::MissingParameter("usage".into()))?;

        Ok(self
            .store
            .devices()
            .into_iter()
            .filter(|d| d.usage() == Some(usage))
            .collect())
    }

    pub fn is_reserved_gpio(&self, gpio: &str) -> bool {
        self.store
            .devices()
            .iter()
            .any(|d| d.gpio == gpio && d.mode == DeviceMode::Reserved)
    }

    /// Raw level of a gpio, regardless of any device bound to it.
    pub fn is_gpio_on(&self, gpio: &str) -> Result<bool, AppError> {
        let info = self
            .topology()
            .gpio(gpio)
            .ok_or_else(|| AppError::invalid_value("gpio", gpio))?;

        Ok(self.backend.read(info.pin)?.into())
    }

    /// Devices as the framework sees them: the observed state wins over the
    /// persisted one.
    pub fn get_module_devices(&self) -> HashMap<String, Device> {
        let observed = self.observed.read();
        self.store
            .devices()
            .into_iter()
            .map(|d| {
                let device = d.with_observed(observed.get(&d.uuid).copied());
                (device.uuid.clone(), device)
            })
            .collect()
    }

    pub fn get_device(&self, uuid: &str) -> Result<Device, AppError> {
        let device = self.existing_device(uuid)?;
        let on = self.observed_on(&device);

        Ok(device.with_observed(Some(on)))
    }

    pub fn reserve_gpio(
        &self,
        name: Option<&str>,
        gpio: Option<&str>,
        usage: Option<&str>,
        owner: &str,
    ) -> Result<Device, AppError> {
        let name = require_str("name", name)?;
        let gpio = require_str("gpio", gpio)?;
        let usage = require_str("usage", usage)?;
        let info = self.gpio_info(gpio)?;
        let owner = self.normalize_owner(owner);

        let _registry = self.registry.lock();
        let devices = self.store.devices();

        if let Some(existing) = devices.iter().find(|d| d.gpio == gpio) {
            return match existing.usage() {
                Some(reserved_for) if reserved_for != usage => {
                    Err(AppError::InvalidParameter(format!(
                        "Gpio \"{gpio}\" is already reserved for \"{reserved_for}\" usage"
                    )))
                }
                Some(_) if existing.name == name && existing.owner == owner => {
                    debug!("Gpio {gpio} already reserved by {owner} as \"{name}\"");
                    Ok(existing.clone())
                }
                _ => Err(AppError::InvalidParameter(format!(
                    "Gpio \"{gpio}\" is already used by other application"
                ))),
            };
        }
        if devices.iter().any(|d| d.name == name) {
            return Err(AppError::InvalidParameter(format!(
                "Name \"{name}\" is already used"
            )));
        }

        let device = Device::reserved(name, gpio, info.pin, usage, &owner);
        self.store.add_device(&device).map_err(|e| {
            error!("Unable to store reserved gpio {gpio}: {e}");
            AppError::CommandError("Unable to add device".into())
        })?;
        info!("Gpio {gpio} reserved by {owner} for {usage} usage");

        Ok(device)
    }

    pub fn add_gpio(
        &self,
        name: Option<&str>,
        gpio: Option<&str>,
        mode: Option<&str>,
        keep: Option<bool>,
        inverted: Option<bool>,
        owner: &str,
    ) -> Result<Device, AppError> {
        let name = require_str("name", name)?;
        let gpio = require_str("gpio", gpio)?;
        let info = self.gpio_info(gpio)?;
        let mode_name = require_str("mode", mode)?;
        let mode = match mode_name.parse::<DeviceMode>()? {
            DeviceMode::Reserved => return Err(AppError::invalid_value("mode", mode_name)),
            mode => mode,
        };
        let keep = require_bool("keep", keep)?;
        let inverted = require_bool("inverted", inverted)?;
        let owner = self.normalize_owner(owner);

        let _registry = self.registry.lock();
        let devices = self.store.devices();

        if devices.iter().any(|d| d.name == name) {
            return Err(AppError::InvalidParameter(format!(
                "Name \"{name}\" is already used"
            )));
        }
        if devices.iter().any(|d| d.gpio == gpio) {
            return Err(AppError::InvalidParameter(format!(
                "Gpio \"{gpio}\" is already used by other application"
            )));
        }

        let device = Device::configured(name, mode, gpio, info.pin, keep, inverted, &owner);
        self.store.add_device(&device).map_err(|e| {
            error!("Unable to store gpio {gpio}: {e}");
            AppError::CommandError("Unable to add device".into())
        })?;
        info!("Gpio {gpio} added as {mode} by {owner}");

        if !self.configure(&device) {
            error!("Device {} stored but gpio {gpio} is not configured", device.uuid);
        }

        Ok(device)
    }

    pub fn update_gpio(
        &self,
        uuid: Option<&str>,
        name: Option<&str>,
        keep: Option<bool>,
        inverted: Option<bool>,
        owner: &str,
    ) -> Result<Device, AppError> {
        let uuid = require_str("device_uuid", uuid)?;

        let _registry = self.registry.lock();
        let mut device = self.existing_device(uuid)?;

        let name = require_str("name", name)?;
        let keep = require_bool("keep", keep)?;
        let inverted = require_bool("inverted", inverted)?;
        if self.normalize_owner(owner) != device.owner {
            return Err(AppError::Unauthorized(
                "Device can only be updated by its owner".into(),
            ));
        }
        if self
            .store
            .devices()
            .iter()
            .any(|d| d.uuid != uuid && d.name == name)
        {
            return Err(AppError::InvalidParameter(format!(
                "Name \"{name}\" is already used"
            )));
        }

        device.name = name.to_string();
        device.keep = keep;
        device.inverted = inverted;

        if !self.reconfigure(&device) {
            warn!("Unable to reconfigure gpio {} of device {uuid}", device.gpio);
        }

        {
            let _persist = self.persist.lock();
            // the on state may have been persisted since the first read
            let mut stored = self.existing_device(uuid)?;
            stored.name = device.name.clone();
            stored.keep = keep;
            stored.inverted = inverted;
            self.store.update_device(&stored).map_err(|e| {
                error!("Unable to store device {uuid}: {e}");
                AppError::CommandError(format!("Failed to update device \"{uuid}\""))
            })?;
            device = stored;
        }
        info!("Device {uuid} updated");

        let on = self.observed_on(&device);
        Ok(device.with_observed(Some(on)))
    }

    pub fn delete_gpio(&self, uuid: Option<&str>, owner: &str) -> Result<bool, AppError> {
        let uuid = require_str("device_uuid", uuid)?;

        let _registry = self.registry.lock();
        let device = self.existing_device(uuid)?;
        if self.normalize_owner(owner) != device.owner {
            return Err(AppError::Unauthorized(
                "Device can only be deleted by its owner".into(),
            ));
        }

        if !self.deconfigure(&device) {
            warn!("Unable to deconfigure gpio {} of device {uuid}", device.gpio);
        }

        self.store.delete_device(uuid).map_err(|e| {
            error!("Unable to delete stored device {uuid}: {e}");
            AppError::CommandError(format!("Failed to delete device \"{uuid}\""))
        })?;
        self.observed.write().remove(uuid);
        self.on_since.lock().remove(uuid);
        self.event_handler.forget(uuid);
        info!("Device {uuid} on gpio {} deleted", device.gpio);

        Ok(true)
    }

    /// Applies the device mode to its pin. Failures are logged and reported
    /// as `false`, leaving no watcher behind.
    pub fn configure(&self, device: &Device) -> bool {
        let result = match device.mode {
            DeviceMode::Reserved => Ok(()),
            DeviceMode::Output => self.configure_output(device),
            DeviceMode::Input => self
                .backend
                .setup(device.pin, Direction::Input, Some(Pull::Up))
                .and_then(|_| self.launch_input_watcher(device)),
        };

        match result {
            Ok(()) => {
                debug!("Gpio {} configured as {}", device.gpio, device.mode);
                true
            }
            Err(e) => {
                error!(
                    "Unable to configure gpio {} of device {}: {e}",
                    device.gpio, device.uuid
                );
                false
            }
        }
    }

    /// Stops and joins the watcher bound to the device, if any.
    pub fn deconfigure(&self, device: &Device) -> bool {
        let mut watchers = self.watchers.lock();
        let Some(watcher) = watchers.get_mut(&device.uuid) else {
            return true;
        };

        watcher.stop();
        let joined = watcher.join();
        watchers.remove(&device.uuid);
        debug!("Input watcher of device {} removed", device.uuid);

        joined
    }

    pub fn reconfigure(&self, device: &Device) -> bool {
        if !self.deconfigure(device) {
            return false;
        }

        let result = match device.mode {
            DeviceMode::Reserved => Ok(()),
            DeviceMode::Input => self.launch_input_watcher(device),
            DeviceMode::Output => self.write_level(device, self.observed_on(device)),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                error!("Unable to reconfigure gpio {}: {e}", device.gpio);
                false
            }
        }
    }

    fn configure_output(&self, device: &Device) -> Result<(), AppError> {
        self.backend.setup(device.pin, Direction::Output, None)?;
        self.write_level(device, device.on)?;
        self.set_state(device, device.on)?;

        let event = if device.on {
            GpioEvent::on(&device.uuid, &device.gpio, true)
        } else {
            GpioEvent::off(&device.uuid, &device.gpio, true, 0)
        };
        self.event_handler.dispatch(event);

        Ok(())
    }

    fn launch_input_watcher(&self, device: &Device) -> Result<(), AppError> {
        let active_level = if device.inverted {
            Level::High
        } else {
            Level::Low
        };
        let baseline = self.backend.read(device.pin)?;

        let this = self.this.clone();
        let on_callback: OnCallback = Arc::new(move |uuid: &str| match this.upgrade() {
            Some(manager) => manager.input_on(uuid),
            None => Ok(()),
        });
        let this = self.this.clone();
        let off_callback: OffCallback = Arc::new(move |uuid: &str, duration: u64| {
            match this.upgrade() {
                Some(manager) => manager.input_off(uuid, duration),
                None => Ok(()),
            }
        });

        let backend: Arc<dyn GpioBackend> = self.backend.clone();
        let mut watcher =
            InputWatcher::new(device.pin, &device.uuid, backend, on_callback, off_callback)
                .active_level(active_level)
                .baseline(baseline)
                .poll_interval(self.config.watcher.poll_interval())
                .debounce_ticks(self.config.watcher.debounce_ticks);
        watcher.start()?;

        self.observed
            .write()
            .insert(device.uuid.clone(), baseline == active_level);
        let previous = self.watchers.lock().insert(device.uuid.clone(), watcher);
        // dropping a watcher stops and joins it
        drop(previous);

        Ok(())
    }

    fn write_level(&self, device: &Device, on: bool) -> Result<(), AppError> {
        self.backend
            .write(device.pin, Level::from(on != device.inverted))
    }

    /// Records a transition and returns how long the device stayed on.
    fn set_state(&self, device: &Device, on: bool) -> Result<u64, AppError> {
        self.observed.write().insert(device.uuid.clone(), on);

        let duration = {
            let mut on_since = self.on_since.lock();
            if on {
                on_since.insert(device.uuid.clone(), Instant::now());
                0
            } else {
                on_since
                    .remove(&device.uuid)
                    .map(|at| at.elapsed().as_millis() as u64)
                    .unwrap_or(0)
            }
        };

        let _persist = self.persist.lock();
        let Some(mut stored) = self.store.get_device(&device.uuid) else {
            return Ok(duration);
        };
        if stored.keep && stored.on != on {
            stored.on = on;
            self.store.update_device(&stored).map_err(|e| {
                error!("Unable to persist state of device {}: {e}", device.uuid);
                AppError::CommandError(format!("Failed to update device \"{}\"", device.uuid))
            })?;
        }

        Ok(duration)
    }

    fn output_device(&self, uuid: &str, action: &str) -> Result<Device, AppError> {
        let device = self
            .store
            .get_device(uuid)
            .ok_or_else(|| AppError::CommandError("Device not found".into()))?;
        if device.mode != DeviceMode::Output {
            return Err(AppError::CommandError(format!(
                "Gpio \"{}\" configured as \"{}\" cannot be turned {action}",
                device.gpio, device.mode
            )));
        }

        Ok(device)
    }

    pub fn turn_on(&self, uuid: &str) -> Result<(), AppError> {
        let device = self.output_device(uuid, "on")?;

        self.write_level(&device, true)?;
        self.set_state(&device, true)?;
        self.event_handler
            .dispatch(GpioEvent::on(&device.uuid, &device.gpio, false));

        Ok(())
    }

    pub fn turn_off(&self, uuid: &str) -> Result<(), AppError> {
        let device = self.output_device(uuid, "off")?;

        self.write_level(&device, false)?;
        let duration = self.set_state(&device, false)?;
        self.event_handler
            .dispatch(GpioEvent::off(&device.uuid, &device.gpio, false, duration));

        Ok(())
    }

    pub fn is_on(&self, uuid: &str) -> Result<bool, AppError> {
        let device = self
            .store
            .get_device(uuid)
            .ok_or_else(|| AppError::CommandError("Device not found".into()))?;
        if device.mode == DeviceMode::Reserved {
            return Err(AppError::CommandError(format!(
                "Gpio \"{}\" configured as \"{}\" cannot be checked",
                device.gpio, device.mode
            )));
        }

        Ok(self.observed_on(&device))
    }

    /// Turns off every output device currently on.
    pub fn reset_gpios(&self) {
        for device in self.store.devices() {
            if device.mode != DeviceMode::Output || !self.observed_on(&device) {
                continue;
            }
            if let Err(e) = self.turn_off(&device.uuid) {
                warn!("Unable to reset gpio {}: {e}", device.gpio);
            }
        }
    }

    /// Called by input watchers when a device turns on.
    pub fn input_on(&self, uuid: &str) -> Result<(), AppError> {
        let device = self
            .store
            .get_device(uuid)
            .ok_or_else(|| AppError::CommandError(format!("Device \"{uuid}\" not found")))?;

        self.set_state(&device, true)?;
        self.event_handler
            .dispatch(GpioEvent::on(&device.uuid, &device.gpio, false));

        Ok(())
    }

    /// Called by input watchers when a device turns off after `duration` ms.
    pub fn input_off(&self, uuid: &str, duration: u64) -> Result<(), AppError> {
        let device = self
            .store
            .get_device(uuid)
            .ok_or_else(|| AppError::CommandError(format!("Device \"{uuid}\" not found")))?;

        self.set_state(&device, false)?;
        self.event_handler
            .dispatch(GpioEvent::off(&device.uuid, &device.gpio, false, duration));

        Ok(())
    }

    /// Configures every stored device.
    pub fn on_start(&self) {
        let _registry = self.registry.lock();
        let devices = self.store.devices();
        let configured = devices.iter().filter(|d| self.configure(d)).count();

        info!(
            "{configured}/{} devices configured on board revision {}",
            devices.len(),
            self.backend.board_revision()
        );
    }

    /// Stops every input watcher.
    pub fn on_stop(&self) {
        let mut watchers: Vec<InputWatcher> = self
            .watchers
            .lock()
            .drain()
            .map(|(_, watcher)| watcher)
            .collect();

        // signal all loops first so they wind down together
        for watcher in watchers.iter_mut() {
            watcher.stop();
        }
        for watcher in watchers.iter_mut() {
            watcher.join();
        }
        info!("{} input watchers stopped", watchers.len());
    }

    pub fn has_watcher(&self, uuid: &str) -> bool {
        self.watchers
            .lock()
            .get(uuid)
            .is_some_and(|watcher| watcher.is_running())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<GpioEvent> {
        self.event_handler.subscribe()
    }

    pub fn get_events(
        &self,
        uuid: &str,
        limit: Option<usize>,
    ) -> Result<Vec<GpioEvent>, AppError> {
        self.existing_device(uuid)?;

        Ok(self.event_handler.events(uuid, limit))
    }

    pub fn get_last_event(&self, uuid: &str) -> Result<Option<GpioEvent>, AppError> {
        self.existing_device(uuid)?;

        Ok(self.event_handler.last_event(uuid))
    }
}
