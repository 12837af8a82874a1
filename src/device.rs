use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Reserved,
    Input,
    Output,
}

impl DeviceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMode::Reserved => "reserved",
            DeviceMode::Input => "input",
            DeviceMode::Output => "output",
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(DeviceMode::Reserved),
            "input" => Ok(DeviceMode::Input),
            "output" => Ok(DeviceMode::Output),
            _ => Err(AppError::invalid_value("mode", s)),
        }
    }
}

fn device_type() -> String {
    "gpio".to_string()
}

/// One gpio consumer, as stored by the device store.
///
/// `on` is the persisted state. The manager tracks the observed state of
/// every device separately and only writes it back here for `keep` devices.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Device {
    pub uuid: String,
    pub name: String,
    pub mode: DeviceMode,
    pub gpio: String,
    pub pin: u32,
    pub inverted: bool,
    pub keep: bool,
    pub owner: String,
    pub on: bool,
    #[serde(rename = "type", default = "device_type")]
    pub kind: String,
    pub subtype: String,
}

impl Device {
    pub fn reserved(name: &str, gpio: &str, pin: u32, usage: &str, owner: &str) -> Self {
        Self::new(name, DeviceMode::Reserved, gpio, pin, false, false, owner, usage)
    }

    pub fn configured(
        name: &str,
        mode: DeviceMode,
        gpio: &str,
        pin: u32,
        keep: bool,
        inverted: bool,
        owner: &str,
    ) -> Self {
        Self::new(name, mode, gpio, pin, keep, inverted, owner, mode.as_str())
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        name: &str,
        mode: DeviceMode,
        gpio: &str,
        pin: u32,
        keep: bool,
        inverted: bool,
        owner: &str,
        subtype: &str,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            mode,
            gpio: gpio.to_string(),
            pin,
            inverted,
            keep,
            owner: owner.to_string(),
            on: false,
            kind: device_type(),
            subtype: subtype.to_string(),
        }
    }

    /// Usage label of a reserved device.
    pub fn usage(&self) -> Option<&str> {
        (self.mode == DeviceMode::Reserved).then_some(self.subtype.as_str())
    }

    /// Copy of the device reporting `observed` instead of the persisted state.
    pub fn with_observed(&self, observed: Option<bool>) -> Self {
        let mut device = self.clone();
        if let Some(on) = observed {
            device.on = on;
        }
        device
    }
}
