use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::device::Device;
use crate::topology::Topology;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpioUsage {
    pub assigned: bool,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinUsage {
    pub label: String,
    pub gpio: Option<GpioUsage>,
}

/// Usage of every header pin of `topology` given the live `devices`.
///
/// Pins that are not gpios (power, ground, eeprom) carry no `gpio` entry.
pub fn pins_usage<'a, I>(topology: &Topology, devices: I) -> BTreeMap<u32, PinUsage>
where
    I: IntoIterator<Item = &'a Device>,
{
    let owners: FxHashMap<&str, &str> = devices
        .into_iter()
        .map(|d| (d.gpio.as_str(), d.owner.as_str()))
        .collect();

    topology
        .pin_labels()
        .iter()
        .map(|(pin, label)| {
            let gpio = topology.contains(label).then(|| match owners.get(label) {
                Some(owner) => GpioUsage {
                    assigned: true,
                    owner: Some(owner.to_string()),
                },
                None => GpioUsage {
                    assigned: false,
                    owner: None,
                },
            });
            (
                *pin,
                PinUsage {
                    label: label.to_string(),
                    gpio,
                },
            )
        })
        .collect()
}
