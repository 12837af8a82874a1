//! Raspberry Pi header layouts, keyed by board revision.
//!
//! Revisions 1 and 2 expose a 26-pin header, revision 3 boards expose the
//! 40-pin header whose first 26 pins match revision 2.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde::Serialize;

struct GpioEntry {
    name: &'static str,
    pin: u32,
    labels: &'static [&'static str],
}

const fn gpio(name: &'static str, pin: u32, labels: &'static [&'static str]) -> GpioEntry {
    GpioEntry { name, pin, labels }
}

const GPIOS_REV2: &[GpioEntry] = &[
    gpio("GPIO2", 3, &["SDA1"]),
    gpio("GPIO3", 5, &["SCL1"]),
    gpio("GPIO4", 7, &["GPCLK0", "1-WIRE"]),
    gpio("GPIO14", 8, &["TXD0"]),
    gpio("GPIO15", 10, &["RXD0"]),
    gpio("GPIO17", 11, &[]),
    gpio("GPIO18", 12, &["PCM_CLK", "PWM0"]),
    gpio("GPIO27", 13, &[]),
    gpio("GPIO22", 15, &[]),
    gpio("GPIO23", 16, &[]),
    gpio("GPIO24", 18, &[]),
    gpio("GPIO10", 19, &["SPI0_MOSI"]),
    gpio("GPIO9", 21, &["SPI0_MISO"]),
    gpio("GPIO25", 22, &[]),
    gpio("GPIO11", 23, &["SPI0_SCLK"]),
    gpio("GPIO8", 24, &["SPI0_CE0"]),
    gpio("GPIO7", 26, &["SPI0_CE1"]),
];

const GPIOS_REV3: &[GpioEntry] = &[
    gpio("GPIO5", 29, &["GPCLK1"]),
    gpio("GPIO6", 31, &["GPCLK2"]),
    gpio("GPIO12", 32, &["PWM0"]),
    gpio("GPIO13", 33, &["PWM1"]),
    gpio("GPIO19", 35, &["PCM_FS", "SPI1_MISO"]),
    gpio("GPIO16", 36, &["SPI1_CE2"]),
    gpio("GPIO26", 37, &[]),
    gpio("GPIO20", 38, &["PCM_DIN", "SPI1_MOSI"]),
    gpio("GPIO21", 40, &["PCM_DOUT", "SPI1_SCLK"]),
];

// header pins that are not usable as gpio
const PINS_REV2: &[(u32, &str)] = &[
    (1, "3.3v"),
    (2, "5v"),
    (4, "5v"),
    (6, "GND"),
    (9, "GND"),
    (14, "GND"),
    (17, "3.3v"),
    (20, "GND"),
    (25, "GND"),
];

const PINS_REV3: &[(u32, &str)] = &[
    (27, "ID_SD"),
    (28, "ID_SC"),
    (30, "GND"),
    (34, "GND"),
    (39, "GND"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpioInfo {
    pub pin: u32,
    pub labels: Vec<&'static str>,
}

/// Immutable pin table of one board revision.
#[derive(Debug, Default)]
pub struct Topology {
    revision: u32,
    gpios: BTreeMap<&'static str, GpioInfo>,
    pins: BTreeMap<u32, &'static str>,
}

impl Topology {
    fn build(
        revision: u32,
        gpio_tables: &[&[GpioEntry]],
        pin_tables: &[&[(u32, &'static str)]],
    ) -> Self {
        let mut gpios = BTreeMap::new();
        let mut pins = BTreeMap::new();

        for entry in gpio_tables.iter().flat_map(|t| t.iter()) {
            gpios.insert(
                entry.name,
                GpioInfo {
                    pin: entry.pin,
                    labels: entry.labels.to_vec(),
                },
            );
            pins.insert(entry.pin, entry.name);
        }
        for (pin, label) in pin_tables.iter().flat_map(|t| t.iter()) {
            pins.insert(*pin, *label);
        }

        Self {
            revision,
            gpios,
            pins,
        }
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn gpios(&self) -> &BTreeMap<&'static str, GpioInfo> {
        &self.gpios
    }

    pub fn gpio(&self, name: &str) -> Option<&GpioInfo> {
        self.gpios.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.gpios.contains_key(name)
    }

    /// Label of every header pin, gpio pins labelled with their logical name.
    pub fn pin_labels(&self) -> &BTreeMap<u32, &'static str> {
        &self.pins
    }

    /// Logical name of the gpio wired to a physical pin.
    pub fn gpio_at(&self, pin: u32) -> Option<&'static str> {
        self.pins
            .get(&pin)
            .copied()
            .filter(|label| self.gpios.contains_key(label))
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }
}

static REV1: LazyLock<Topology> =
    LazyLock::new(|| Topology::build(1, &[GPIOS_REV2], &[PINS_REV2]));
static REV2: LazyLock<Topology> =
    LazyLock::new(|| Topology::build(2, &[GPIOS_REV2], &[PINS_REV2]));
static REV3: LazyLock<Topology> = LazyLock::new(|| {
    Topology::build(3, &[GPIOS_REV2, GPIOS_REV3], &[PINS_REV2, PINS_REV3])
});
static UNKNOWN: LazyLock<Topology> = LazyLock::new(Topology::default);

pub fn for_revision(revision: u32) -> &'static Topology {
    match revision {
        1 => &REV1,
        2 => &REV2,
        3 => &REV3,
        _ => &UNKNOWN,
    }
}

pub fn pin_count(revision: u32) -> usize {
    for_revision(revision).pin_count()
}

/// Line offset of a `GPIOn` name on the SoC gpio chip.
pub fn bcm_offset(name: &str) -> Option<u32> {
    name.strip_prefix("GPIO")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_pins_are_unique_per_revision() {
        for revision in 1..=3 {
            let topology = for_revision(revision);
            let mut seen = std::collections::HashSet::new();
            for info in topology.gpios().values() {
                assert!(seen.insert(info.pin), "pin {} used twice", info.pin);
            }
        }
    }

    #[test]
    fn header_is_fully_labelled() {
        let pins = |revision| {
            for_revision(revision)
                .pin_labels()
                .keys()
                .copied()
                .collect::<Vec<u32>>()
        };
        assert_eq!(pins(2), (1..=26).collect::<Vec<_>>());
        assert_eq!(pins(3), (1..=40).collect::<Vec<_>>());
    }

    #[test]
    fn bcm_offset_parses_logical_names() {
        assert_eq!(bcm_offset("GPIO18"), Some(18));
        assert_eq!(bcm_offset("GND"), None);
        assert_eq!(bcm_offset("GPIOx"), None);
    }

    #[test]
    fn later_revisions_extend_earlier_ones() {
        let (rev1, rev2, rev3) = (for_revision(1), for_revision(2), for_revision(3));

        assert_eq!(rev1.gpios(), rev2.gpios());
        assert_eq!(rev3.revision(), 3);
        for (name, info) in rev2.gpios() {
            assert_eq!(rev3.gpio(name), Some(info));
        }
        assert!(rev3.contains("GPIO21"));
        assert!(!rev2.contains("GPIO21"));
        assert_eq!(rev3.gpio_at(40), Some("GPIO21"));
        assert_eq!(rev3.gpio_at(39), None);
    }

    #[test]
    fn unknown_revision_is_empty() {
        let topology = for_revision(4);

        assert_eq!(topology.revision(), 0);
        assert_eq!(topology.pin_count(), 0);
        assert_eq!(pin_count(0), 0);
    }
}
