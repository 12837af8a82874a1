use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::device::Device;
use crate::error::AppError;

/// Persistence of device records.
pub trait DeviceStore: Send + Sync {
    fn add_device(&self, device: &Device) -> Result<(), AppError>;
    fn update_device(&self, device: &Device) -> Result<(), AppError>;
    fn delete_device(&self, uuid: &str) -> Result<(), AppError>;
    fn get_device(&self, uuid: &str) -> Option<Device>;
    fn devices(&self) -> Vec<Device>;
}

type DeviceMap = FxHashMap<String, Device>;

fn insert_device(devices: &mut DeviceMap, device: &Device) -> Result<(), AppError> {
    if devices.contains_key(&device.uuid) {
        return Err(AppError::Storage(format!(
            "device {} already stored",
            device.uuid
        )));
    }
    devices.insert(device.uuid.clone(), device.clone());
    Ok(())
}

fn replace_device(devices: &mut DeviceMap, device: &Device) -> Result<(), AppError> {
    let stored = devices
        .get_mut(&device.uuid)
        .ok_or_else(|| AppError::Storage(format!("device {} not stored", device.uuid)))?;
    *stored = device.clone();
    Ok(())
}

fn remove_device(devices: &mut DeviceMap, uuid: &str) -> Result<(), AppError> {
    devices
        .remove(uuid)
        .map(|_| ())
        .ok_or_else(|| AppError::Storage(format!("device {uuid} not stored")))
}

#[derive(Default)]
pub struct MemoryDeviceStore {
    devices: RwLock<DeviceMap>,
}

impl DeviceStore for MemoryDeviceStore {
    fn add_device(&self, device: &Device) -> Result<(), AppError> {
        insert_device(&mut self.devices.write(), device)
    }

    fn update_device(&self, device: &Device) -> Result<(), AppError> {
        replace_device(&mut self.devices.write(), device)
    }

    fn delete_device(&self, uuid: &str) -> Result<(), AppError> {
        remove_device(&mut self.devices.write(), uuid)
    }

    fn get_device(&self, uuid: &str) -> Option<Device> {
        self.devices.read().get(uuid).cloned()
    }

    fn devices(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }
}

/// Device store rewriting a json file on every change.
///
/// A change is applied to a copy of the catalog, written out, and only then
/// made visible. A failed write leaves both the file and the memory view
/// untouched.
pub struct JsonFileDeviceStore {
    path: PathBuf,
    devices: RwLock<DeviceMap>,
    writer: Mutex<()>,
}

impl JsonFileDeviceStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();
        let mut devices = DeviceMap::default();

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .map_err(|e| AppError::Storage(format!("read {}: {e}", path.display())))?;
            let stored: Vec<Device> = serde_json::from_str(&contents)
                .map_err(|e| AppError::Storage(format!("parse {}: {e}", path.display())))?;
            info!("Loaded {} devices from {}", stored.len(), path.display());
            for device in &stored {
                insert_device(&mut devices, device)?;
            }
        }

        Ok(Self {
            path,
            devices: RwLock::new(devices),
            writer: Mutex::new(()),
        })
    }

    fn commit(
        &self,
        change: impl FnOnce(&mut DeviceMap) -> Result<(), AppError>,
    ) -> Result<(), AppError> {
        // one writer at a time owns the temp file and the rename
        let _writer = self.writer.lock();

        let mut candidate = self.devices.read().clone();
        change(&mut candidate)?;
        self.flush(&candidate)?;
        *self.devices.write() = candidate;

        Ok(())
    }

    fn flush(&self, devices: &DeviceMap) -> Result<(), AppError> {
        let mut devices: Vec<&Device> = devices.values().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        let contents = serde_json::to_vec_pretty(&devices)
            .map_err(|e| AppError::Storage(format!("serialize devices: {e}")))?;

        // write aside then rename, readers never see a partial file
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, contents)
            .map_err(|e| AppError::Storage(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| AppError::Storage(format!("rename {}: {e}", self.path.display())))?;
        debug!("Flushed {} devices to {}", devices.len(), self.path.display());
        Ok(())
    }
}

impl DeviceStore for JsonFileDeviceStore {
    fn add_device(&self, device: &Device) -> Result<(), AppError> {
        self.commit(|devices| insert_device(devices, device))
    }

    fn update_device(&self, device: &Device) -> Result<(), AppError> {
        self.commit(|devices| replace_device(devices, device))
    }

    fn delete_device(&self, uuid: &str) -> Result<(), AppError> {
        self.commit(|devices| remove_device(devices, uuid))
    }

    fn get_device(&self, uuid: &str) -> Option<Device> {
        self.devices.read().get(uuid).cloned()
    }

    fn devices(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }
}
