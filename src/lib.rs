pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod gpio;
pub mod routes;
pub mod store;
pub mod topology;
pub mod usage;
pub mod watcher;

pub use config::{AppConfig, BoardConfig, HttpConfig, ModuleConfig, WatcherConfig};
pub use device::{Device, DeviceMode};
pub use error::AppError;
pub use events::{EventCallbackHandler, EventHandler, GPIO_OFF_EVENT, GPIO_ON_EVENT, GpioEvent};
pub use gpio::{BoardInfo, Direction, GpioBackend, GpioManager, Level, Pull};
pub use routes::AppState;
pub use store::{DeviceStore, JsonFileDeviceStore, MemoryDeviceStore};
pub use watcher::InputWatcher;

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
