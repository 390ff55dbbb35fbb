pub mod device;
pub mod error;
pub mod hub;
pub mod identity;
pub mod local;
pub mod logs;
pub mod manager;
pub mod registry;
pub mod remote;
pub mod scheduler;
pub mod service;
pub mod tasks;
pub mod types;
pub mod watchdog;

pub use device::Device;
pub use error::{DeviceError, RemoteError, ScheduleError, TaskError};
pub use hub::EventHub;
pub use local::{LocalDevice, LocalDeviceConfig};
pub use manager::DeviceManager;
pub use remote::{PeerRecord, RemoteDevice};
pub use service::TaskManager;
pub use types::*;
