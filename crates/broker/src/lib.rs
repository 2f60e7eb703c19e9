pub mod app;
pub mod backoff;
pub mod config;
pub mod device_plugin;
pub mod error;
pub mod logging;
pub mod registry;
pub mod uds;
pub mod vendor;

pub use backoff::BackoffSchedule;
pub use device_plugin::NfDevicePlugin;
pub use error::PluginError;
pub use registry::DeviceHealth;
pub use registry::DeviceRegistry;
pub use vendor::VendorClient;
