//! Software device for headless runs and tests.

mod device;

pub use device::{DeviceStats, HostDevice};
