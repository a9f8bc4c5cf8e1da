// Model module: devices, groups and derived membership

pub mod device;
pub mod group;
pub mod registry;

pub use device::{Device, LinkStatus};
pub use group::Group;
pub use registry::DeviceRegistry;
