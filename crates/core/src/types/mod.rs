//! Domain types for board communication

mod device;
mod file;
mod script;

pub use device::{ConnectionState, DeviceInfo, CIRCUITPYTHON_VENDOR_ID};
pub use file::{FileType, MicroFile};
pub use script::{EditorMode, MicroScript};
