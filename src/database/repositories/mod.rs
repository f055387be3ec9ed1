//! Repositories over the SQLite pool.

mod device;
mod image;
mod job;
mod source;

pub use device::{DeviceRepository, SqlxDeviceRepository};
pub use image::{ImageRepository, SqlxImageRepository};
pub use job::{JobRepository, SqlxJobRepository};
pub use source::{SourceRepository, SqlxSourceRepository};
