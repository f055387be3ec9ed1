//! Database models.

mod device;
mod image;
mod job;
mod source;

pub use device::{DeviceDbModel, NsfwMode};
pub use image::{ImageDbModel, ImageDeviceDbModel, ImagePathDbModel, NewImage};
pub use job::{JobDbModel, JobStatus};
pub use source::SourceDbModel;
