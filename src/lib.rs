//! Claw: a media-ingestion service.
//!
//! Polls remote content sources for candidate images, matches each candidate
//! against the registered device fleet, downloads matching images once into a
//! content-addressed store, and publishes per-device copies via hardlink.

pub mod config;
pub mod database;
pub mod downloader;
pub mod error;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod utils;

pub use error::{Error, Result};
pub use service::Claw;
