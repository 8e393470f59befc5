//! camrec library crate.
//!
//! Continuous multi-camera recording with capacity-driven retention:
//! volume monitoring, a durable segment index, supervised capture sessions,
//! retention and the orchestrator tying them together.

pub mod capture;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod retention;
pub mod storage;
pub mod utils;
pub mod volume;

pub use error::{Error, Result};
