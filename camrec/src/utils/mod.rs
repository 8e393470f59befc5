//! Utility helpers.

pub mod filename;
pub mod fs;
