//! Database models.
//!
//! These map directly onto the schema in `migrations/`.

pub mod segment;

pub use segment::*;
