//! Repository layer for database access.

pub mod segment;
pub mod segment_tx;

pub use segment::*;
pub use segment_tx::*;
