//! Segment store: durable index of recorded segments.

pub mod reconcile;
pub mod store;

pub use reconcile::{OrphanPolicy, ReconcileOptions, ReconcileReport, quarantine_file};
pub use store::{SegmentListing, SegmentQuery, SegmentStore, VolumeGuard};
