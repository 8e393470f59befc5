//! Domain layer for camrec.
//!
//! Cameras, volumes, segments, retention rules and the capture session state
//! machine. Everything here is plain data; IO lives in the service modules.

pub mod camera;
pub mod retention;
pub mod segment;
pub mod session;
pub mod volume;

pub use camera::Camera;
pub use retention::RetentionPolicy;
pub use segment::{NewSegment, Segment};
pub use session::SessionState;
pub use volume::{Volume, VolumeHealth};
