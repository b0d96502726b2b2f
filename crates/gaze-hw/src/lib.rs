//! gaze-hw: camera capture for the gaze pipeline.
//!
//! V4L2 capture converted to RGB frames, plus the single-slot mailbox the
//! daemon uses to hand the newest frame (or estimate) between threads.

pub mod camera;
pub mod frame;
pub mod slot;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
pub use slot::LatestSlot;
