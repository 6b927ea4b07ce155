//! Hardware-agnostic traits for instrument types
//!
//! The viewer layer is written against these interfaces so any camera
//! controller offering the pylablib-style contract can back it.

pub mod camera_sensor;

pub use self::camera_sensor::{
    frames_to_record_batch, CameraSensor, DeviceInfo, Frame, FrameAccumulator, PixelFormat, Roi,
    FRAME_SCHEMA,
};
