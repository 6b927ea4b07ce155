//! Kameo Actor Implementations

pub mod basler_viewer;

pub use basler_viewer::{
    BaslerViewer, CameraRemoved, Close, FrameGrabbed, GetSettings, GrabData, IniDetector,
    SelectRoi, SetSetting, Stop, Subscribe,
};
