//! Core library for the basler_daq application.
//!
//! Basler (Pylon) camera control exposed as a 2D viewer: the camera
//! controller and its transport backends, the generic viewer logic, and the
//! Kameo actor hosts talk to. Used by the `basler_daq` command line tool.

pub mod actors;
pub mod config;
pub mod error;
pub mod export;
pub mod hardware;
pub mod traits;
pub mod viewer;
