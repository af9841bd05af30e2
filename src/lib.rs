//! Core library for the scene_daq acquisition controller.
//!
//! Drives a leader/follower pair of cameras (a polarization camera and a snapshot
//! hyperspectral camera) through matched captures of a scene: per-sensor exposure
//! search, dark-frame calibration, cropping, signal-quality validation and fault
//! recovery, then persistence of the accepted frames. It is used by the `scene-daq`
//! command-line binary.

pub mod calibration;
pub mod config;
pub mod error;
pub mod exposure;
pub mod frame;
pub mod hardware;
pub mod orchestrator;
pub mod pipeline;
pub mod quality;
pub mod report;
pub mod session;
pub mod sources;
pub mod storage;
