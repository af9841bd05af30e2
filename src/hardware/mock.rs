//! Simulated sensors
//!
//! Provides in-process stand-ins for the polarization camera and the hyperspectral
//! camera so the whole acquisition chain runs without hardware. All waiting uses
//! `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Signal model
//!
//! The scene is a set of horizontal bands, constant over each 2x2 super-pixel so that a
//! polarization mosaic demosaics to a clean image. Pixel values are
//!
//! ```text
//! min(saturation, gain * exposure_ms * level(row) * band_weight(channel)) + dark_level + noise
//! ```
//!
//! where `level` runs from 0.5 to 1.0, so the brightest pixel of a noise-free frame is
//! `min(saturation, gain * exposure_ms) + dark_level`.
//!
//! # Fault injection
//!
//! `fail_first_captures` and `fail_every` make capture calls fail. The capture counter
//! lives in a [`SimulatedProbe`] shared by every handle a connector opens, so injected
//! faults keep counting across reinitializations.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tracing::debug;

use super::{SensorConnector, SensorDevice, SensorSetup};
use crate::error::SensorFault;
use crate::frame::RawFrame;

/// Rows per brightness band of the synthetic scene.
const BAND_ROWS: usize = 2;
/// Distinct brightness bands before the pattern repeats.
const BAND_LEVELS: usize = 8;

/// Parameters of a simulated sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedSensorConfig {
    /// Channels per raw frame (1 for a mosaic sensor)
    pub channels: usize,
    /// Full sensor height in pixels
    pub height: usize,
    /// Full sensor width in pixels
    pub width: usize,
    /// Counts per millisecond at full scene brightness
    pub gain: f64,
    /// Full-well value signal clips at
    pub saturation: f64,
    /// Constant offset added to every pixel
    pub dark_level: f64,
    /// Amplitude of uniform noise; 0 disables it
    pub noise: f64,
    /// Fail this many captures before the first success
    pub fail_first_captures: u32,
    /// Additionally fail every n-th capture; 0 disables it
    pub fail_every: u32,
    /// Sleep for the exposure time on every capture
    pub realtime: bool,
}

impl Default for SimulatedSensorConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            height: 64,
            width: 64,
            gain: 9.0,
            saturation: 4095.0,
            dark_level: 0.0,
            noise: 0.0,
            fail_first_captures: 0,
            fail_every: 0,
            realtime: false,
        }
    }
}

impl SimulatedSensorConfig {
    /// 12-bit polarization camera, 2448x2048 readout.
    pub fn polarization_camera() -> Self {
        Self {
            height: 2048,
            width: 2448,
            ..Self::default()
        }
    }

    /// Snapshot hyperspectral camera producing a 41-band cube.
    pub fn hyperspectral_camera() -> Self {
        Self {
            channels: 41,
            height: 256,
            width: 256,
            gain: 0.5,
            ..Self::default()
        }
    }
}

/// Counters shared by every handle a [`SimulatedConnector`] opens.
#[derive(Debug, Default)]
pub struct SimulatedProbe {
    connects: AtomicU32,
    closes: AtomicU32,
    configures: AtomicU32,
    captures: AtomicU32,
    last_exposure_ms: AtomicU64,
}

impl SimulatedProbe {
    /// Handles opened so far.
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Handles closed so far.
    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    /// `configure` calls so far.
    pub fn configures(&self) -> u32 {
        self.configures.load(Ordering::SeqCst)
    }

    /// Capture calls so far, failed ones included.
    pub fn captures(&self) -> u32 {
        self.captures.load(Ordering::SeqCst)
    }

    /// Exposure most recently written to any handle.
    pub fn last_exposure_ms(&self) -> u64 {
        self.last_exposure_ms.load(Ordering::SeqCst)
    }
}

/// Opens [`SimulatedSensor`] handles.
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    config: SimulatedSensorConfig,
    probe: Arc<SimulatedProbe>,
}

impl SimulatedConnector {
    /// Connector with fresh counters.
    pub fn new(config: SimulatedSensorConfig) -> Self {
        Self {
            config,
            probe: Arc::new(SimulatedProbe::default()),
        }
    }

    /// Shared counters, for inspection in tests.
    pub fn probe(&self) -> Arc<SimulatedProbe> {
        Arc::clone(&self.probe)
    }
}

#[async_trait]
impl SensorConnector for SimulatedConnector {
    async fn connect(&self) -> Result<Box<dyn SensorDevice>, SensorFault> {
        let handle = self.probe.connects.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(handle, "Simulated sensor opened");
        Ok(Box::new(SimulatedSensor {
            config: self.config.clone(),
            probe: Arc::clone(&self.probe),
            exposure_ms: 1,
            height: self.config.height,
            width: self.config.width,
            open: true,
        }))
    }
}

/// One open simulated handle.
#[derive(Debug)]
pub struct SimulatedSensor {
    config: SimulatedSensorConfig,
    probe: Arc<SimulatedProbe>,
    exposure_ms: u64,
    height: usize,
    width: usize,
    open: bool,
}

impl SimulatedSensor {
    fn should_fail(&self, capture: u32) -> bool {
        capture <= self.config.fail_first_captures
            || (self.config.fail_every > 0 && capture % self.config.fail_every == 0)
    }

    fn render(&self, capture: u32) -> Array3<f64> {
        let channels = self.config.channels.max(1);
        let signal = self.config.gain * self.exposure_ms as f64;
        let mut frame = Array3::from_shape_fn((channels, self.height, self.width), |(c, y, _)| {
            let level =
                0.5 + 0.5 * ((y / BAND_ROWS) % BAND_LEVELS) as f64 / (BAND_LEVELS - 1) as f64;
            let band_weight = 0.5 + 0.5 * (c + 1) as f64 / channels as f64;
            (signal * level * band_weight).min(self.config.saturation) + self.config.dark_level
        });

        if self.config.noise > 0.0 {
            let amplitude = self.config.noise;
            let mut rng = StdRng::seed_from_u64(u64::from(capture));
            frame.mapv_inplace(|v| v + rng.gen_range(-amplitude..=amplitude));
        }
        frame
    }
}

#[async_trait]
impl SensorDevice for SimulatedSensor {
    async fn configure(&mut self, setup: &SensorSetup) -> Result<(), SensorFault> {
        self.probe.configures.fetch_add(1, Ordering::SeqCst);
        match setup.readout {
            Some(roi) if !roi.fits_within(self.config.height, self.config.width) => {
                return Err(SensorFault::Configure(format!(
                    "readout {roi} exceeds {}x{} sensor",
                    self.config.height, self.config.width
                )));
            }
            Some(roi) => {
                self.height = roi.height;
                self.width = roi.width;
            }
            None => {
                self.height = self.config.height;
                self.width = self.config.width;
            }
        }
        self.set_exposure(setup.exposure_ms).await
    }

    async fn set_exposure(&mut self, exposure_ms: u64) -> Result<(), SensorFault> {
        if exposure_ms == 0 {
            return Err(SensorFault::Configure("exposure must be positive".into()));
        }
        self.exposure_ms = exposure_ms;
        self.probe
            .last_exposure_ms
            .store(exposure_ms, Ordering::SeqCst);
        Ok(())
    }

    async fn capture_raw(&mut self) -> Result<RawFrame, SensorFault> {
        if !self.open {
            return Err(SensorFault::Capture("handle is closed".into()));
        }
        let capture = self.probe.captures.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.realtime {
            sleep(Duration::from_millis(self.exposure_ms)).await;
        }
        if self.should_fail(capture) {
            debug!(capture, "Simulated capture fault");
            return Err(SensorFault::Capture(format!(
                "simulated readout error on capture {capture}"
            )));
        }
        Ok(RawFrame::new(self.render(capture), self.exposure_ms))
    }

    async fn close(&mut self) -> Result<(), SensorFault> {
        if self.open {
            self.open = false;
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
