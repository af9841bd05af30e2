//! Common test utilities for scene_daq integration tests
//!
//! This module provides reusable test helpers for:
//! - Small sensor settings that run fast with simulated devices
//! - A scripted device that returns a fixed frame, with injectable faults
//! - An in-memory frame sink for inspecting what an orchestrator persisted

#![allow(dead_code)] // Utilities may not all be used by every test binary

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ndarray::Array3;

use scene_daq::config::SensorSettings;
use scene_daq::error::{AppResult, DaqError, SensorFault};
use scene_daq::frame::{ProcessedFrame, RawFrame, Roi};
use scene_daq::hardware::{
    DriverConfig, SensorConnector, SensorDevice, SensorSetup, SimulatedConnector, SimulatedProbe,
    SimulatedSensorConfig,
};
use scene_daq::report::{RunSummary, SampleReport};
use scene_daq::session::CaptureSession;
use scene_daq::storage::FrameSink;

/// Leader settings on a 24x24 simulated polarization sensor.
pub fn small_leader() -> SensorSettings {
    let mut settings = SensorSettings::leader_default();
    settings.crop = Roi::new(2, 2, 16, 16);
    settings.readout = None;
    settings.driver = DriverConfig::Simulated(small_polarization_sim());
    settings
}

/// Simulated polarization sensor whose brightest processed pixel is `min(4095, 9 * ms)`.
pub fn small_polarization_sim() -> SimulatedSensorConfig {
    SimulatedSensorConfig {
        height: 24,
        width: 24,
        ..SimulatedSensorConfig::default()
    }
}

/// Follower settings on a 16x16, 4-band simulated hyperspectral sensor.
pub fn small_follower() -> SensorSettings {
    let mut settings = SensorSettings::follower_default();
    settings.crop = Roi::new(4, 4, 8, 8);
    settings.pre_capture_delay = Duration::ZERO;
    settings.driver = DriverConfig::Simulated(SimulatedSensorConfig {
        channels: 4,
        height: 16,
        width: 16,
        gain: 0.5,
        ..SimulatedSensorConfig::default()
    });
    settings
}

/// Follower-style settings matching [`low_snr_frame`]: one band, full-frame crop.
pub fn low_snr_settings() -> SensorSettings {
    let mut settings = small_follower();
    settings.crop = Roi::new(0, 0, 100, 100);
    settings
}

/// 100x100 single-band frame: one bright pixel on black, SNR = 1/sqrt(9999) ~ 0.01.
pub fn low_snr_frame() -> Array3<f64> {
    let mut data = Array3::zeros((1, 100, 100));
    data[[0, 50, 50]] = 1000.0;
    data
}

/// Session on the settings' simulated driver, plus the driver's counters.
pub fn simulated_session(settings: &SensorSettings) -> (CaptureSession, Arc<SimulatedProbe>) {
    let DriverConfig::Simulated(sim) = &settings.driver;
    let connector = SimulatedConnector::new(sim.clone());
    let probe = connector.probe();
    (CaptureSession::new(settings, Box::new(connector), None), probe)
}

/// Session on a [`ScriptedConnector`], plus its counters.
pub fn scripted_session(
    settings: &SensorSettings,
    connector: ScriptedConnector,
) -> (CaptureSession, Arc<ScriptProbe>) {
    let probe = connector.probe();
    (CaptureSession::new(settings, Box::new(connector), None), probe)
}

/// Calls observed by a [`ScriptedConnector`] across all handles it opened.
#[derive(Debug, Default)]
pub struct ScriptProbe {
    pub connects: AtomicU32,
    pub captures: AtomicU32,
    pub set_exposures: AtomicU32,
}

impl ScriptProbe {
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> u32 {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn set_exposures(&self) -> u32 {
        self.set_exposures.load(Ordering::SeqCst)
    }
}

/// Connector whose devices always return the same frame, with injectable faults.
///
/// Fault counters are global across every handle the connector opens.
#[derive(Debug, Clone)]
pub struct ScriptedConnector {
    frame: Array3<f64>,
    fail_first: u32,
    fail_set_exposure: u32,
    fail_reconnects: u32,
    probe: Arc<ScriptProbe>,
}

impl ScriptedConnector {
    pub fn new(frame: Array3<f64>) -> Self {
        Self {
            frame,
            fail_first: 0,
            fail_set_exposure: 0,
            fail_reconnects: 0,
            probe: Arc::new(ScriptProbe::default()),
        }
    }

    /// Fail the first `captures` capture calls.
    pub fn failing_first(mut self, captures: u32) -> Self {
        self.fail_first = captures;
        self
    }

    /// Fail the first `calls` exposure changes.
    pub fn failing_set_exposure(mut self, calls: u32) -> Self {
        self.fail_set_exposure = calls;
        self
    }

    /// Let the first connect succeed, then fail the next `connects`.
    pub fn failing_reconnects(mut self, connects: u32) -> Self {
        self.fail_reconnects = connects;
        self
    }

    pub fn probe(&self) -> Arc<ScriptProbe> {
        Arc::clone(&self.probe)
    }
}

#[async_trait]
impl SensorConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn SensorDevice>, SensorFault> {
        let n = self.probe.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if n > 1 && n <= 1 + self.fail_reconnects {
            return Err(SensorFault::Connect(format!("scripted connect fault {n}")));
        }
        Ok(Box::new(ScriptedDevice {
            frame: self.frame.clone(),
            fail_first: self.fail_first,
            fail_set_exposure: self.fail_set_exposure,
            probe: Arc::clone(&self.probe),
            exposure_ms: 1,
        }))
    }
}

struct ScriptedDevice {
    frame: Array3<f64>,
    fail_first: u32,
    fail_set_exposure: u32,
    probe: Arc<ScriptProbe>,
    exposure_ms: u64,
}

#[async_trait]
impl SensorDevice for ScriptedDevice {
    async fn configure(&mut self, setup: &SensorSetup) -> Result<(), SensorFault> {
        self.exposure_ms = setup.exposure_ms;
        Ok(())
    }

    async fn set_exposure(&mut self, exposure_ms: u64) -> Result<(), SensorFault> {
        let n = self.probe.set_exposures.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_set_exposure {
            return Err(SensorFault::Configure(format!("scripted exposure fault {n}")));
        }
        self.exposure_ms = exposure_ms;
        Ok(())
    }

    async fn capture_raw(&mut self) -> Result<RawFrame, SensorFault> {
        let n = self.probe.captures.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_first {
            return Err(SensorFault::Capture(format!("scripted fault {n}")));
        }
        Ok(RawFrame::new(self.frame.clone(), self.exposure_ms))
    }

    async fn close(&mut self) -> Result<(), SensorFault> {
        Ok(())
    }
}

/// One frame handed to a [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFrame {
    pub sample: String,
    pub sensor: String,
    pub dim: (usize, usize, usize),
    pub exposure_ms: u64,
}

/// Frame sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub frames: Vec<StoredFrame>,
    pub reports: Vec<SampleReport>,
    pub summary: Option<RunSummary>,
    /// Fail every frame write with a storage error
    pub fail_writes: bool,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn init(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn write_frame(
        &mut self,
        sample: &str,
        sensor: &str,
        frame: &ProcessedFrame,
    ) -> AppResult<PathBuf> {
        if self.fail_writes {
            return Err(DaqError::Storage("disk full".to_string()));
        }
        self.frames.push(StoredFrame {
            sample: sample.to_string(),
            sensor: sensor.to_string(),
            dim: frame.dim(),
            exposure_ms: frame.exposure_ms(),
        });
        Ok(PathBuf::from(format!("memory://{sample}_{sensor}")))
    }

    async fn write_report(&mut self, report: &SampleReport) -> AppResult<()> {
        self.reports.push(report.clone());
        Ok(())
    }

    async fn finish(&mut self, summary: &RunSummary) -> AppResult<()> {
        self.summary = Some(summary.clone());
        Ok(())
    }
}
