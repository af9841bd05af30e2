//! Sensor capability interface.
//!
//! Physical camera drivers live outside this crate; the acquisition logic only talks to
//! them through two small traits:
//!
//! - [`SensorDevice`]: an open handle that can be configured, have its exposure changed,
//!   and produce raw frames.
//! - [`SensorConnector`]: a factory that opens a fresh handle. Capture sessions call it
//!   once on first use and again after every hardware fault, so a connector must be
//!   reusable and always yield a handle for the same logical sensor.
//!
//! Every call is awaited to completion before the next is issued. Devices are never
//! shared between tasks.

pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SensorFault;
use crate::frame::{RawFrame, Roi};

pub use mock::{SimulatedConnector, SimulatedProbe, SimulatedSensorConfig};

/// Settings applied when a handle is (re)opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSetup {
    /// Integration time in milliseconds
    pub exposure_ms: u64,
    /// Hardware readout window; `None` reads the full sensor
    pub readout: Option<Roi>,
}

/// Open handle to one physical sensor.
#[async_trait]
pub trait SensorDevice: Send {
    /// Apply exposure and readout window.
    async fn configure(&mut self, setup: &SensorSetup) -> Result<(), SensorFault>;

    /// Change the integration time for subsequent captures.
    async fn set_exposure(&mut self, exposure_ms: u64) -> Result<(), SensorFault>;

    /// Integrate and read out one frame.
    async fn capture_raw(&mut self) -> Result<RawFrame, SensorFault>;

    /// Release the handle. Called before the handle is dropped.
    async fn close(&mut self) -> Result<(), SensorFault>;
}

/// Opens handles for one logical sensor.
#[async_trait]
pub trait SensorConnector: Send + Sync {
    /// Open a new, unconfigured handle.
    async fn connect(&self) -> Result<Box<dyn SensorDevice>, SensorFault>;
}

/// Driver selection for a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverConfig {
    /// In-process simulated sensor.
    Simulated(SimulatedSensorConfig),
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig::Simulated(SimulatedSensorConfig::default())
    }
}

impl DriverConfig {
    /// Connector for the configured driver.
    pub fn connector(&self) -> Box<dyn SensorConnector> {
        match self {
            DriverConfig::Simulated(config) => Box::new(SimulatedConnector::new(config.clone())),
        }
    }
}
