//! Dark-frame calibration data.
//!
//! Each sensor may have one master dark frame (the mean of N dark exposures) stored as a
//! NumPy `.npy` array. The [`CalibrationStore`] loads them once when a run starts and hands
//! out shared read-only references; nothing writes to it afterwards, so sessions read it
//! without locking.

pub mod master_dark;
pub mod npy;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{s, ArrayD, ArrayView3, Axis, Ix2, Ix3};
use tracing::info;

use crate::config::SensorSettings;
use crate::error::AppResult;

pub use master_dark::{build_master_dark, write_master_dark, MasterDark};

/// Mean dark exposure for one sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationFrame {
    data: ArrayD<f64>,
    source: Option<PathBuf>,
}

impl CalibrationFrame {
    /// Wrap an in-memory dark array.
    pub fn new(data: ArrayD<f64>) -> Self {
        Self { data, source: None }
    }

    /// Load a dark array from an `.npy` file.
    pub fn load(path: &Path) -> AppResult<Self> {
        Ok(Self {
            data: npy::read_npy(path)?,
            source: Some(path.to_path_buf()),
        })
    }

    /// Shape of the stored array.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// File the frame was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// View of the dark data lined up with a raw frame of shape
    /// `(channels, height, width)`.
    ///
    /// A 2-D dark matches a single-channel frame. A 3-D dark matches a frame with the
    /// same channel count; a stack of planes against a single-channel frame uses its
    /// first plane. Returns `None` when the spatial size disagrees.
    pub fn aligned_to(
        &self,
        (channels, height, width): (usize, usize, usize),
    ) -> Option<ArrayView3<'_, f64>> {
        match *self.data.shape() {
            [h, w] if channels == 1 && h == height && w == width => self
                .data
                .view()
                .into_dimensionality::<Ix2>()
                .ok()
                .map(|plane| plane.insert_axis(Axis(0))),
            [c, h, w] if h == height && w == width && (c == channels || channels == 1) => {
                let view = self.data.view().into_dimensionality::<Ix3>().ok()?;
                Some(if c == channels {
                    view
                } else {
                    view.slice_move(s![0..1, .., ..])
                })
            }
            _ => None,
        }
    }
}

/// Per-sensor dark frames for one run.
#[derive(Debug, Default)]
pub struct CalibrationStore {
    frames: HashMap<String, Arc<CalibrationFrame>>,
}

impl CalibrationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the configured dark frame of every sensor that has one.
    pub fn load<'a>(sensors: impl IntoIterator<Item = &'a SensorSettings>) -> AppResult<Self> {
        let mut store = Self::new();
        for sensor in sensors {
            if let Some(path) = &sensor.calibration {
                let frame = CalibrationFrame::load(path)?;
                info!(
                    sensor = %sensor.tag,
                    path = %path.display(),
                    shape = ?frame.shape(),
                    "Loaded dark calibration frame"
                );
                store.insert(&sensor.tag, frame);
            } else {
                info!(sensor = %sensor.tag, "No dark calibration configured");
            }
        }
        Ok(store)
    }

    /// Register a dark frame for `sensor`.
    pub fn insert(&mut self, sensor: &str, frame: CalibrationFrame) {
        self.frames.insert(sensor.to_string(), Arc::new(frame));
    }

    /// Shared handle to the dark frame for `sensor`.
    pub fn get(&self, sensor: &str) -> Option<Arc<CalibrationFrame>> {
        self.frames.get(sensor).cloned()
    }

    /// Number of sensors with calibration data.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no sensor has calibration data.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
