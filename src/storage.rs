//! Persistence of accepted frames and acquisition records.
//!
//! The orchestrator writes through the [`FrameSink`] trait. [`TiffFrameWriter`] is the
//! on-disk implementation:
//!
//! ```text
//! <output_dir>/
//!   <sensor>/<sample>_<sensor>.tif   one 64-bit float page per channel
//!   <sample>_report.json             per-sample record
//!   run_summary.json                 written when the run ends
//! ```

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ndarray::Axis;
use tiff::encoder::{colortype, TiffEncoder};
use tracing::{debug, info};

use crate::error::{AppResult, DaqError};
use crate::frame::ProcessedFrame;
use crate::report::{RunSummary, SampleReport};

/// Destination for accepted frames and reports.
#[async_trait]
pub trait FrameSink: Send {
    /// Prepare the destination before the first sample.
    async fn init(&mut self) -> AppResult<()>;

    /// Persist one accepted frame; returns where it went.
    async fn write_frame(
        &mut self,
        sample: &str,
        sensor: &str,
        frame: &ProcessedFrame,
    ) -> AppResult<PathBuf>;

    /// Persist the record of a finished sample.
    async fn write_report(&mut self, report: &SampleReport) -> AppResult<()>;

    /// Persist the run summary and release resources.
    async fn finish(&mut self, summary: &RunSummary) -> AppResult<()>;
}

/// Writes multi-page TIFF stacks and JSON records under one directory.
#[derive(Debug, Clone)]
pub struct TiffFrameWriter {
    output_dir: PathBuf,
    write_reports: bool,
}

impl TiffFrameWriter {
    /// Writer rooted at `output_dir`; JSON records are skipped when `write_reports` is off.
    pub fn new(output_dir: impl Into<PathBuf>, write_reports: bool) -> Self {
        Self {
            output_dir: output_dir.into(),
            write_reports,
        }
    }

    /// Path of the stack for `sample` from `sensor`.
    pub fn frame_path(&self, sample: &str, sensor: &str) -> PathBuf {
        self.output_dir
            .join(sensor)
            .join(format!("{sample}_{sensor}.tif"))
    }

    fn write_json<T: serde::Serialize>(&self, name: &str, value: &T) -> AppResult<PathBuf> {
        let path = self.output_dir.join(name);
        let file = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(file, value)?;
        Ok(path)
    }
}

/// Encode a channel-first frame as one grayscale `f64` page per channel.
pub fn write_tiff_stack(path: &Path, frame: &ProcessedFrame) -> AppResult<()> {
    let (_, height, width) = frame.dim();
    let (height, width) = (
        u32::try_from(height).map_err(|_| DaqError::Storage(format!("height {height} too large")))?,
        u32::try_from(width).map_err(|_| DaqError::Storage(format!("width {width} too large")))?,
    );

    let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path)?))?;
    for plane in frame.data().axis_iter(Axis(0)) {
        let pixels: Vec<f64> = plane.iter().copied().collect();
        encoder.write_image::<colortype::Gray64Float>(width, height, &pixels)?;
    }
    Ok(())
}

#[async_trait]
impl FrameSink for TiffFrameWriter {
    async fn init(&mut self) -> AppResult<()> {
        fs::create_dir_all(&self.output_dir).map_err(|e| {
            DaqError::Storage(format!(
                "cannot create output directory '{}': {e}",
                self.output_dir.display()
            ))
        })?;
        info!(dir = %self.output_dir.display(), "Frame writer initialized");
        Ok(())
    }

    async fn write_frame(
        &mut self,
        sample: &str,
        sensor: &str,
        frame: &ProcessedFrame,
    ) -> AppResult<PathBuf> {
        let path = self.frame_path(sample, sensor);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        write_tiff_stack(&path, frame)?;
        debug!(sample, sensor, path = %path.display(), shape = ?frame.dim(), "Frame saved");
        Ok(path)
    }

    async fn write_report(&mut self, report: &SampleReport) -> AppResult<()> {
        if self.write_reports {
            self.write_json(&format!("{}_report.json", report.sample), report)?;
        }
        Ok(())
    }

    async fn finish(&mut self, summary: &RunSummary) -> AppResult<()> {
        if self.write_reports {
            let path = self.write_json("run_summary.json", summary)?;
            info!(path = %path.display(), "Run summary written");
        }
        Ok(())
    }
}
