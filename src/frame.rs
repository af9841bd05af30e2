//! Frame containers shared by the pipeline, the sessions and storage.
//!
//! All arrays are channel-first (`channel × height × width`). Single-plane sensors
//! produce frames with one channel.

use std::fmt;

use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Rectangular region of interest in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// First row (inclusive)
    pub y: usize,
    /// First column (inclusive)
    pub x: usize,
    /// Number of rows
    pub height: usize,
    /// Number of columns
    pub width: usize,
}

impl Roi {
    /// Create a region from its top-left corner and size.
    pub const fn new(y: usize, x: usize, height: usize, width: usize) -> Self {
        Self {
            y,
            x,
            height,
            width,
        }
    }

    /// Row one past the last row of the region.
    pub fn y_end(&self) -> usize {
        self.y + self.height
    }

    /// Column one past the last column of the region.
    pub fn x_end(&self) -> usize {
        self.x + self.width
    }

    /// Whether the region is non-empty and lies inside a `height × width` frame.
    pub fn fits_within(&self, height: usize, width: usize) -> bool {
        self.height > 0 && self.width > 0 && self.y_end() <= height && self.x_end() <= width
    }

    /// Grow the region by `margin` pixels on every side, clamped to the frame, with the
    /// origin snapped down to an even row/column.
    ///
    /// Keeping the origin even preserves the parity of a 2x2 mosaic inside the window.
    pub fn expanded_even(&self, margin: usize, height: usize, width: usize) -> Roi {
        let y = self.y.saturating_sub(margin) & !1;
        let x = self.x.saturating_sub(margin) & !1;
        let y_end = (self.y_end() + margin).min(height);
        let x_end = (self.x_end() + margin).min(width);
        Roi::new(y, x, y_end.saturating_sub(y), x_end.saturating_sub(x))
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[y {}..{}, x {}..{}]",
            self.y,
            self.y_end(),
            self.x,
            self.x_end()
        )
    }
}

/// Frame as delivered by a sensor, before calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    data: Array3<f64>,
    exposure_ms: u64,
}

impl RawFrame {
    /// Wrap a channel-first array captured at `exposure_ms`.
    pub fn new(data: Array3<f64>, exposure_ms: u64) -> Self {
        Self { data, exposure_ms }
    }

    /// Wrap a single plane as a one-channel frame.
    pub fn from_plane(plane: Array2<f64>, exposure_ms: u64) -> Self {
        Self::new(plane.insert_axis(Axis(0)), exposure_ms)
    }

    /// Pixel data, channel-first.
    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    /// Exposure the frame was integrated with.
    pub fn exposure_ms(&self) -> u64 {
        self.exposure_ms
    }

    /// `(channels, height, width)`
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }
}

/// Calibrated, cropped frame ready for validation and persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedFrame {
    data: Array3<f64>,
    exposure_ms: u64,
    snr: f64,
}

impl ProcessedFrame {
    pub(crate) fn new(data: Array3<f64>, exposure_ms: u64, snr: f64) -> Self {
        Self {
            data,
            exposure_ms,
            snr,
        }
    }

    /// Pixel data, channel-first.
    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    /// Exposure used to produce the frame.
    pub fn exposure_ms(&self) -> u64 {
        self.exposure_ms
    }

    /// Signal-to-noise estimate over the whole array.
    pub fn snr(&self) -> f64 {
        self.snr
    }

    /// `(channels, height, width)`
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// View of one channel, if it exists.
    pub fn channel(&self, index: usize) -> Option<ArrayView2<'_, f64>> {
        (index < self.data.len_of(Axis(0))).then(|| self.data.index_axis(Axis(0), index))
    }

    /// Peak intensity of one channel.
    pub fn peak(&self, channel: usize) -> Option<f64> {
        self.channel(channel)
            .map(|plane| plane.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v)))
    }

    /// Summary statistics for logging and reports.
    pub fn stats(&self) -> FrameStats {
        let (channels, height, width) = self.dim();
        let (min, max) = self
            .data
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        FrameStats {
            shape: [channels, height, width],
            min,
            max,
            mean: self.data.mean().unwrap_or(0.0),
            snr: self.snr,
        }
    }
}

/// Statistics of a saved frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameStats {
    /// `[channels, height, width]`
    pub shape: [usize; 3],
    /// Minimum pixel value
    pub min: f64,
    /// Maximum pixel value
    pub max: f64,
    /// Mean pixel value
    pub mean: f64,
    /// Mean over standard deviation
    pub snr: f64,
}
