//! Capture pipeline: raw sensor frame to calibrated, cropped [`ProcessedFrame`].
//!
//! The same transform runs for exposure metering and for the frame that is finally saved,
//! so the peak the exposure search sees is exactly the peak of the persisted data.
//!
//! Steps, in order:
//!
//! 1. subtract the sensor's dark frame (when one is configured),
//! 2. clip negative values to zero,
//! 3. polarization-mosaic sensors only: split the mosaic into the 0°, 45°, 90° and 135°
//!    channels and append the unsplit plane as a fifth channel,
//! 4. crop every channel to the configured region.
//!
//! Demosaicing is evaluated on the crop plus a small halo instead of the whole readout;
//! the halo keeps every interpolation tap the crop needs, so the result is identical to
//! processing the full frame and cropping afterwards.

use std::sync::Arc;

use ndarray::{concatenate, s, Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationFrame;
use crate::error::{AppResult, DaqError};
use crate::frame::{ProcessedFrame, RawFrame, Roi};
use crate::quality::snr;

/// Interpolation reaches one pixel past the crop; two keeps the window origin even.
const DEMOSAIC_HALO: usize = 2;

/// Position of each polarizer angle inside the 2x2 super-pixel, `(row, col)`.
///
/// The sensor lays out `[[90, 45], [135, 0]]`.
const POLARIZER_OFFSETS: [(usize, usize); 4] = [(1, 1), (0, 1), (0, 0), (1, 0)];

/// Physical sensor family, which decides the decomposition step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Monochrome sensor behind a 2x2 micro-polarizer mosaic.
    PolarizationMosaic,
    /// Snapshot spectral cube; frames already carry one channel per band.
    Hyperspectral,
}

impl SensorKind {
    /// Channels a processed frame has for a raw frame with `raw_channels`.
    pub fn processed_channels(&self, raw_channels: usize) -> usize {
        match self {
            SensorKind::PolarizationMosaic => POLARIZER_OFFSETS.len() + 1,
            SensorKind::Hyperspectral => raw_channels,
        }
    }
}

/// Per-sensor processing chain.
#[derive(Debug, Clone)]
pub struct CapturePipeline {
    sensor: String,
    kind: SensorKind,
    crop: Roi,
    calibration: Option<Arc<CalibrationFrame>>,
}

impl CapturePipeline {
    /// Pipeline for `sensor` cropping to `crop`, with an optional dark frame.
    pub fn new(
        sensor: impl Into<String>,
        kind: SensorKind,
        crop: Roi,
        calibration: Option<Arc<CalibrationFrame>>,
    ) -> Self {
        Self {
            sensor: sensor.into(),
            kind,
            crop,
            calibration,
        }
    }

    /// Run the full chain on one raw frame.
    ///
    /// Geometry errors (crop outside the frame, dark frame of the wrong shape, mosaic
    /// frame with several channels) are returned as configuration faults.
    pub fn process(&self, raw: RawFrame) -> AppResult<ProcessedFrame> {
        let exposure_ms = raw.exposure_ms();
        let (channels, height, width) = raw.dim();

        if !self.crop.fits_within(height, width) {
            return Err(DaqError::RoiOutOfBounds {
                sensor: self.sensor.clone(),
                roi: self.crop,
                height,
                width,
            });
        }
        if self.kind == SensorKind::PolarizationMosaic && channels != 1 {
            return Err(DaqError::ShapeMismatch {
                sensor: self.sensor.clone(),
                expected: vec![1, height, width],
                actual: vec![channels, height, width],
            });
        }

        let dark = match &self.calibration {
            Some(frame) => Some(frame.aligned_to((channels, height, width)).ok_or_else(|| {
                DaqError::ShapeMismatch {
                    sensor: self.sensor.clone(),
                    expected: frame.shape().to_vec(),
                    actual: vec![channels, height, width],
                }
            })?),
            None => None,
        };

        let window = match self.kind {
            SensorKind::PolarizationMosaic => {
                self.crop.expanded_even(DEMOSAIC_HALO, height, width)
            }
            SensorKind::Hyperspectral => self.crop,
        };
        let (rows, cols) = (window.y..window.y_end(), window.x..window.x_end());

        let mut data = raw.data().slice(s![.., rows.clone(), cols.clone()]).to_owned();
        if let Some(dark) = dark {
            data -= &dark.slice(s![.., rows, cols]);
        }
        data.mapv_inplace(|v| v.max(0.0));

        let data = match self.kind {
            SensorKind::PolarizationMosaic => {
                let plane = data.index_axis(Axis(0), 0);
                let angles = demosaic_polarization(plane)?;
                concatenate(Axis(0), &[angles.view(), data.view()])?
            }
            SensorKind::Hyperspectral => data,
        };

        let oy = self.crop.y - window.y;
        let ox = self.crop.x - window.x;
        let cropped = data
            .slice(s![
                ..,
                oy..oy + self.crop.height,
                ox..ox + self.crop.width
            ])
            .to_owned();

        let (out_channels, out_h, out_w) = cropped.dim();
        if out_h != self.crop.height || out_w != self.crop.width {
            return Err(DaqError::ShapeMismatch {
                sensor: self.sensor.clone(),
                expected: vec![out_channels, self.crop.height, self.crop.width],
                actual: vec![out_channels, out_h, out_w],
            });
        }

        let quality = snr(&cropped);
        Ok(ProcessedFrame::new(cropped, exposure_ms, quality))
    }
}

/// Split a 2x2 micro-polarizer mosaic into four full-resolution angle channels.
///
/// Channel order is 0°, 45°, 90°, 135°. Every output pixel is the bilinear estimate from
/// the nearest samples of that angle; at the border the missing neighbour is mirrored.
/// The mosaic origin must be an even row and column of the sensor.
pub fn demosaic_polarization(plane: ArrayView2<'_, f64>) -> AppResult<Array3<f64>> {
    let (height, width) = plane.dim();
    if height < 2 || width < 2 {
        return Err(DaqError::Configuration(format!(
            "polarization mosaic needs at least 2x2 pixels, got {height}x{width}"
        )));
    }

    let mut out = Array3::<f64>::zeros((POLARIZER_OFFSETS.len(), height, width));
    for (channel, &(row_offset, col_offset)) in POLARIZER_OFFSETS.iter().enumerate() {
        let rows: Vec<_> = (0..height)
            .map(|y| interpolation_taps(y, row_offset, height))
            .collect();
        let cols: Vec<_> = (0..width)
            .map(|x| interpolation_taps(x, col_offset, width))
            .collect();

        let angle = Array2::from_shape_fn((height, width), |(y, x)| {
            let (y0, y1) = rows[y];
            let (x0, x1) = cols[x];
            (plane[[y0, x0]] + plane[[y0, x1]] + plane[[y1, x0]] + plane[[y1, x1]]) / 4.0
        });
        out.index_axis_mut(Axis(0), channel).assign(&angle);
    }
    Ok(out)
}

/// The two sample positions bracketing `pos` along an axis whose samples sit at
/// `offset`, `offset + 2`, ... within `len`.
fn interpolation_taps(pos: usize, offset: usize, len: usize) -> (usize, usize) {
    if pos % 2 == offset {
        return (pos, pos);
    }
    let before = if pos > 0 { pos - 1 } else { pos + 1 };
    let after = if pos + 1 < len { pos + 1 } else { pos - 1 };
    (before, after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn ramp(height: usize, width: usize) -> Array2<f64> {
        Array2::from_shape_fn((height, width), |(y, x)| {
            ((y * 31 + x * 17) % 97) as f64 * 10.0
        })
    }

    #[test]
    fn test_processing_is_deterministic() {
        let pipeline = CapturePipeline::new(
            "leader",
            SensorKind::PolarizationMosaic,
            Roi::new(3, 5, 6, 7),
            None,
        );
        let raw = RawFrame::from_plane(ramp(16, 20), 450);

        let first = pipeline.process(raw.clone()).unwrap();
        let second = pipeline.process(raw).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.snr().to_bits(), second.snr().to_bits());
        assert_eq!(first.exposure_ms(), 450);
    }

    #[test]
    fn test_mosaic_frame_has_four_angles_plus_raw() {
        let crop = Roi::new(2, 4, 4, 6);
        let plane = ramp(10, 12);
        let pipeline = CapturePipeline::new("leader", SensorKind::PolarizationMosaic, crop, None);

        let frame = pipeline
            .process(RawFrame::from_plane(plane.clone(), 100))
            .unwrap();
        assert_eq!(frame.dim(), (5, 4, 6));

        let raw_channel = frame.channel(4).unwrap();
        let expected = plane.slice(s![2..6, 4..10]);
        assert_eq!(raw_channel, expected);
    }

    #[test]
    fn test_windowed_demosaic_matches_full_frame() {
        let plane = ramp(14, 18);
        let full = demosaic_polarization(plane.view()).unwrap();

        for crop in [
            Roi::new(0, 0, 5, 5),
            Roi::new(3, 7, 6, 4),
            Roi::new(9, 13, 5, 5),
            Roi::new(1, 1, 12, 16),
        ] {
            let pipeline =
                CapturePipeline::new("leader", SensorKind::PolarizationMosaic, crop, None);
            let frame = pipeline
                .process(RawFrame::from_plane(plane.clone(), 1))
                .unwrap();
            let expected = full.slice(s![.., crop.y..crop.y_end(), crop.x..crop.x_end()]);
            assert_eq!(frame.data().slice(s![0..4, .., ..]), expected, "crop {crop}");
        }
    }

    #[test]
    fn test_uniform_mosaic_demosaics_to_its_angles() {
        // [[90, 45], [135, 0]] tiled
        let plane = Array2::from_shape_fn((6, 8), |(y, x)| match (y % 2, x % 2) {
            (0, 0) => 90.0,
            (0, 1) => 45.0,
            (1, 0) => 135.0,
            _ => 0.0,
        });
        let angles = demosaic_polarization(plane.view()).unwrap();
        for (channel, value) in [(0, 0.0), (1, 45.0), (2, 90.0), (3, 135.0)] {
            assert!(
                angles.index_axis(Axis(0), channel).iter().all(|&v| v == value),
                "channel {channel}"
            );
        }
    }

    #[test]
    fn test_dark_subtraction_clips_at_zero() {
        let raw = Array3::from_shape_vec((2, 2, 2), vec![10.0, 5.0, 3.0, 8.0, 1.0, 1.0, 1.0, 1.0])
            .unwrap();
        let dark = CalibrationFrame::new(Array3::from_elem((2, 2, 2), 4.0).into_dyn());
        let pipeline = CapturePipeline::new(
            "follower",
            SensorKind::Hyperspectral,
            Roi::new(0, 0, 2, 2),
            Some(Arc::new(dark)),
        );

        let frame = pipeline.process(RawFrame::new(raw, 4500)).unwrap();
        assert_eq!(
            frame.data().iter().copied().collect::<Vec<_>>(),
            vec![6.0, 1.0, 0.0, 4.0, 0.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_crop_outside_frame_is_rejected() {
        let pipeline = CapturePipeline::new(
            "follower",
            SensorKind::Hyperspectral,
            Roi::new(75, 116, 120, 120),
            None,
        );
        let err = pipeline
            .process(RawFrame::new(Array3::zeros((3, 100, 100)), 10))
            .unwrap_err();
        assert!(matches!(err, DaqError::RoiOutOfBounds { .. }));
        assert!(err.is_configuration_fault());
    }

    #[test]
    fn test_calibration_shape_mismatch_is_rejected() {
        let dark = CalibrationFrame::new(Array2::zeros((8, 8)).into_dyn());
        let pipeline = CapturePipeline::new(
            "leader",
            SensorKind::PolarizationMosaic,
            Roi::new(0, 0, 4, 4),
            Some(Arc::new(dark)),
        );
        let err = pipeline
            .process(RawFrame::from_plane(Array2::zeros((10, 10)), 10))
            .unwrap_err();
        assert!(matches!(err, DaqError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_processed_channels() {
        assert_eq!(SensorKind::PolarizationMosaic.processed_channels(1), 5);
        assert_eq!(SensorKind::Hyperspectral.processed_channels(41), 41);
    }
}
