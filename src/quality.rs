//! Signal-quality gate applied to every processed frame before it is accepted.

use ndarray::{ArrayBase, Data, Dimension};
use serde::Serialize;

use crate::frame::ProcessedFrame;

/// Mean over population standard deviation of all elements.
///
/// Returns exactly `0.0` for empty or zero-variance arrays.
pub fn snr<S, D>(data: &ArrayBase<S, D>) -> f64
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    let n = data.len();
    if n == 0 {
        return 0.0;
    }
    let mean = data.sum() / n as f64;
    let variance = data.fold(0.0, |acc, &v| acc + (v - mean) * (v - mean)) / n as f64;
    let sd = variance.sqrt();
    if sd == 0.0 {
        0.0
    } else {
        mean / sd
    }
}

/// Outcome of evaluating a frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum QualityVerdict {
    /// SNR above the threshold.
    Accepted {
        /// Measured SNR
        snr: f64,
    },
    /// SNR at or below the threshold.
    Rejected {
        /// Measured SNR
        snr: f64,
        /// Threshold it failed
        min_snr: f64,
    },
}

impl QualityVerdict {
    /// Whether the frame passed.
    pub fn is_accepted(&self) -> bool {
        matches!(self, QualityVerdict::Accepted { .. })
    }
}

/// Accepts frames whose SNR strictly exceeds a fixed minimum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    min_snr: f64,
}

impl QualityGate {
    /// Default minimum SNR.
    pub const DEFAULT_MIN_SNR: f64 = 0.05;

    /// Gate with the given threshold.
    pub fn new(min_snr: f64) -> Self {
        Self { min_snr }
    }

    /// Configured threshold.
    pub fn min_snr(&self) -> f64 {
        self.min_snr
    }

    /// Check the SNR carried by a processed frame.
    pub fn evaluate(&self, frame: &ProcessedFrame) -> QualityVerdict {
        let snr = frame.snr();
        if snr > self.min_snr {
            QualityVerdict::Accepted { snr }
        } else {
            QualityVerdict::Rejected {
                snr,
                min_snr: self.min_snr,
            }
        }
    }
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MIN_SNR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn test_zero_variance_snr_is_zero() {
        let flat = Array3::from_elem((2, 3, 3), 1234.0);
        assert_eq!(snr(&flat), 0.0);
        assert_eq!(snr(&Array3::<f64>::zeros((1, 4, 4))), 0.0);
        assert_eq!(snr(&Array3::<f64>::zeros((0, 4, 4))), 0.0);
    }

    #[test]
    fn test_snr_matches_population_statistics() {
        // mean 5, population sd 2
        let data = array![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((snr(&data) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_gate_threshold_is_strict() {
        let gate = QualityGate::default();
        let at_threshold = ProcessedFrame::new(Array3::zeros((1, 1, 1)), 10, 0.05);
        let above = ProcessedFrame::new(Array3::zeros((1, 1, 1)), 10, 0.051);

        assert_eq!(
            gate.evaluate(&at_threshold),
            QualityVerdict::Rejected {
                snr: 0.05,
                min_snr: 0.05
            }
        );
        assert!(gate.evaluate(&above).is_accepted());
    }
}
