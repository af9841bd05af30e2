//! Closed-loop exposure search.
//!
//! The controller is a pure step function over an explicit [`ExposureState`]: feed it the
//! state and the peak intensity measured on the *processed* frame and it returns the next
//! state plus the action the session should take. No hardware is touched here, which keeps
//! the search deterministic under test.
//!
//! # Step policy
//!
//! ```text
//! peak in [target - tolerance, target]  -> Converged
//! peak >  target                        -> exposure -= max(1, |peak - target| / 10)
//! peak <  target - tolerance            -> exposure += max(1, |peak - target| / 10)
//! ```
//!
//! The exposure is clamped to `[min_ms, max_ms]` after every adjustment.
//!
//! # Attempt budget
//!
//! `attempts_remaining` is the *combined* budget of a capture session: exposure
//! iterations, hardware faults and quality-gate rejections all draw from it. Each call to
//! [`step`] consumes one attempt; the session consumes one directly for iterations that
//! never produce a frame.

use serde::{Deserialize, Serialize};

/// Default combined attempt budget per session.
pub const DEFAULT_ATTEMPT_BUDGET: u32 = 15;

/// Inclusive exposure bounds in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureLimits {
    /// Shortest allowed exposure (at least 1 ms)
    pub min_ms: u64,
    /// Longest allowed exposure
    pub max_ms: u64,
}

impl ExposureLimits {
    /// Clamp `ms` into the limits; never returns less than 1.
    pub fn clamp(&self, ms: u64) -> u64 {
        ms.min(self.max_ms).max(self.min_ms.max(1))
    }
}

/// Peak-intensity band the search converges into.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureTarget {
    /// Upper edge of the band
    pub target_peak: f64,
    /// Width of the band below `target_peak`
    pub tolerance: f64,
}

impl ExposureTarget {
    /// Whether `peak` lies in `[target_peak - tolerance, target_peak]`.
    pub fn contains(&self, peak: f64) -> bool {
        peak >= self.target_peak - self.tolerance && peak <= self.target_peak
    }
}

/// Mutable exposure record owned by one sensor's capture session.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureState {
    current_ms: u64,
    target: Option<ExposureTarget>,
    attempts_remaining: u32,
    limits: ExposureLimits,
}

impl ExposureState {
    /// State for a sensor that searches for its exposure.
    pub fn adaptive(initial_ms: u64, target: ExposureTarget, limits: ExposureLimits) -> Self {
        Self {
            current_ms: limits.clamp(initial_ms),
            target: Some(target),
            attempts_remaining: DEFAULT_ATTEMPT_BUDGET,
            limits,
        }
    }

    /// State for a sensor that always integrates for the same time.
    pub fn fixed(exposure_ms: u64, limits: ExposureLimits) -> Self {
        Self {
            current_ms: limits.clamp(exposure_ms),
            target: None,
            attempts_remaining: DEFAULT_ATTEMPT_BUDGET,
            limits,
        }
    }

    /// Exposure the next capture will use.
    pub fn current_ms(&self) -> u64 {
        self.current_ms
    }

    /// Target band, if the sensor searches for its exposure.
    pub fn target(&self) -> Option<ExposureTarget> {
        self.target
    }

    /// Whether the exposure is searched rather than fixed.
    pub fn is_adaptive(&self) -> bool {
        self.target.is_some()
    }

    /// Attempts left in the current session.
    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining
    }

    /// Exposure bounds.
    pub fn limits(&self) -> ExposureLimits {
        self.limits
    }

    /// Start a new session with a fresh budget; the exposure carries over.
    pub fn begin_session(&mut self, budget: u32) {
        self.attempts_remaining = budget;
    }

    /// Spend one attempt on an iteration that produced no usable measurement.
    pub fn consume_attempt(&mut self) {
        self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
    }

    /// Restart future searches from `ms`.
    pub fn reset_to(&mut self, ms: u64) {
        self.current_ms = self.limits.clamp(ms);
    }
}

/// What the session should do after one measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExposureAction {
    /// The exposure is good; go on to validate the frame.
    Converged {
        /// Exposure that produced the frame
        exposure_ms: u64,
    },
    /// Re-expose with a new duration.
    Adjust {
        /// Exposure that produced the measurement
        from_ms: u64,
        /// Exposure for the next capture
        to_ms: u64,
        /// Measured peak
        peak: f64,
    },
    /// Budget spent without reaching the band.
    Exhausted {
        /// Last attempted exposure
        exposure_ms: u64,
        /// Last measured peak
        peak: f64,
    },
}

/// Adjustment magnitude for a measured peak.
pub fn exposure_step(peak: f64, target_peak: f64) -> u64 {
    ((peak - target_peak).abs() / 10.0).floor().max(1.0) as u64
}

/// Advance the search by one measurement.
///
/// Consumes one attempt. Fixed-exposure states, or a missing peak, accept the current
/// exposure.
pub fn step(mut state: ExposureState, peak: Option<f64>) -> (ExposureState, ExposureAction) {
    state.attempts_remaining = state.attempts_remaining.saturating_sub(1);
    let current = state.current_ms;

    let (target, peak) = match (state.target, peak) {
        (Some(target), Some(peak)) => (target, peak),
        _ => {
            return (
                state,
                ExposureAction::Converged {
                    exposure_ms: current,
                },
            )
        }
    };

    if target.contains(peak) {
        return (
            state,
            ExposureAction::Converged {
                exposure_ms: current,
            },
        );
    }
    if state.attempts_remaining == 0 {
        return (
            state,
            ExposureAction::Exhausted {
                exposure_ms: current,
                peak,
            },
        );
    }

    let delta = exposure_step(peak, target.target_peak);
    let next = if peak > target.target_peak {
        current.saturating_sub(delta)
    } else {
        current.saturating_add(delta)
    };
    state.current_ms = state.limits.clamp(next);

    let to_ms = state.current_ms;
    (
        state,
        ExposureAction::Adjust {
            from_ms: current,
            to_ms,
            peak,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: ExposureLimits = ExposureLimits {
        min_ms: 1,
        max_ms: 1_000_000,
    };

    fn saturating_sensor(gain: f64) -> impl Fn(u64) -> f64 {
        move |ms| (ms as f64 * gain).min(4095.0)
    }

    /// Drive the search until it stops; returns the final state, action and measurement count.
    fn search(
        mut state: ExposureState,
        sensor: impl Fn(u64) -> f64,
    ) -> (ExposureState, ExposureAction, u32) {
        let mut iterations = 0;
        loop {
            iterations += 1;
            let peak = sensor(state.current_ms());
            let (next, action) = step(state, Some(peak));
            state = next;
            if !matches!(action, ExposureAction::Adjust { .. }) {
                return (state, action, iterations);
            }
        }
    }

    fn target(target_peak: f64, tolerance: f64) -> ExposureTarget {
        ExposureTarget {
            target_peak,
            tolerance,
        }
    }

    #[test]
    fn test_reference_scenario_converges_immediately() {
        let state = ExposureState::adaptive(450, target(4050.0, 100.0), LIMITS);
        let (state, action, iterations) = search(state, saturating_sensor(9.0));

        let ExposureAction::Converged { exposure_ms } = action else {
            panic!("expected convergence, got {action:?}");
        };
        assert!((450..=455).contains(&exposure_ms));
        assert!(iterations <= 5);
        assert_eq!(state.current_ms(), exposure_ms);
    }

    #[test]
    fn test_converges_from_dim_starts() {
        for (goal, gain) in [(target(4050.0, 100.0), 9.0), (target(3000.0, 200.0), 4.0)] {
            for start in [10, 50, 100, 200, 300, 400] {
                let state = ExposureState::adaptive(start, goal, LIMITS);
                let (state, action, iterations) = search(state, saturating_sensor(gain));
                assert!(
                    matches!(action, ExposureAction::Converged { .. }),
                    "start {start} gain {gain}: {action:?}"
                );
                assert!(iterations <= DEFAULT_ATTEMPT_BUDGET);
                assert!(goal.contains(saturating_sensor(gain)(state.current_ms())));
            }
        }
    }

    #[test]
    fn test_unreachable_band_exhausts_exactly_at_budget() {
        // A capped-off sensor never leaves zero.
        let state = ExposureState::adaptive(450, target(4050.0, 100.0), LIMITS);
        let (state, action, iterations) = search(state, |_| 0.0);
        assert!(matches!(action, ExposureAction::Exhausted { .. }));
        assert_eq!(iterations, DEFAULT_ATTEMPT_BUDGET);
        assert_eq!(state.attempts_remaining(), 0);

        let mut state = ExposureState::adaptive(450, target(4050.0, 100.0), LIMITS);
        state.begin_session(4);
        let (_, action, iterations) = search(state, |_| 4095.0);
        assert!(matches!(action, ExposureAction::Exhausted { .. }));
        assert_eq!(iterations, 4);
    }

    #[test]
    fn test_never_drops_below_minimum() {
        let limits = ExposureLimits {
            min_ms: 5,
            max_ms: 10_000,
        };
        let mut state = ExposureState::adaptive(450, target(100.0, 10.0), limits);
        state.begin_session(50);
        for _ in 0..50 {
            let (next, action) = step(state, Some(4095.0));
            state = next;
            assert!(state.current_ms() >= 5);
            if let ExposureAction::Adjust { to_ms, .. } = action {
                assert!(to_ms >= 5);
            }
        }
        assert_eq!(state.current_ms(), 5);
    }

    #[test]
    fn test_step_size_is_proportional_with_floor_of_one() {
        assert_eq!(exposure_step(4095.0, 4050.0), 4);
        assert_eq!(exposure_step(4051.0, 4050.0), 1);
        assert_eq!(exposure_step(850.0, 4050.0), 320);

        let state = ExposureState::adaptive(100, target(4050.0, 100.0), LIMITS);
        let (state, action) = step(state, Some(850.0));
        assert_eq!(
            action,
            ExposureAction::Adjust {
                from_ms: 100,
                to_ms: 420,
                peak: 850.0
            }
        );
        assert_eq!(state.attempts_remaining(), DEFAULT_ATTEMPT_BUDGET - 1);
    }

    #[test]
    fn test_increase_is_clamped_to_maximum() {
        let limits = ExposureLimits {
            min_ms: 1,
            max_ms: 500,
        };
        let state = ExposureState::adaptive(480, target(4050.0, 100.0), limits);
        let (state, _) = step(state, Some(0.0));
        assert_eq!(state.current_ms(), 500);
    }

    #[test]
    fn test_fixed_exposure_always_converges_and_spends_budget() {
        let state = ExposureState::fixed(4500, LIMITS);
        let (state, action) = step(state, None);
        assert_eq!(action, ExposureAction::Converged { exposure_ms: 4500 });
        assert_eq!(state.attempts_remaining(), DEFAULT_ATTEMPT_BUDGET - 1);
        assert!(!state.is_adaptive());
    }

    #[test]
    fn test_reset_is_clamped() {
        let mut state = ExposureState::adaptive(450, target(4050.0, 100.0), LIMITS);
        state.reset_to(255);
        assert_eq!(state.current_ms(), 255);
        state.reset_to(0);
        assert_eq!(state.current_ms(), 1);
    }
}
