//! Convergence trackers for auto exposure and autofocus.
//!
//! Both trackers are pure state machines fed one sample at a time. Once a
//! tracker reaches a terminal state further samples are ignored.

use serde::{Deserialize, Serialize};

/// Progress of the exposure tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureState {
    /// Brightness has not yet held inside the band long enough.
    Settling,
    /// Brightness held inside the band for the required run.
    Converged,
}

/// Tracks mean brightness until it stays inside a band for a run of samples.
#[derive(Debug, Clone)]
pub struct ExposureTracker {
    min: f64,
    max: f64,
    required: u32,
    run: u32,
    samples: u32,
    converged_at: Option<u32>,
}

impl ExposureTracker {
    /// Converge once `required` consecutive samples fall within `[min, max]`.
    pub fn new(min: f64, max: f64, required: u32) -> Self {
        Self {
            min,
            max,
            required: required.max(1),
            run: 0,
            samples: 0,
            converged_at: None,
        }
    }

    /// Feed one brightness sample.
    pub fn push(&mut self, brightness: f64) -> ExposureState {
        if self.converged_at.is_some() {
            return ExposureState::Converged;
        }
        self.samples += 1;
        if (self.min..=self.max).contains(&brightness) {
            self.run += 1;
        } else {
            self.run = 0;
        }
        if self.run >= self.required {
            self.converged_at = Some(self.samples);
            return ExposureState::Converged;
        }
        ExposureState::Settling
    }

    /// Samples seen so far.
    pub const fn samples(&self) -> u32 {
        self.samples
    }

    /// Current consecutive in-band run.
    pub const fn run(&self) -> u32 {
        self.run
    }

    /// Sample count at which convergence was declared.
    pub const fn converged_at(&self) -> Option<u32> {
        self.converged_at
    }
}

/// Settings for autofocus convergence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusCriteria {
    /// Largest relative change between successive scores that still counts
    /// as flat.
    pub epsilon: f64,
    /// Consecutive flat deltas required for a plateau.
    pub plateau_samples: u32,
    /// Direction reversals tolerated before the lens is declared hunting.
    pub max_reversals: u32,
}

impl Default for FocusCriteria {
    fn default() -> Self {
        Self {
            epsilon: 0.02,
            plateau_samples: 3,
            max_reversals: 3,
        }
    }
}

/// Progress of the focus tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusState {
    /// Still moving.
    Tracking,
    /// Scores plateaued.
    Converged,
    /// Scores oscillated too often before plateauing.
    Hunting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Rising,
    Falling,
}

/// Tracks the sharpness score sequence of successive autofocus steps.
#[derive(Debug, Clone)]
pub struct FocusTracker {
    criteria: FocusCriteria,
    last: Option<f64>,
    direction: Option<Direction>,
    reversals: u32,
    plateau: u32,
    samples: u32,
    peak: f64,
    state: FocusState,
}

impl FocusTracker {
    /// New tracker.
    pub const fn new(criteria: FocusCriteria) -> Self {
        Self {
            criteria,
            last: None,
            direction: None,
            reversals: 0,
            plateau: 0,
            samples: 0,
            peak: 0.0,
            state: FocusState::Tracking,
        }
    }

    /// Feed one sharpness score.
    pub fn push(&mut self, score: f64) -> FocusState {
        if self.state != FocusState::Tracking {
            return self.state;
        }
        self.samples += 1;
        self.peak = self.peak.max(score);

        let Some(last) = self.last.replace(score) else {
            return self.state;
        };
        let delta = score - last;
        if delta.abs() <= self.criteria.epsilon * last.abs().max(1.0) {
            self.plateau += 1;
            if self.plateau >= self.criteria.plateau_samples.max(1) {
                self.state = FocusState::Converged;
            }
            return self.state;
        }

        self.plateau = 0;
        let direction = if delta > 0.0 {
            Direction::Rising
        } else {
            Direction::Falling
        };
        if self.direction.is_some_and(|previous| previous != direction) {
            self.reversals += 1;
            if self.reversals > self.criteria.max_reversals {
                self.state = FocusState::Hunting;
            }
        }
        self.direction = Some(direction);
        self.state
    }

    /// Current state.
    pub const fn state(&self) -> FocusState {
        self.state
    }

    /// Direction reversals seen.
    pub const fn reversals(&self) -> u32 {
        self.reversals
    }

    /// Scores seen.
    pub const fn samples(&self) -> u32 {
        self.samples
    }

    /// Most recent score.
    pub const fn last(&self) -> Option<f64> {
        self.last
    }

    /// Highest score seen.
    pub const fn peak(&self) -> f64 {
        self.peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exposure_converges_after_run() {
        let mut tracker = ExposureTracker::new(80.0, 180.0, 3);
        for value in [40.0, 60.0, 85.0, 90.0] {
            assert_eq!(tracker.push(value), ExposureState::Settling);
        }
        assert_eq!(tracker.push(100.0), ExposureState::Converged);
        assert_eq!(tracker.converged_at(), Some(5));
        assert_eq!(tracker.push(10.0), ExposureState::Converged);
    }

    #[test]
    fn test_exposure_run_resets_outside_band() {
        let mut tracker = ExposureTracker::new(80.0, 180.0, 2);
        tracker.push(100.0);
        tracker.push(200.0);
        assert_eq!(tracker.run(), 0);
        assert_eq!(tracker.push(120.0), ExposureState::Settling);
        assert_eq!(tracker.push(180.0), ExposureState::Converged);
    }

    #[test]
    fn test_focus_plateau() {
        let mut tracker = FocusTracker::new(FocusCriteria::default());
        for score in [100.0, 500.0, 1500.0, 2500.0, 2510.0, 2515.0] {
            assert_eq!(tracker.push(score), FocusState::Tracking);
        }
        assert_eq!(tracker.push(2516.0), FocusState::Converged);
        assert_eq!(tracker.reversals(), 0);
        assert!((tracker.peak() - 2516.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_focus_hunting() {
        let criteria = FocusCriteria {
            max_reversals: 2,
            ..FocusCriteria::default()
        };
        let mut tracker = FocusTracker::new(criteria);
        let scores = [100.0, 2000.0, 300.0, 2100.0, 250.0];
        let states: Vec<_> = scores.iter().map(|&s| tracker.push(s)).collect();
        assert_eq!(states.last(), Some(&FocusState::Hunting));
        assert_eq!(tracker.reversals(), 3);
        assert_eq!(tracker.push(2000.0), FocusState::Hunting);
    }

    #[test]
    fn test_focus_small_scores_use_absolute_floor() {
        let mut tracker = FocusTracker::new(FocusCriteria {
            epsilon: 0.5,
            plateau_samples: 1,
            max_reversals: 0,
        });
        tracker.push(0.0);
        assert_eq!(tracker.push(0.4), FocusState::Converged);
    }
}
