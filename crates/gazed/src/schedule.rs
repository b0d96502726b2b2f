//! Calibration target walk: a shuffled square grid, fixed dwell per target.

use rand::seq::SliceRandom;
use rand::Rng;

// --- Named constants (no magic numbers) ---
/// Grid spans [GRID_MIN, GRID_MAX] on both axes, away from the screen edges.
const GRID_MIN: f64 = 0.2;
const GRID_MAX: f64 = 0.8;

/// Evenly spaced grid of normalised targets, row-major before shuffling.
///
/// A single-point grid sits at the screen centre.
pub fn grid(size: usize) -> Vec<(f64, f64)> {
    let axis: Vec<f64> = match size {
        0 => Vec::new(),
        1 => vec![(GRID_MIN + GRID_MAX) / 2.0],
        n => (0..n)
            .map(|i| GRID_MIN + (GRID_MAX - GRID_MIN) * i as f64 / (n - 1) as f64)
            .collect(),
    };
    axis.iter()
        .flat_map(|&x| axis.iter().map(move |&y| (x, y)))
        .collect()
}

/// What a processed frame did to the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Still on the same target.
    Dwell,
    /// Moved on to the next target.
    NextTarget,
    /// That was the last frame of the last target.
    Finished,
}

#[derive(Debug, Clone)]
pub struct CalibrationSchedule {
    targets: Vec<(f64, f64)>,
    index: usize,
    frames_on_target: usize,
    frames_per_target: usize,
}

impl CalibrationSchedule {
    pub fn new<R: Rng + ?Sized>(grid_size: usize, frames_per_target: usize, rng: &mut R) -> Self {
        let mut targets = grid(grid_size);
        targets.shuffle(rng);
        Self {
            targets,
            index: 0,
            frames_on_target: 0,
            frames_per_target: frames_per_target.max(1),
        }
    }

    /// Target the user should be looking at, `None` once finished.
    pub fn current(&self) -> Option<(f64, f64)> {
        self.targets.get(self.index).copied()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_finished(&self) -> bool {
        self.index >= self.targets.len()
    }

    /// Count one processed frame against the current target.
    pub fn advance(&mut self) -> Step {
        if self.is_finished() {
            return Step::Finished;
        }
        self.frames_on_target += 1;
        if self.frames_on_target < self.frames_per_target {
            return Step::Dwell;
        }
        self.frames_on_target = 0;
        self.index += 1;
        if self.is_finished() {
            Step::Finished
        } else {
            Step::NextTarget
        }
    }
}
