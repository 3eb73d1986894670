//! Integration grids.

use serde::{Deserialize, Serialize};

use crate::error::CodegenError;

/// An ordered sequence of integration breakpoints along the horizon.
///
/// The grid may be non-equidistant; per-interval step counts are configured
/// on the integrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    points: Vec<f64>,
}

impl Grid {
    /// A grid from explicit breakpoints. Points must be strictly increasing
    /// and at least two.
    pub fn new(points: Vec<f64>) -> Result<Self, CodegenError> {
        if points.len() < 2 {
            return Err(CodegenError::InvalidGrid(
                "a grid needs at least two breakpoints".into(),
            ));
        }
        if points.windows(2).any(|w| w[1] <= w[0]) {
            return Err(CodegenError::InvalidGrid(
                "breakpoints must be strictly increasing".into(),
            ));
        }
        Ok(Self { points })
    }

    /// An equidistant grid over `[start, end]` with `intervals` intervals.
    pub fn equidistant(start: f64, end: f64, intervals: usize) -> Result<Self, CodegenError> {
        if intervals == 0 || end <= start {
            return Err(CodegenError::InvalidGrid(format!(
                "cannot build {} intervals over [{}, {}]",
                intervals, start, end
            )));
        }
        let h = (end - start) / intervals as f64;
        let points = (0..=intervals).map(|i| start + i as f64 * h).collect();
        Ok(Self { points })
    }

    pub fn points(&self) -> &[f64] {
        &self.points
    }

    pub fn num_intervals(&self) -> usize {
        self.points.len() - 1
    }

    pub fn first(&self) -> f64 {
        self.points[0]
    }

    pub fn last(&self) -> f64 {
        self.points[self.points.len() - 1]
    }

    /// Width of interval `i`.
    pub fn step_size(&self, interval: usize) -> f64 {
        self.points[interval + 1] - self.points[interval]
    }

    /// Whether all intervals have (numerically) the same width.
    pub fn is_equidistant(&self) -> bool {
        let h = self.step_size(0);
        (1..self.num_intervals()).all(|i| (self.step_size(i) - h).abs() <= 1e-12 * h.abs())
    }

    /// Index of the integration interval containing `time`. Times outside
    /// the grid clamp to the first or last interval.
    pub fn interval_of(&self, time: f64) -> usize {
        if time <= self.points[0] {
            return 0;
        }
        for i in 0..self.num_intervals() {
            if time < self.points[i + 1] {
                return i;
            }
        }
        self.num_intervals() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_equidistant_grid() {
        let grid = Grid::equidistant(0.0, 1.0, 4).unwrap();
        assert_eq!(grid.num_intervals(), 4);
        assert!(grid.is_equidistant());
        assert_relative_eq!(grid.step_size(2), 0.25);
    }

    #[test]
    fn test_non_monotone_rejected() {
        assert!(Grid::new(vec![0.0, 0.5, 0.5]).is_err());
        assert!(Grid::new(vec![1.0]).is_err());
    }

    #[test]
    fn test_interval_lookup() {
        let grid = Grid::new(vec![0.0, 0.1, 0.5, 1.0]).unwrap();
        assert_eq!(grid.interval_of(-1.0), 0);
        assert_eq!(grid.interval_of(0.05), 0);
        assert_eq!(grid.interval_of(0.3), 1);
        assert_eq!(grid.interval_of(0.99), 2);
        assert_eq!(grid.interval_of(7.0), 2);
        assert!(!grid.is_equidistant());
    }
}
