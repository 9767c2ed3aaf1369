//! Turns an accumulated window into the direction of the loudest source.
//!
//! The level map is searched for its maximum. Ties go to the first cell of a
//! scan in which the x index varies slowest, so equal maps always produce
//! equal directions. The peak cell's position `(x, y, z)` on the steering
//! plane, normalized, is the direction. Azimuth and elevation are reported
//! alongside:
//!
//! ```text
//! azimuth   = atan2(x, z)
//! elevation = atan2(-y, sqrt(x^2 + z^2))
//! ```

use crate::accumulator::SampleWindow;
use crate::beamformer::LevelMapper;
use crate::error::LocatorError;
use crate::geometry::MicGeometry;
use crate::grid::SteeringGrid;
use crate::{Position, Radian};

use log::debug;
use ndarray::Array2;

/// A unit direction in the station's local frame, pointing at the loudest
/// cell of the steering grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Direction {
    /// Unit vector toward the source
    pub vector: Position,
    /// Rotation about the vertical axis, positive toward +x
    pub azimuth: Radian,
    /// Angle above the array plane, positive toward -y
    pub elevation: Radian,
    /// Grid cell `(i, j)` of the peak
    pub peak: (usize, usize),
    /// Level of the peak, dB
    pub level: f64,
}

/// Finds the loudest cell. NaN levels never win, and among equal levels the
/// cell seen first with `i` varying slowest is kept.
pub fn find_peak(levels: &Array2<f64>) -> Option<(usize, usize)> {
    let (nx, ny) = levels.dim();
    let mut best: Option<((usize, usize), f64)> = None;
    for i in 0..nx {
        for j in 0..ny {
            let level = levels[[i, j]];
            if level.is_nan() {
                continue;
            }
            match best {
                Some((_, top)) if level <= top => {}
                _ => best = Some(((i, j), level)),
            }
        }
    }
    best.map(|(cell, _)| cell)
}

/// Normalizes a steering plane position into a [`Direction`].
pub fn direction_to(
    point: Position,
    peak: (usize, usize),
    level: f64,
) -> Result<Direction, LocatorError> {
    let norm = point.norm();
    if norm == 0.0 || !norm.is_finite() {
        return Err(LocatorError::DegenerateGeometry);
    }
    let (x, y, z) = (point.x, point.y, point.z);

    Ok(Direction {
        vector: point / norm,
        azimuth: x.atan2(z),
        elevation: (-y).atan2((x * x + z * z).sqrt()),
        peak,
        level,
    })
}

/// Wraps a [`LevelMapper`] together with the station's array and grid.
pub struct DirectionEstimator {
    geometry: MicGeometry,
    grid: SteeringGrid,
    freq: f64,
    n_bands: u32,
    mapper: Box<dyn LevelMapper>,
}

impl DirectionEstimator {
    /// Instantiates an estimator that looks for sources around `freq` Hz,
    /// in `1/n_bands` octave bands (`0` for a single frequency bin).
    pub fn new(
        geometry: MicGeometry,
        grid: SteeringGrid,
        freq: f64,
        n_bands: u32,
        mapper: Box<dyn LevelMapper>,
    ) -> Self {
        Self {
            geometry,
            grid,
            freq,
            n_bands,
            mapper,
        }
    }

    /// The steering grid searched for the peak
    pub fn grid(&self) -> &SteeringGrid {
        &self.grid
    }

    /// The microphone array the window was recorded with
    pub fn geometry(&self) -> &MicGeometry {
        &self.geometry
    }

    /// Estimates the direction of the loudest source in `window`.
    pub fn estimate(&self, window: &SampleWindow) -> Result<Direction, LocatorError> {
        if window.is_empty() {
            return Err(LocatorError::InsufficientData);
        }

        let levels = self.mapper.compute_level_map(
            window,
            &self.geometry,
            &self.grid,
            self.freq,
            self.n_bands,
        )?;
        if levels.dim() != self.grid.shape() {
            return Err(LocatorError::Dsp(format!(
                "level map is {:?}, grid is {:?}",
                levels.dim(),
                self.grid.shape()
            )));
        }

        let (i_max, j_max) = find_peak(&levels)
            .ok_or_else(|| LocatorError::Dsp("level map has no usable values".to_owned()))?;
        let peak = self.grid.point(i_max, j_max);
        debug!("i_max: {}, j_max: {}", i_max, j_max);
        debug!("x_max: {}, y_max: {}, z_max: {}", peak.x, peak.y, peak.z);

        let direction = direction_to(peak, (i_max, j_max), levels[[i_max, j_max]])?;
        debug!(
            "azm: {:.1} deg, elv: {:.1} deg, level {:.1} dB",
            direction.azimuth.to_degrees(),
            direction.elevation.to_degrees(),
            direction.level
        );
        Ok(direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beamformer::{tests::tone_from, BaseBeamformer};
    use rand::prelude::*;
    use std::f64::consts::FRAC_PI_4;

    /// Returns the same map whatever the input
    struct FixedMap(Array2<f64>);

    impl LevelMapper for FixedMap {
        fn compute_level_map(
            &self,
            _window: &SampleWindow,
            _geometry: &MicGeometry,
            _grid: &SteeringGrid,
            _freq: f64,
            _n_bands: u32,
        ) -> Result<Array2<f64>, LocatorError> {
            Ok(self.0.clone())
        }
    }

    fn fixed_estimator(grid: SteeringGrid, levels: Array2<f64>) -> DirectionEstimator {
        DirectionEstimator::new(
            MicGeometry::uma16(),
            grid,
            4120.0,
            3,
            Box::new(FixedMap(levels)),
        )
    }

    fn some_window() -> SampleWindow {
        SampleWindow::new(Array2::zeros((128, 16)), 48000.0)
    }

    #[test]
    fn test_empty_window() {
        let grid = SteeringGrid::square(1.0, 1.0, 0.5).unwrap();
        let est = fixed_estimator(grid, Array2::zeros((5, 5)));
        let empty = SampleWindow::new(Array2::zeros((0, 16)), 48000.0);
        assert!(matches!(
            est.estimate(&empty),
            Err(LocatorError::InsufficientData)
        ));
    }

    #[test]
    fn test_tie_break_x_slowest() {
        let mut levels = Array2::zeros((3, 3));
        levels[[1, 0]] = 10.0;
        levels[[0, 2]] = 10.0;
        levels[[2, 2]] = 10.0;
        assert_eq!(find_peak(&levels), Some((0, 2)));
    }

    #[test]
    fn test_nan_never_wins() {
        let mut levels = Array2::from_elem((2, 2), f64::NAN);
        assert_eq!(find_peak(&levels), None);
        levels[[1, 1]] = -20.0;
        assert_eq!(find_peak(&levels), Some((1, 1)));
    }

    #[test]
    fn test_angles() {
        let grid = SteeringGrid::square(1.0, 1.0, 1.0).unwrap();
        let mut levels = Array2::zeros((3, 3));
        // cell (2, 0) is x = 1, y = -1, z = 1
        levels[[2, 0]] = 1.0;
        let dir = fixed_estimator(grid, levels).estimate(&some_window()).unwrap();

        assert_eq!(dir.peak, (2, 0));
        assert!((dir.azimuth - FRAC_PI_4).abs() < 1e-12);
        assert!((dir.elevation - (1.0 / 2f64.sqrt()).atan()).abs() < 1e-12);
        let expected = Position::new(1.0, -1.0, 1.0) / 3f64.sqrt();
        assert!((dir.vector - expected).norm() < 1e-12);
    }

    #[test]
    fn test_always_unit_length() {
        let grid = SteeringGrid::new(-2.0, 2.0, -1.0, 1.5, 0.7, 0.25).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let (nx, ny) = grid.shape();
        for _ in 0..50 {
            let levels = Array2::from_shape_fn((nx, ny), |_| rng.gen_range(-30.0..90.0));
            let dir = fixed_estimator(grid.clone(), levels)
                .estimate(&some_window())
                .unwrap();
            assert!((dir.vector.norm() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_degenerate_grid() {
        // A single cell at the array centre, zero depth
        let grid = SteeringGrid::square(0.0, 0.0, 0.1).unwrap();
        let est = fixed_estimator(grid, Array2::zeros((1, 1)));
        assert!(matches!(
            est.estimate(&some_window()),
            Err(LocatorError::DegenerateGeometry)
        ));
    }

    #[test]
    fn test_wrong_map_shape() {
        let grid = SteeringGrid::square(1.0, 1.0, 0.5).unwrap();
        let est = fixed_estimator(grid, Array2::zeros((2, 2)));
        assert!(matches!(est.estimate(&some_window()), Err(LocatorError::Dsp(_))));
    }

    #[test]
    fn test_points_at_tone() {
        let geometry = MicGeometry::uma16();
        let grid = SteeringGrid::square(1.0, 1.0, 0.25).unwrap();
        let source = Position::new(-0.75, 0.5, 1.0);
        let window = tone_from(source, &geometry, 3750.0, 48000.0, 1024);

        let est = DirectionEstimator::new(
            geometry,
            grid,
            3750.0,
            0,
            Box::new(BaseBeamformer::new(128)),
        );
        let dir = est.estimate(&window).unwrap();
        assert!((dir.vector - source.normalize()).norm() < 1e-9);
        assert!(dir.elevation < 0.0);
        assert!(dir.azimuth < 0.0);
    }
}
