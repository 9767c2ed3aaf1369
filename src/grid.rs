//! The steering grid: a rectangle of candidate source positions on a plane
//! at fixed depth `z` in front of the array, spaced `increment` apart.
//!
//! Cells are addressed as `(i, j)` with `i` along x and `j` along y. Level
//! maps computed over the grid are `nx x ny` arrays indexed the same way.

use crate::error::LocatorError;
use crate::Position;

/// A rectangular grid of focal points at depth `z`.
#[derive(Debug, Clone, PartialEq)]
pub struct SteeringGrid {
    x_min: f64,
    y_min: f64,
    z: f64,
    increment: f64,
    nx: usize,
    ny: usize,
}

fn steps(min: f64, max: f64, increment: f64) -> usize {
    ((max - min) / increment).round() as usize + 1
}

impl SteeringGrid {
    /// Builds the grid spanning `[x_min, x_max] x [y_min, y_max]` at depth
    /// `z`. The upper bounds are rounded to the nearest whole increment.
    pub fn new(
        x_min: f64,
        x_max: f64,
        y_min: f64,
        y_max: f64,
        z: f64,
        increment: f64,
    ) -> Result<Self, LocatorError> {
        let all_finite = [x_min, x_max, y_min, y_max, z, increment]
            .iter()
            .all(|v| v.is_finite());
        if !all_finite {
            return Err(LocatorError::Config("grid bounds must be finite".to_owned()));
        }
        if increment <= 0.0 {
            return Err(LocatorError::Config(format!(
                "grid increment must be positive, got {}",
                increment
            )));
        }
        if x_max < x_min || y_max < y_min {
            return Err(LocatorError::Config(format!(
                "empty grid x=[{}, {}] y=[{}, {}]",
                x_min, x_max, y_min, y_max
            )));
        }

        Ok(Self {
            x_min,
            y_min,
            z,
            increment,
            nx: steps(x_min, x_max, increment),
            ny: steps(y_min, y_max, increment),
        })
    }

    /// A square grid reaching `half_width` to either side of the boresight.
    pub fn square(half_width: f64, z: f64, increment: f64) -> Result<Self, LocatorError> {
        Self::new(-half_width, half_width, -half_width, half_width, z, increment)
    }

    /// `(nx, ny)`, the number of cells along x and along y
    pub fn shape(&self) -> (usize, usize) {
        (self.nx, self.ny)
    }

    /// Total number of cells
    pub fn len(&self) -> usize {
        self.nx * self.ny
    }

    /// Never true; a grid always has at least one cell
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Depth of the grid plane
    pub fn z(&self) -> f64 {
        self.z
    }

    /// Spacing between neighbouring cells
    pub fn increment(&self) -> f64 {
        self.increment
    }

    /// `[x_min, x_max, y_min, y_max]` of the cell centres
    pub fn extent(&self) -> [f64; 4] {
        [
            self.x_min,
            self.x_min + self.increment * (self.nx - 1) as f64,
            self.y_min,
            self.y_min + self.increment * (self.ny - 1) as f64,
        ]
    }

    /// Position of cell `(i, j)` in the station frame.
    pub fn point(&self, i: usize, j: usize) -> Position {
        Position::new(
            self.x_min + self.increment * i as f64,
            self.y_min + self.increment * j as f64,
            self.z,
        )
    }

    /// Every cell with its position, x index varying slowest.
    pub fn points(&self) -> impl Iterator<Item = ((usize, usize), Position)> + '_ {
        (0..self.nx).flat_map(move |i| (0..self.ny).map(move |j| ((i, j), self.point(i, j))))
    }
}
