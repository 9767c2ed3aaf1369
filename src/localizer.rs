use crate::error::LocatorError;
use crate::Position;

use nalgebra::Matrix3;

/// Cross products shorter than this mean the rays are treated as parallel.
pub const DEFAULT_PARALLEL_EPSILON: f64 = 1e-9;

/// Where two rays pass closest to each other.
#[derive(Debug, Clone, PartialEq)]
pub struct Triangulation {
    /// Midpoint between the two closest points, the location estimate
    pub point: Position,
    /// Closest point on the first ray
    pub q1: Position,
    /// Closest point on the second ray
    pub q2: Position,
    /// Distance from the first origin to `q1`, along its direction. Negative
    /// means the closest approach lies behind the first station.
    pub t1: f64,
    /// Same as `t1`, for the second ray
    pub t2: f64,
    /// Gap `|q1 - q2|` between the rays, zero when they really intersect
    pub residual: f64,
}

impl Triangulation {
    /// True when the closest approach is in front of both stations.
    pub fn in_front(&self) -> bool {
        self.t1 >= 0.0 && self.t2 >= 0.0
    }
}

/// Triangulates two rays using a configurable parallelism threshold.
#[derive(Debug, Clone, Copy)]
pub struct Triangulator {
    epsilon: f64,
}

impl Default for Triangulator {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_PARALLEL_EPSILON,
        }
    }
}

impl Triangulator {
    /// Instantiates a triangulator that rejects ray pairs whose unit
    /// directions have a cross product shorter than `epsilon`.
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    /** locate()
     * @brief   Closest point of approach between the rays `p1 + t1 u1` and
     *          `p2 + t2 u2`
     * @param   p1, p2 ray origins; u1, u2 ray directions, normalized here
     * @returns The midpoint of the shortest segment joining the rays, along
     *          with its end points and length
     *
     * The common perpendicular `u3 = normalize(u2 x u1)` closes the loop
     * `p1 + t1 u1 + t3 u3 = p2 + t2 u2`, a 3x3 linear system in
     * `(t1, t2, t3)`. `|t3|` is the gap between the rays.
     */
    pub fn locate(
        &self,
        p1: &Position,
        u1: &Position,
        p2: &Position,
        u2: &Position,
    ) -> Result<Triangulation, LocatorError> {
        let (n1, n2) = (u1.norm(), u2.norm());
        if n1 == 0.0 || n2 == 0.0 || !n1.is_finite() || !n2.is_finite() {
            return Err(LocatorError::DegenerateGeometry);
        }
        let u1 = u1 / n1;
        let u2 = u2 / n2;

        let v3 = u2.cross(&u1);
        if v3.norm() < self.epsilon {
            return Err(LocatorError::ParallelRays);
        }
        let u3 = v3.normalize();

        let a = Matrix3::from_columns(&[u1, -u2, u3]);
        let b = p2 - p1;
        let t = a.lu().solve(&b).ok_or(LocatorError::ParallelRays)?;

        let q1 = p1 + t[0] * u1;
        let q2 = p2 + t[1] * u2;

        Ok(Triangulation {
            point: (q1 + q2) / 2.0,
            q1,
            q2,
            t1: t[0],
            t2: t[1],
            residual: (q1 - q2).norm(),
        })
    }
}

/// [`Triangulator::locate()`] with the default parallelism threshold.
pub fn locate(
    p1: &Position,
    u1: &Position,
    p2: &Position,
    u2: &Position,
) -> Result<Triangulation, LocatorError> {
    Triangulator::default().locate(p1, u1, p2, u2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &Position, b: &Position) -> bool {
        (a - b).norm() < 1e-9
    }

    #[test]
    fn two_stations_looking_down_and_in() {
        // Both stations see a source straight between them, half a meter
        // down and one meter out
        let p1 = Position::new(-0.5, 0.0, 0.0);
        let u1 = Position::new(0.5, -0.5, 1.0).normalize();
        let p2 = Position::new(0.5, 0.0, 0.0);
        let u2 = Position::new(-0.5, -0.5, 1.0).normalize();

        let res = locate(&p1, &u1, &p2, &u2).unwrap();
        assert!(close(&res.point, &Position::new(0.0, -0.5, 1.0)));
        assert!(res.residual < 1e-9);
        assert!((res.t1 - 1.5f64.sqrt()).abs() < 1e-9);
        assert!((res.t2 - 1.5f64.sqrt()).abs() < 1e-9);
        assert!(res.in_front());
    }

    #[test]
    fn intersecting_rays_meet_exactly() {
        let target = Position::new(3.0, -2.0, 7.5);
        let p1 = Position::new(0.0, 0.0, 0.0);
        let p2 = Position::new(10.0, 1.0, -2.0);

        let res = locate(&p1, &(target - p1), &p2, &(target - p2)).unwrap();
        assert!(close(&res.point, &target));
        assert!(res.residual < 1e-9);
    }

    #[test]
    fn swapping_rays_gives_same_point() {
        let p1 = Position::new(-1.0, 0.2, 0.0);
        let u1 = Position::new(0.3, 0.1, 1.0);
        let p2 = Position::new(1.5, -0.4, 0.3);
        let u2 = Position::new(-0.6, 0.2, 0.9);

        let a = locate(&p1, &u1, &p2, &u2).unwrap();
        let b = locate(&p2, &u2, &p1, &u1).unwrap();
        assert!(close(&a.point, &b.point));
        assert!((a.residual - b.residual).abs() < 1e-9);
        assert!(close(&a.q1, &b.q2));
    }

    #[test]
    fn skew_rays_report_their_gap() {
        // x axis, and a line parallel to y lifted one unit in z
        let p1 = Position::new(0.0, 0.0, 0.0);
        let u1 = Position::new(1.0, 0.0, 0.0);
        let p2 = Position::new(2.0, -3.0, 1.0);
        let u2 = Position::new(0.0, 1.0, 0.0);

        let res = locate(&p1, &u1, &p2, &u2).unwrap();
        assert!(close(&res.q1, &Position::new(2.0, 0.0, 0.0)));
        assert!(close(&res.q2, &Position::new(2.0, 0.0, 1.0)));
        assert!(close(&res.point, &Position::new(2.0, 0.0, 0.5)));
        assert!((res.residual - 1.0).abs() < 1e-9);
    }

    #[test]
    fn parallel_rays_are_refused() {
        let p1 = Position::new(0.0, 0.0, 0.0);
        let p2 = Position::new(1.0, 0.0, 0.0);
        let u = Position::new(0.0, 0.0, 1.0);
        assert!(matches!(
            locate(&p1, &u, &p2, &u),
            Err(LocatorError::ParallelRays)
        ));
        assert!(matches!(
            locate(&p1, &u, &p2, &(-u)),
            Err(LocatorError::ParallelRays)
        ));
    }

    #[test]
    fn epsilon_is_configurable() {
        let p1 = Position::new(0.0, 0.0, 0.0);
        let p2 = Position::new(1.0, 0.0, 0.0);
        let u1 = Position::new(0.0, 0.0, 1.0);
        let u2 = Position::new(-0.001, 0.0, 1.0);

        assert!(locate(&p1, &u1, &p2, &u2).is_ok());
        assert!(matches!(
            Triangulator::new(0.01).locate(&p1, &u1, &p2, &u2),
            Err(LocatorError::ParallelRays)
        ));
    }

    #[test]
    fn source_behind_a_station() {
        let p1 = Position::new(0.0, 0.0, 0.0);
        let u1 = Position::new(0.0, 0.0, 1.0);
        let p2 = Position::new(1.0, 0.0, 1.0);
        let u2 = Position::new(1.0, 0.0, 1.0);

        let res = locate(&p1, &u1, &p2, &u2).unwrap();
        assert!(close(&res.point, &Position::new(0.0, 0.0, 0.0)));
        assert!(!res.in_front());
    }

    #[test]
    fn zero_direction_is_degenerate() {
        let p = Position::new(0.0, 0.0, 0.0);
        let zero = Position::zeros();
        let u = Position::new(0.0, 0.0, 1.0);
        assert!(matches!(
            locate(&p, &zero, &p, &u),
            Err(LocatorError::DegenerateGeometry)
        ));
    }
}
