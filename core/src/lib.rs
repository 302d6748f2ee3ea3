//! Monte Carlo Localization toolbox for a mobile robot on a known occupancy grid
//!
//! This crate estimates the trajectory of a planar robot from logged wheel odometry and a 180° laser
//! range finder using Monte Carlo Localization (MCL), a sequential-importance-resampling particle
//! filter. The map is known, fixed, and given as an occupancy grid whose cells hold the probability
//! that the robot can occupy them. The crate is designed to replay recorded logs deterministically:
//! a single seeded random source drives every stochastic decision of a run so that two runs with the
//! same seed, map, and log produce identical traces.
//!
//! This crate is primarily built off of these dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): planar vector math for poses and laser geometry.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): the
//!   seeded random source and the Gaussian draws used by the motion model, perturbation and resampling.
//! - [`rayon`](https://crates.io/crates/rayon): parallel precomputation of expected laser ranges.
//!
//! ## Crate overview
//!
//! - [grid]: the occupancy grid and the pose validity predicate.
//! - [raycast]: the expected range cache built by ray casting over the grid, and its on-disk format.
//! - [odometry]: motion models mapping a particle pose and an odometry control to a new pose.
//! - [measurements]: laser sensor models and the beam alignment between readings and cached ranges.
//! - [particle]: the particle type, exp-normalization and multinomial resampling.
//! - [filter]: the MCL engine that owns the particle population.
//! - [messages]: logged observations and the robot log parser.
//! - [sim]: configuration, run harness, trace output and path error metrics.
//!
//! ## Filter recursion
//!
//! Each logged observation carries the robot's odometry pose $\bar{x}_t$. The control applied to every
//! particle is the difference between consecutive logged poses
//!
//! $$
//! u_t = \bar{x}_t - \bar{x}_{t-1}
//! $$
//!
//! and each particle $x^{[i]}$ is propagated through a motion model $x^{[i]}_t \sim p(x_t | x^{[i]}_{t-1}, u_t)$.
//! When the observation carries laser readings $z_t$, the particle log weight is updated multiplicatively
//! in log space with a likelihood temperature $\alpha$:
//!
//! $$
//! \ell^{[i]}_t = \ell^{[i]}_{t-1} + \alpha \sum_k \log p(z_{t,k} | x^{[i]}_t, m)
//! $$
//!
//! where the expected range for beam $k$ comes from the precomputed ray casting cache. Weights are
//! normalized with the exp-normalize trick
//!
//! $$
//! w^{[i]} = \frac{\exp(\ell^{[i]} - b)}{\sum_j \exp(\ell^{[j]} - b)}, \quad b = \max_j \ell^{[j]}
//! $$
//!
//! before multinomial resampling, after which every surviving log weight is reset to zero.
//!
//! ## Units
//!
//! Poses are expressed in the native length unit of the map and log (centimetres for the Wean Hall
//! dataset) and radians. One grid cell spans [`DEFAULT_CELL_SIZE`] length units unless configured
//! otherwise. Headings are unconstrained and only ever compared modulo $2\pi$.

pub mod error;
pub mod filter;
pub mod grid;
pub mod measurements;
pub mod messages;
pub mod odometry;
pub mod particle;
pub mod raycast;
pub mod sim;

pub use error::{MclError, Result};
pub use filter::{FilterConfig, MonteCarloLocalization, StepOutcome, TracePoint};
pub use grid::OccupancyGrid;
pub use measurements::{BeamAlignment, GaussianSensor, MixtureSensor, SensorModel};
pub use messages::Observation;
pub use odometry::{MotionModel, NaiveOdometry, SampledOdometry};
pub use particle::Particle;
pub use raycast::{ExpectedRangeCache, RayCastConfig};

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Length units spanned by one grid cell in the reference data.
pub const DEFAULT_CELL_SIZE: f64 = 10.0;

/// Planar robot pose in map length units and radians.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}
impl Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pose(x: {:.4}, y: {:.4}, theta: {:.4})",
            self.x, self.y, self.theta
        )
    }
}
impl From<[f64; 3]> for Pose {
    fn from(values: [f64; 3]) -> Self {
        Pose::new(values[0], values[1], values[2])
    }
}
impl Pose {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Pose { x, y, theta }
    }
    /// Position component as a vector.
    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }
    /// Unit vector along the heading.
    pub fn heading(&self) -> Vector2<f64> {
        Vector2::new(self.theta.cos(), self.theta.sin())
    }
    /// Pose translated `distance` units forward along its own heading.
    pub fn forward(&self, distance: f64) -> Pose {
        let position = self.position() + self.heading() * distance;
        Pose::new(position.x, position.y, self.theta)
    }
    /// Odometry control leading from `previous` to `self`.
    pub fn delta_from(&self, previous: &Pose) -> Control {
        Control {
            dx: self.x - previous.x,
            dy: self.y - previous.y,
            dtheta: self.theta - previous.theta,
        }
    }
}

/// Difference between two consecutive logged odometry poses.
///
/// The control is derived once per time step from the log and applied to every particle; it is not
/// recomputed from a particle's own pose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub dx: f64,
    pub dy: f64,
    pub dtheta: f64,
}
impl Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Control(dx: {:.4}, dy: {:.4}, dtheta: {:.4})",
            self.dx, self.dy, self.dtheta
        )
    }
}
impl Control {
    pub fn new(dx: f64, dy: f64, dtheta: f64) -> Self {
        Control { dx, dy, dtheta }
    }
    /// Planar distance travelled.
    pub fn translation(&self) -> f64 {
        Vector2::new(self.dx, self.dy).norm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    #[test]
    fn forward_moves_along_heading() {
        let pose = Pose::new(100.0, 200.0, PI / 2.0);
        let laser = pose.forward(25.0);
        assert_approx_eq!(laser.x, 100.0, 1e-9);
        assert_approx_eq!(laser.y, 225.0, 1e-9);
        assert_eq!(laser.theta, pose.theta);
    }

    #[test]
    fn delta_is_componentwise() {
        let previous = Pose::new(1.0, 2.0, 0.5);
        let current = Pose::new(4.0, 6.0, 0.25);
        let control = current.delta_from(&previous);
        assert_eq!(control, Control::new(3.0, 4.0, -0.25));
        assert_approx_eq!(control.translation(), 5.0, 1e-12);
    }

}
