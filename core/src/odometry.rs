//! Odometry motion models.
//!
//! A motion model propagates one particle through one time step. The control is derived once per step
//! from two consecutive logged odometry poses and is shared by every particle; each particle then
//! applies it relative to its own pose. Models are stateless, so a single boxed instance serves the
//! whole population, and every random draw comes from the caller's generator.
//!
//! Two models are provided:
//!
//! - [`NaiveOdometry`] adds the control componentwise to the particle pose. It has no noise and is
//!   mainly useful for replaying a log against a known starting pose.
//! - [`SampledOdometry`] decomposes the control into an initial rotation, a translation and a final
//!   rotation, perturbs each with zero mean Gaussian noise whose spread grows with the size of the
//!   motion, and applies the noisy decomposition in the particle's own frame.

use std::fmt::Debug;

use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::{Control, Pose};

/// Maps a particle pose and an odometry control to the particle's next pose.
pub trait MotionModel: Debug + Send + Sync {
    /// Propagate `pose` by `control`.
    ///
    /// `previous` is the logged odometry pose the control was measured from. Models that decompose the
    /// control into rotations need its heading; others ignore it.
    fn predict(&self, pose: &Pose, previous: &Pose, control: &Control, rng: &mut StdRng) -> Pose;
}

/// Deterministic componentwise addition of the control.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NaiveOdometry;

impl MotionModel for NaiveOdometry {
    fn predict(&self, pose: &Pose, _previous: &Pose, control: &Control, _rng: &mut StdRng) -> Pose {
        Pose::new(
            pose.x + control.dx,
            pose.y + control.dy,
            pose.theta + control.dtheta,
        )
    }
}

/// Rotation-translation-rotation decomposition of an odometry control.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OdometryDecomposition {
    pub rot1: f64,
    pub trans: f64,
    pub rot2: f64,
}
impl OdometryDecomposition {
    /// Decompose `control` measured from the logged pose `previous`.
    pub fn from_control(previous: &Pose, control: &Control) -> Self {
        let rot1 = control.dy.atan2(control.dx) - previous.theta;
        OdometryDecomposition {
            rot1,
            trans: control.translation(),
            rot2: control.dtheta - rot1,
        }
    }
    /// Apply the decomposition in the frame of `pose`.
    pub fn apply(&self, pose: &Pose) -> Pose {
        let heading = pose.theta + self.rot1;
        Pose::new(
            pose.x + self.trans * heading.cos(),
            pose.y + self.trans * heading.sin(),
            heading + self.rot2,
        )
    }
}

/// Probabilistic odometry model with four noise coefficients.
///
/// `noise[0]` scales rotation noise with the rotation itself, `noise[1]` scales rotation noise with
/// the translation, `noise[2]` scales translation noise with the translation and `noise[3]` scales
/// translation noise with the rotations.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampledOdometry {
    pub noise: [f64; 4],
}
impl Default for SampledOdometry {
    fn default() -> Self {
        SampledOdometry { noise: [0.001; 4] }
    }
}
impl SampledOdometry {
    pub fn new(noise: [f64; 4]) -> Self {
        SampledOdometry { noise }
    }

    /// Perturb a decomposition with one standard normal draw per component, in the order rot1, rot2,
    /// trans.
    pub fn sample(&self, ideal: &OdometryDecomposition, rng: &mut StdRng) -> OdometryDecomposition {
        let [a1, a2, a3, a4] = self.noise;
        let OdometryDecomposition { rot1, trans, rot2 } = *ideal;
        let n_rot1: f64 = StandardNormal.sample(rng);
        let n_rot2: f64 = StandardNormal.sample(rng);
        let n_trans: f64 = StandardNormal.sample(rng);
        OdometryDecomposition {
            rot1: rot1 - n_rot1 * (a1 * rot1.abs() + a2 * trans.abs()),
            rot2: rot2 - n_rot2 * (a1 * rot2.abs() + a2 * trans.abs()),
            trans: trans - n_trans * (a3 * trans.abs() + a4 * (rot1.abs() + rot2.abs())),
        }
    }
}

impl MotionModel for SampledOdometry {
    fn predict(&self, pose: &Pose, previous: &Pose, control: &Control, rng: &mut StdRng) -> Pose {
        let ideal = OdometryDecomposition::from_control(previous, control);
        self.sample(&ideal, rng).apply(pose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;

    #[test]
    fn naive_adds_control_exactly() {
        let mut rng = StdRng::seed_from_u64(1);
        let origin = Pose::default();
        let moved = NaiveOdometry.predict(&origin, &origin, &Control::new(10.0, 5.0, 0.5), &mut rng);
        assert_eq!(moved, Pose::new(10.0, 5.0, 0.5));
    }

    #[test]
    fn naive_matches_logged_pose_regression() {
        let mut rng = StdRng::seed_from_u64(1);
        let pose = Pose::new(1145.9063027900747, 3704.1255051978055, 2.9024268161535804);
        let moved = NaiveOdometry.predict(&pose, &pose, &Control::new(10.0, 5.0, 0.5), &mut rng);
        assert_approx_eq!(moved.x, 1155.9063027900747, 1e-10);
        assert_approx_eq!(moved.y, 3709.1255051978055, 1e-10);
        assert_approx_eq!(moved.theta, 3.4024268161535804, 1e-10);
    }

    #[test]
    fn zero_noise_follows_decomposition() {
        let mut rng = StdRng::seed_from_u64(7);
        let model = SampledOdometry::new([0.0; 4]);
        let previous = Pose::new(0.0, 0.0, 0.3);
        let control = Control::new(3.0, 4.0, 0.2);
        let particle = Pose::new(100.0, 50.0, 1.0);
        let moved = model.predict(&particle, &previous, &control, &mut rng);

        let rot1 = 4.0_f64.atan2(3.0) - 0.3;
        let rot2 = 0.2 - rot1;
        assert_approx_eq!(moved.x, 100.0 + 5.0 * (1.0 + rot1).cos(), 1e-12);
        assert_approx_eq!(moved.y, 50.0 + 5.0 * (1.0 + rot1).sin(), 1e-12);
        assert_approx_eq!(moved.theta, 1.0 + rot1 + rot2, 1e-12);
    }

    #[test]
    fn zero_noise_reproduces_logged_motion_from_same_pose() {
        let mut rng = StdRng::seed_from_u64(7);
        let model = SampledOdometry::new([0.0; 4]);
        let previous = Pose::new(10.0, 20.0, 0.0);
        let control = Control::new(30.0, 40.0, 0.5);
        let moved = model.predict(&previous, &previous, &control, &mut rng);
        assert_approx_eq!(moved.x, 40.0, 1e-9);
        assert_approx_eq!(moved.y, 60.0, 1e-9);
        assert_approx_eq!(moved.theta, 0.5, 1e-12);
    }

    #[test]
    fn seeded_prediction_regression() {
        let model = SampledOdometry::new([0.05, 0.01, 0.05, 0.01]);
        let previous = Pose::new(0.0, 0.0, 0.1);
        let control = Control::new(12.0, -3.0, 0.05);
        let particle = Pose::new(400.0, 300.0, -2.0);
        let mut rng = StdRng::seed_from_u64(42);
        let expected = [
            Pose::new(391.3821307412445, 291.35743950151925, -1.9788542403909861),
            Pose::new(391.54622694268306, 290.7865971528468, -1.82296781259668),
        ];
        for pose in expected {
            let moved = model.predict(&particle, &previous, &control, &mut rng);
            assert_approx_eq!(moved.x, pose.x, 1e-9);
            assert_approx_eq!(moved.y, pose.y, 1e-9);
            assert_approx_eq!(moved.theta, pose.theta, 1e-9);
        }

        let mut other = StdRng::seed_from_u64(43);
        assert_ne!(
            model.predict(&particle, &previous, &control, &mut other),
            expected[0]
        );
    }

    #[test]
    fn noise_scales_with_motion() {
        let model = SampledOdometry::new([0.1, 0.1, 0.1, 0.1]);
        let previous = Pose::default();
        let mut rng = StdRng::seed_from_u64(3);
        // Zero motion has zero noise whatever the draws are.
        let still = model.predict(&previous, &previous, &Control::default(), &mut rng);
        assert_eq!(still.x, 0.0);
        assert_eq!(still.y, 0.0);
        assert_approx_eq!(still.theta, 0.0, 1e-15);
    }
}
