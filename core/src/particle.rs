//! Particles and the resampling primitives of the filter.
//!
//! A particle is one pose hypothesis with two weights:
//!
//! - `log_weight` is the authoritative accumulator. Sensor updates add the tempered log likelihood to
//!   it, and resampling resets it to zero for every particle that survives.
//! - `weight` is the normalized probability mass the particle was last drawn with. After a sensor update
//!   it is refreshed to `exp(log_weight)`; after resampling it keeps the normalized mass from the draw.
//!   It is used for ordering the population and for summary statistics, never as an accumulator.
//!
//! The module also provides the numerically stable exp-normalization, the multinomial draw used by
//! resampling, and the [`PoseSampler`] that places new or perturbed particles on free space.

use std::f64::consts::TAU;
use std::fmt::{self, Display};

use log::warn;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{MclError, Result};
use crate::grid::OccupancyGrid;
use crate::Pose;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Particle {
    pub pose: Pose,
    pub weight: f64,
    pub log_weight: f64,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.pose.x)
            .field("y", &self.pose.y)
            .field("theta", &self.pose.theta)
            .field("weight", &self.weight)
            .field("log_weight", &self.log_weight)
            .finish()
    }
}
impl Particle {
    /// Fresh particle with unit unnormalized weight.
    pub fn new(pose: Pose) -> Particle {
        Particle {
            pose,
            weight: 1.0,
            log_weight: 0.0,
        }
    }
    /// Add a tempered log likelihood and refresh `weight` from the accumulator.
    pub fn accumulate_log_weight(&mut self, log_likelihood: f64) {
        self.log_weight += log_likelihood;
        self.weight = self.log_weight.exp();
    }
}

/// Normalize log weights into probabilities with the exp-normalize trick.
///
/// The largest log weight is subtracted before exponentiating so that at least one term is exactly one
/// and nothing overflows. If no log weight is finite the result is uniform.
pub fn exp_normalize(log_weights: &[f64]) -> Vec<f64> {
    if log_weights.is_empty() {
        return Vec::new();
    }
    let max = log_weights
        .iter()
        .copied()
        .filter(|w| !w.is_nan())
        .fold(f64::NEG_INFINITY, f64::max);
    let uniform = || vec![1.0 / log_weights.len() as f64; log_weights.len()];
    if !max.is_finite() {
        return uniform();
    }
    let shifted: Vec<f64> = log_weights
        .iter()
        .map(|w| if w.is_nan() { 0.0 } else { (w - max).exp() })
        .collect();
    let total: f64 = shifted.iter().sum();
    if !(total > 0.0 && total.is_finite()) {
        return uniform();
    }
    shifted.into_iter().map(|w| w / total).collect()
}

/// Draw `draws` indices with probability proportional to `weights` and return how many times each
/// index was drawn.
///
/// Each draw takes a uniform number on `[0, sum)` and subtracts weights in index order until it goes
/// negative. A draw left over by rounding falls to the last index with positive weight.
pub fn sample_multinomial(weights: &[f64], draws: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut counts = vec![0usize; weights.len()];
    if weights.is_empty() {
        return counts;
    }
    let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    let Some(last_positive) = weights.iter().rposition(|w| *w > 0.0) else {
        for _ in 0..draws {
            counts[rng.random_range(0..weights.len())] += 1;
        }
        return counts;
    };
    for _ in 0..draws {
        let mut u = rng.random::<f64>() * total;
        let mut chosen = last_positive;
        for (index, weight) in weights.iter().enumerate() {
            if *weight <= 0.0 {
                continue;
            }
            u -= weight;
            if u < 0.0 {
                chosen = index;
                break;
            }
        }
        counts[chosen] += 1;
    }
    counts
}

fn default_sigma_theta() -> f64 {
    0.2
}
fn default_sigma_xy() -> f64 {
    2.0
}
fn default_max_retries() -> usize {
    1000
}

/// Gaussian jitter applied to cloned particles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerturbationConfig {
    /// Standard deviation of the heading jitter in radians.
    #[serde(default = "default_sigma_theta")]
    pub sigma_theta: f64,
    /// Standard deviation of the position jitter in map length units.
    #[serde(default = "default_sigma_xy")]
    pub sigma_xy: f64,
    /// Attempts to find a valid jittered pose before falling back to a global sample.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}
impl Default for PerturbationConfig {
    fn default() -> Self {
        PerturbationConfig {
            sigma_theta: default_sigma_theta(),
            sigma_xy: default_sigma_xy(),
            max_retries: default_max_retries(),
        }
    }
}
impl PerturbationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.sigma_theta >= 0.0) || !(self.sigma_xy >= 0.0) || self.max_retries == 0 {
            return Err(MclError::InvalidConfig(format!(
                "perturbation needs non-negative sigmas and at least one retry, got {self:?}"
            )));
        }
        Ok(())
    }
}

/// Places particles on valid poses of a grid.
#[derive(Clone, Debug)]
pub struct PoseSampler {
    threshold: f64,
    max_retries: usize,
    free_cells: Vec<(usize, usize)>,
}
impl PoseSampler {
    /// Fails with [`MclError::NoFreeSpace`] when no cell of `grid` is valid.
    pub fn new(grid: &OccupancyGrid, threshold: f64, max_retries: usize) -> Result<Self> {
        let free_cells = grid.free_cells(threshold);
        if free_cells.is_empty() {
            return Err(MclError::NoFreeSpace { threshold });
        }
        Ok(PoseSampler {
            threshold,
            max_retries: max_retries.max(1),
            free_cells,
        })
    }

    pub fn free_cell_count(&self) -> usize {
        self.free_cells.len()
    }

    /// Uniformly random valid pose.
    ///
    /// The heading is drawn once on `[-2pi, 2pi)`, then positions are drawn uniformly over the grid
    /// extent until one is valid. After `max_retries` rejections the position is drawn inside a
    /// uniformly chosen free cell instead.
    pub fn sample(&self, grid: &OccupancyGrid, rng: &mut StdRng) -> Pose {
        let theta = rng.random_range(-TAU..TAU);
        let (width, height) = grid.extent();
        for _ in 0..self.max_retries {
            let pose = Pose::new(
                rng.random_range(0.0..width),
                rng.random_range(0.0..height),
                theta,
            );
            if grid.is_valid_position(&pose, self.threshold) {
                return pose;
            }
        }
        let (cx, cy) = self.free_cells[rng.random_range(0..self.free_cells.len())];
        let cell_size = grid.cell_size();
        let pose = Pose::new(
            (cx as f64 + rng.random::<f64>()) * cell_size,
            (cy as f64 + rng.random::<f64>()) * cell_size,
            theta,
        );
        if grid.is_valid_position(&pose, self.threshold) {
            pose
        } else {
            Pose::new(
                (cx as f64 + 0.5) * cell_size,
                (cy as f64 + 0.5) * cell_size,
                theta,
            )
        }
    }

    /// Jitter `pose` until it lands on a valid pose.
    ///
    /// Every attempt starts again from `pose`. The heading jitter is applied first and the result taken
    /// modulo `2pi`, then `x` and `y` are jittered. If no attempt succeeds a global sample is returned.
    pub fn perturb(
        &self,
        pose: &Pose,
        grid: &OccupancyGrid,
        config: &PerturbationConfig,
        rng: &mut StdRng,
    ) -> Pose {
        for _ in 0..config.max_retries {
            let n_theta: f64 = StandardNormal.sample(rng);
            let n_x: f64 = StandardNormal.sample(rng);
            let n_y: f64 = StandardNormal.sample(rng);
            let candidate = Pose::new(
                pose.x + n_x * config.sigma_xy,
                pose.y + n_y * config.sigma_xy,
                (pose.theta + n_theta * config.sigma_theta) % TAU,
            );
            if grid.is_valid_position(&candidate, self.threshold) {
                return candidate;
            }
        }
        warn!(
            "No valid perturbation of {} after {} attempts, sampling a new pose",
            pose, config.max_retries
        );
        self.sample(grid, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;

    const LOG_WEIGHTS: [f64; 20] = [
        7.308781907032909,
        4.100808114922017,
        2.077148413097171,
        3.3271705595951118,
        9.677559094241207,
        0.061171822657613006,
        9.637047970232077,
        9.398653887819098,
        9.471949176631938,
        9.370821488959697,
        3.971743421847056,
        3.4751802920311023,
        2.9405703200403677,
        5.064836273262351,
        1.1596708803265776,
        7.705358800791777,
        6.5989270869342,
        1.5674689056984625,
        3.782020453210553,
        1.3976268290375116,
    ];
    const NORMALIZED: [f64; 20] = [
        0.0204725457902844,
        8.278783685463071E-4,
        1.0942140662975753E-4,
        3.8192669427083043E-4,
        0.2187352175501777,
        1.4573866418115912E-5,
        0.21005109739151173,
        0.16549760768195565,
        0.17808340864486413,
        0.16095492241145454,
        7.276364580279494E-4,
        4.4285323749212004E-4,
        2.5946672079620346E-4,
        0.002170894131955381,
        4.371664889425236E-5,
        0.030437081540474236,
        0.0100666697170796,
        6.572813291359538E-5,
        6.01892335116289E-4,
        5.546127113733753E-5,
    ];
    const DRAW_WEIGHTS: [f64; 20] = [
        0.07158838902401185,
        0.040166781603015504,
        0.02034534763095368,
        0.03258912133365722,
        0.09479019541884982,
        5.99168547293382E-4,
        0.09439339522118967,
        0.09205836203373328,
        0.09277627805803164,
        0.09178574798910005,
        0.038902612884528474,
        0.03403885378425501,
        0.028802431745972332,
        0.04960928839925213,
        0.011358797016607096,
        0.07547279839748405,
        0.06463547078699385,
        0.015353115639721937,
        0.0370443057331725,
        0.013689538752176501,
    ];

    fn open_grid() -> OccupancyGrid {
        let rows = (0..20)
            .map(|x| {
                (0..20)
                    .map(|y| if (5..15).contains(&x) && (5..15).contains(&y) { 1.0 } else { 0.0 })
                    .collect()
            })
            .collect();
        OccupancyGrid::from_rows(rows, 10.0).unwrap()
    }

    #[test]
    fn exp_normalize_matches_reference_values() {
        let normalized = exp_normalize(&LOG_WEIGHTS);
        for (actual, expected) in normalized.iter().zip(NORMALIZED) {
            assert_approx_eq!(*actual, expected, 1e-4);
        }
    }

    #[test]
    fn exp_normalize_is_a_shift_invariant_distribution() {
        let normalized = exp_normalize(&LOG_WEIGHTS);
        assert_approx_eq!(normalized.iter().sum::<f64>(), 1.0, 1e-12);
        assert!(normalized.iter().all(|w| (0.0..=1.0).contains(w)));
        for shift in [-5000.0, -3.0, 12.5, 800.0] {
            let shifted: Vec<f64> = LOG_WEIGHTS.iter().map(|w| w + shift).collect();
            for (a, b) in exp_normalize(&shifted).iter().zip(&normalized) {
                assert_approx_eq!(*a, *b, 1e-12);
            }
        }
    }

    #[test]
    fn exp_normalize_handles_degenerate_inputs() {
        assert!(exp_normalize(&[]).is_empty());
        assert_eq!(exp_normalize(&[f64::NEG_INFINITY; 4]), vec![0.25; 4]);
        assert_eq!(exp_normalize(&[-1e6, f64::NEG_INFINITY]), vec![1.0, 0.0]);
    }

    #[test]
    fn multinomial_counts_converge_to_weights() {
        let mut rng = StdRng::seed_from_u64(42);
        let trials = 10_000;
        let mut totals = [0usize; 20];
        for _ in 0..trials {
            let counts = sample_multinomial(&DRAW_WEIGHTS, DRAW_WEIGHTS.len(), &mut rng);
            assert_eq!(counts.iter().sum::<usize>(), DRAW_WEIGHTS.len());
            for (total, count) in totals.iter_mut().zip(counts) {
                *total += count;
            }
        }
        let draws = (trials * DRAW_WEIGHTS.len()) as f64;
        for (index, (total, weight)) in totals.iter().zip(DRAW_WEIGHTS).enumerate() {
            let expected = draws * weight;
            assert!(
                (*total as f64 - expected).abs() <= 500.0,
                "index {index}: drew {total}, expected about {expected}"
            );
        }
    }

    #[test]
    fn multinomial_never_draws_zero_weights() {
        let mut rng = StdRng::seed_from_u64(5);
        let counts = sample_multinomial(&[0.0, 0.7, 0.0, 0.3, 0.0], 1000, &mut rng);
        assert_eq!(counts[0] + counts[2] + counts[4], 0);
        assert_eq!(counts[1] + counts[3], 1000);
    }

    #[test]
    fn accumulate_refreshes_weight() {
        let mut particle = Particle::new(Pose::default());
        particle.accumulate_log_weight(-2.0);
        particle.accumulate_log_weight(-0.5);
        assert_approx_eq!(particle.log_weight, -2.5, 1e-15);
        assert_approx_eq!(particle.weight, (-2.5_f64).exp(), 1e-15);
    }

    #[test]
    fn sampled_poses_are_valid() {
        let grid = open_grid();
        let sampler = PoseSampler::new(&grid, 0.8, 1000).unwrap();
        assert_eq!(sampler.free_cell_count(), 100);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..500 {
            let pose = sampler.sample(&grid, &mut rng);
            assert!(grid.is_valid_position(&pose, 0.8));
            assert!((-TAU..TAU).contains(&pose.theta));
        }
    }

    #[test]
    fn single_retry_still_yields_valid_pose() {
        let mut rows = vec![vec![0.0; 50]; 50];
        rows[37][12] = 1.0;
        let grid = OccupancyGrid::from_rows(rows, 10.0).unwrap();
        let sampler = PoseSampler::new(&grid, 0.8, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..50 {
            let pose = sampler.sample(&grid, &mut rng);
            assert_eq!(grid.cell_of(&pose), (37, 12));
        }
    }

    #[test]
    fn grid_without_free_space_is_rejected() {
        let grid = OccupancyGrid::from_rows(vec![vec![0.5; 3]; 3], 10.0).unwrap();
        assert!(matches!(
            PoseSampler::new(&grid, 0.8, 10),
            Err(MclError::NoFreeSpace { .. })
        ));
    }

    #[test]
    fn perturbation_stays_close_and_valid() {
        let grid = open_grid();
        let sampler = PoseSampler::new(&grid, 0.8, 1000).unwrap();
        let config = PerturbationConfig::default();
        let mut rng = StdRng::seed_from_u64(8);
        let origin = Pose::new(100.0, 100.0, 1.0);
        for _ in 0..200 {
            let pose = sampler.perturb(&origin, &grid, &config, &mut rng);
            assert!(grid.is_valid_position(&pose, 0.8));
            assert!((pose.x - origin.x).abs() < 20.0);
            assert!((pose.y - origin.y).abs() < 20.0);
            assert!(pose.theta.abs() < TAU);
        }
    }

    #[test]
    fn exhausted_perturbation_falls_back_to_global_sample() {
        let grid = open_grid();
        let sampler = PoseSampler::new(&grid, 0.8, 1000).unwrap();
        let config = PerturbationConfig {
            sigma_xy: 1e7,
            max_retries: 3,
            ..PerturbationConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..20 {
            let pose = sampler.perturb(&Pose::new(100.0, 100.0, 0.0), &grid, &config, &mut rng);
            assert!(grid.is_valid_position(&pose, 0.8));
        }
    }
}
