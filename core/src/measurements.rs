//! Laser sensor models and beam alignment.
//!
//! A sensor model scores how well the ranges a particle *would* observe (looked up in the
//! [`ExpectedRangeCache`]) explain the ranges the laser actually reported. Beams are treated as
//! independent, so the likelihood of a scan is the product of per-beam likelihoods and the filter works
//! with its logarithm:
//!
//! $$
//! \log p(z | x, m) = \sum_k \log p(z_k | z^*_k)
//! $$
//!
//! [`BeamAlignment`] is responsible for pairing each reading of a scan with the cached expected range
//! of the matching heading bin. The models themselves only see the two aligned arrays.

use std::f64::consts::{FRAC_PI_2, PI};
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::error::{MclError, Result};
use crate::grid::OccupancyGrid;
use crate::messages::LASER_READINGS;
use crate::raycast::{theta_to_bin, ExpectedRangeCache};
use crate::Pose;

/// Default maximum range of the laser in map length units.
pub const DEFAULT_SENSOR_MAX_RANGE: f64 = 2000.0;

/// Per-beam likelihood of actual ranges given expected ranges.
pub trait SensorModel: Debug + Send + Sync {
    /// Likelihood of each actual range given the expected range at the same index.
    fn likelihood(&self, expected: &[f64], actual: &[f64]) -> Vec<f64>;

    /// Sum of the per-beam log likelihoods.
    fn sum_of_log_likelihood(&self, expected: &[f64], actual: &[f64]) -> f64 {
        self.likelihood(expected, actual)
            .iter()
            .map(|p| p.max(f64::MIN_POSITIVE).ln())
            .sum()
    }

    /// Largest range the sensor reports. Expected ranges are clipped to it before scoring.
    fn max_range(&self) -> f64;
}

fn default_gaussian_sigma() -> f64 {
    50.0
}
fn default_gaussian_weight() -> f64 {
    1.0
}
fn default_max_range() -> f64 {
    DEFAULT_SENSOR_MAX_RANGE
}

/// Weighted Gaussian centred on the expected range.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaussianSensor {
    #[serde(default = "default_gaussian_sigma")]
    pub sigma: f64,
    #[serde(default = "default_gaussian_weight")]
    pub weight: f64,
    #[serde(default = "default_max_range")]
    pub max_range: f64,
}
impl Default for GaussianSensor {
    fn default() -> Self {
        GaussianSensor {
            sigma: default_gaussian_sigma(),
            weight: default_gaussian_weight(),
            max_range: default_max_range(),
        }
    }
}
impl GaussianSensor {
    pub fn validate(&self) -> Result<()> {
        if !(self.sigma > 0.0) || !(self.weight > 0.0) || !(self.max_range > 0.0) {
            return Err(MclError::InvalidConfig(format!(
                "gaussian sensor needs positive sigma, weight and max_range, got {self:?}"
            )));
        }
        Ok(())
    }
    fn log_density(&self, expected: f64, actual: f64) -> f64 {
        let diff = actual - expected;
        (self.weight / (self.sigma * (2.0 * PI).sqrt())).ln() - diff * diff / (2.0 * self.sigma * self.sigma)
    }
}
impl SensorModel for GaussianSensor {
    fn likelihood(&self, expected: &[f64], actual: &[f64]) -> Vec<f64> {
        expected
            .iter()
            .zip(actual)
            .map(|(e, a)| self.log_density(*e, *a).exp())
            .collect()
    }
    /// Evaluated in log space so far-off beams do not underflow to zero.
    fn sum_of_log_likelihood(&self, expected: &[f64], actual: &[f64]) -> f64 {
        expected
            .iter()
            .zip(actual)
            .map(|(e, a)| self.log_density(*e, *a))
            .sum()
    }
    fn max_range(&self) -> f64 {
        self.max_range
    }
}

fn default_hit_sigma() -> f64 {
    67.0
}
fn default_hit_weight() -> f64 {
    0.64
}
fn default_short_sigma() -> f64 {
    25.0
}
fn default_short_weight() -> f64 {
    0.35
}
fn default_rand_weight() -> f64 {
    0.01
}

/// Mixture of a Gaussian hit component, a triangular component peaked at the maximum range, and a
/// uniform component over `[0, max_range]`.
///
/// The triangular density is
///
/// $$
/// \mathrm{Tri}(d; \sigma) = \max\left(0, \frac{1}{\sqrt{6}\sigma} - \frac{|d|}{6\sigma^2}\right), \quad d = z - z_{max}
/// $$
///
/// and absorbs the max-range readings the laser returns when nothing reflects the beam.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MixtureSensor {
    #[serde(default = "default_hit_sigma")]
    pub hit_sigma: f64,
    #[serde(default = "default_hit_weight")]
    pub hit_weight: f64,
    #[serde(default = "default_short_sigma")]
    pub short_sigma: f64,
    #[serde(default = "default_short_weight")]
    pub short_weight: f64,
    #[serde(default = "default_rand_weight")]
    pub rand_weight: f64,
    #[serde(default = "default_max_range")]
    pub max_range: f64,
}
impl Default for MixtureSensor {
    fn default() -> Self {
        MixtureSensor {
            hit_sigma: default_hit_sigma(),
            hit_weight: default_hit_weight(),
            short_sigma: default_short_sigma(),
            short_weight: default_short_weight(),
            rand_weight: default_rand_weight(),
            max_range: default_max_range(),
        }
    }
}
impl MixtureSensor {
    /// Component weights must be non-negative and sum to at most one.
    pub fn validate(&self) -> Result<()> {
        let weights = [self.hit_weight, self.short_weight, self.rand_weight];
        if weights.iter().any(|w| !(*w >= 0.0)) {
            return Err(MclError::InvalidConfig(format!(
                "mixture weights must be non-negative, got {weights:?}"
            )));
        }
        let total: f64 = weights.iter().sum();
        if total > 1.0 + 1e-9 {
            return Err(MclError::InvalidConfig(format!(
                "mixture weights sum to {total}, which exceeds 1"
            )));
        }
        if !(self.hit_sigma > 0.0) || !(self.short_sigma > 0.0) || !(self.max_range > 0.0) {
            return Err(MclError::InvalidConfig(format!(
                "mixture sigmas and max_range must be positive, got {self:?}"
            )));
        }
        Ok(())
    }

    fn density(&self, expected: f64, actual: f64) -> f64 {
        let diff = actual - expected;
        let hit = (-diff * diff / (2.0 * self.hit_sigma.powi(2))).exp()
            / (self.hit_sigma * (2.0 * PI).sqrt());
        let d = (actual - self.max_range).abs();
        let short = (1.0 / (6.0_f64.sqrt() * self.short_sigma) - d / (6.0 * self.short_sigma.powi(2)))
            .max(0.0);
        let rand = if (0.0..=self.max_range).contains(&actual) {
            1.0 / self.max_range
        } else {
            0.0
        };
        self.hit_weight * hit + self.short_weight * short + self.rand_weight * rand
    }
}
impl SensorModel for MixtureSensor {
    fn likelihood(&self, expected: &[f64], actual: &[f64]) -> Vec<f64> {
        expected
            .iter()
            .zip(actual)
            .map(|(e, a)| self.density(*e, *a))
            .collect()
    }
    fn max_range(&self) -> f64 {
        self.max_range
    }
}

/// Pairs laser readings with cached expected ranges for a particle pose.
///
/// The laser sits `laser_offset` units ahead of the robot centre. Its 180 readings sweep
/// counter-clockwise from 90° right of the heading to 90° left of it, while the cache resolves the full
/// circle into `bins` headings; half of the bins therefore cover the sweep and every
/// `readings / (bins / 2)`-th reading is compared with one bin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BeamAlignment {
    laser_offset: f64,
    bins: usize,
    stride: usize,
}
impl BeamAlignment {
    pub fn new(laser_offset: f64, bins: usize) -> Result<Self> {
        if bins < 2 || bins % 2 != 0 || bins / 2 > LASER_READINGS {
            return Err(MclError::InvalidConfig(format!(
                "cannot align {LASER_READINGS} readings with {bins} heading bins"
            )));
        }
        Ok(BeamAlignment {
            laser_offset,
            bins,
            stride: LASER_READINGS / (bins / 2),
        })
    }

    /// Number of beams compared per scan.
    pub fn beams(&self) -> usize {
        self.bins / 2
    }

    pub fn laser_offset(&self) -> f64 {
        self.laser_offset
    }

    /// Grid cell of the laser for a robot at `pose`, clamped into the grid.
    pub fn laser_cell(&self, pose: &Pose, grid: &OccupancyGrid) -> (usize, usize) {
        let (x, y) = grid.cell_of(&pose.forward(self.laser_offset));
        (
            x.clamp(0, grid.width() as i64 - 1) as usize,
            y.clamp(0, grid.height() as i64 - 1) as usize,
        )
    }

    /// Fill `expected` and `actual` with the aligned ranges for a robot at `pose`.
    ///
    /// Both buffers are cleared first. Expected ranges are clipped to `max_range`.
    #[allow(clippy::too_many_arguments)]
    pub fn align(
        &self,
        pose: &Pose,
        readings: &[f64],
        grid: &OccupancyGrid,
        cache: &ExpectedRangeCache,
        max_range: f64,
        expected: &mut Vec<f64>,
        actual: &mut Vec<f64>,
    ) {
        expected.clear();
        actual.clear();
        let (x, y) = self.laser_cell(pose, grid);
        let start = theta_to_bin(pose.theta - FRAC_PI_2, self.bins);
        for i in 0..self.beams() {
            let Some(reading) = readings.get(i * self.stride) else {
                break;
            };
            let bin = (start + i) % self.bins;
            expected.push(cache.lookup(x, y, bin).min(max_range));
            actual.push(*reading);
        }
    }
}
