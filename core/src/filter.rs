//! Monte Carlo Localization engine.
//!
//! [`MonteCarloLocalization`] owns the particle population and advances it one logged observation at a
//! time:
//!
//! 1. **Predict**: every particle is moved by the motion model using the control between the current
//!    and the previous logged odometry pose. Particles that land on an invalid pose are dropped.
//! 2. **Weight**: on laser observations each particle's log weight grows by the tempered log likelihood
//!    of the scan.
//! 3. **Resample**: on every `resample_period`-th step that carries a laser scan, the log weights are
//!    exp-normalized and the population is redrawn multinomially. Duplicates beyond the second copy of a
//!    particle are only kept while the new population is below the floor. Survivors restart with a log
//!    weight of zero.
//! 4. **Repair**: an empty population is replaced by a fresh one; a population below the floor is
//!    topped up with perturbed clones of randomly chosen particles.
//! 5. **Emit**: the population is sorted by weight and its heaviest particle is the point estimate,
//!    recorded in the trace.
//!
//! All randomness comes from a single generator seeded from [`FilterConfig::seed`], so two filters
//! built from the same inputs produce identical traces.

use std::fmt::{self, Debug};
use std::sync::Arc;

use log::{debug, info, warn};
use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{MclError, Result};
use crate::grid::{OccupancyGrid, DEFAULT_VALID_THRESHOLD};
use crate::measurements::{BeamAlignment, SensorModel};
use crate::messages::{Observation, LASER_READINGS};
use crate::odometry::MotionModel;
use crate::particle::{exp_normalize, sample_multinomial, Particle, PerturbationConfig, PoseSampler};
use crate::raycast::ExpectedRangeCache;
use crate::{Control, Pose};

fn default_num_particles() -> usize {
    5000
}
fn default_min_particles() -> usize {
    300
}
fn default_resample_period() -> usize {
    10
}
fn default_likelihood_scale() -> f64 {
    0.90
}
fn default_valid_threshold() -> f64 {
    DEFAULT_VALID_THRESHOLD
}
fn default_laser_offset() -> f64 {
    25.0
}
fn default_max_pose_retries() -> usize {
    1000
}
fn default_shuffle() -> bool {
    true
}
fn default_seed() -> u64 {
    42
}

/// Tuning of the filter recursion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Size of the initial population, and of every population rebuilt from scratch.
    #[serde(default = "default_num_particles")]
    pub num_particles: usize,
    /// Population floor maintained by resampling and repair.
    #[serde(default = "default_min_particles")]
    pub min_particles: usize,
    /// Resample on laser steps whose one-based index is a multiple of this period.
    #[serde(default = "default_resample_period")]
    pub resample_period: usize,
    /// Temperature applied to the scan log likelihood before it is accumulated.
    #[serde(default = "default_likelihood_scale")]
    pub likelihood_scale: f64,
    /// Occupancy a pose's cell must exceed for the pose to be valid.
    #[serde(default = "default_valid_threshold")]
    pub valid_threshold: f64,
    /// Distance from the robot centre to the laser along the heading.
    #[serde(default = "default_laser_offset")]
    pub laser_offset: f64,
    #[serde(default)]
    pub perturbation: PerturbationConfig,
    /// Uniform draws over the grid before initial sampling falls back to picking a free cell.
    #[serde(default = "default_max_pose_retries")]
    pub max_pose_retries: usize,
    /// Shuffle the population at the start of every step after the first.
    #[serde(default = "default_shuffle")]
    pub shuffle_between_steps: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
}
impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            num_particles: default_num_particles(),
            min_particles: default_min_particles(),
            resample_period: default_resample_period(),
            likelihood_scale: default_likelihood_scale(),
            valid_threshold: default_valid_threshold(),
            laser_offset: default_laser_offset(),
            perturbation: PerturbationConfig::default(),
            max_pose_retries: default_max_pose_retries(),
            shuffle_between_steps: default_shuffle(),
            seed: default_seed(),
        }
    }
}
impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            return Err(MclError::InvalidConfig(
                "num_particles must be at least one".to_string(),
            ));
        }
        if self.resample_period == 0 {
            return Err(MclError::InvalidConfig(
                "resample_period must be at least one".to_string(),
            ));
        }
        if !(self.likelihood_scale > 0.0 && self.likelihood_scale.is_finite()) {
            return Err(MclError::InvalidConfig(format!(
                "likelihood_scale must be positive, got {}",
                self.likelihood_scale
            )));
        }
        if !(0.0..1.0).contains(&self.valid_threshold) {
            return Err(MclError::InvalidConfig(format!(
                "valid_threshold must lie in [0, 1), got {}",
                self.valid_threshold
            )));
        }
        self.perturbation.validate()
    }
}

/// Point estimate recorded for one step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TracePoint {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}
impl TracePoint {
    pub fn pose(&self) -> Pose {
        Pose::new(self.x, self.y, self.theta)
    }
}

/// Result of one filter step.
#[derive(Clone, Copy, Debug)]
pub struct StepOutcome<'a> {
    /// Population sorted ascending by weight.
    pub particles: &'a [Particle],
    /// Pose of the heaviest particle.
    pub estimate: Pose,
    /// Whether this step resampled the population.
    pub resampled: bool,
}

pub struct MonteCarloLocalization {
    grid: Arc<OccupancyGrid>,
    cache: Arc<ExpectedRangeCache>,
    motion: Box<dyn MotionModel>,
    sensor: Box<dyn SensorModel>,
    config: FilterConfig,
    alignment: BeamAlignment,
    sampler: PoseSampler,
    particles: Vec<Particle>,
    previous_pose: Option<Pose>,
    step_index: usize,
    trace: Vec<TracePoint>,
    rng: StdRng,
    expected: Vec<f64>,
    actual: Vec<f64>,
}
impl Debug for MonteCarloLocalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonteCarloLocalization")
            .field("grid", &self.grid)
            .field("motion", &self.motion)
            .field("sensor", &self.sensor)
            .field("particles", &self.particles.len())
            .field("step_index", &self.step_index)
            .field("trace", &self.trace.len())
            .finish()
    }
}

impl MonteCarloLocalization {
    /// Build a filter and sample its initial population.
    ///
    /// Fails when the configuration is invalid, when the cache does not cover the grid, or when the
    /// grid has no valid cell to place particles on.
    pub fn new(
        grid: Arc<OccupancyGrid>,
        cache: Arc<ExpectedRangeCache>,
        motion: Box<dyn MotionModel>,
        sensor: Box<dyn SensorModel>,
        config: FilterConfig,
    ) -> Result<Self> {
        config.validate()?;
        if cache.width() != grid.width() || cache.height() != grid.height() {
            return Err(MclError::CacheUnavailable {
                reason: format!(
                    "cache covers {}x{} cells but the grid has {}x{}",
                    cache.width(),
                    cache.height(),
                    grid.width(),
                    grid.height()
                ),
            });
        }
        let alignment = BeamAlignment::new(config.laser_offset, cache.bins())?;
        let sampler = PoseSampler::new(&grid, config.valid_threshold, config.max_pose_retries)?;
        let mut filter = MonteCarloLocalization {
            rng: StdRng::seed_from_u64(config.seed),
            expected: Vec::with_capacity(alignment.beams()),
            actual: Vec::with_capacity(alignment.beams()),
            grid,
            cache,
            motion,
            sensor,
            alignment,
            sampler,
            particles: Vec::new(),
            previous_pose: None,
            step_index: 0,
            trace: Vec::new(),
            config,
        };
        filter.particles = filter.create_particles();
        info!(
            "Initialized MCL with {} particles on {} ({} free cells), seed {}",
            filter.particles.len(),
            filter.grid,
            filter.sampler.free_cell_count(),
            filter.config.seed
        );
        Ok(filter)
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
    pub fn grid(&self) -> &OccupancyGrid {
        &self.grid
    }
    /// Current population. Sorted ascending by weight after every step.
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    /// Point estimates of every step so far.
    pub fn trace(&self) -> &[TracePoint] {
        &self.trace
    }
    /// Number of steps processed.
    pub fn steps(&self) -> usize {
        self.step_index
    }

    /// Advance the filter by one logged observation.
    ///
    /// A laser observation must carry exactly [`LASER_READINGS`] ranges; anything else is rejected as
    /// [`MclError::MalformedObservation`] before the population is touched.
    pub fn step(&mut self, observation: &Observation) -> Result<StepOutcome<'_>> {
        if let Some(ranges) = observation.ranges()
            && ranges.len() != LASER_READINGS
        {
            return Err(MclError::MalformedObservation {
                line: self.step_index + 1,
                reason: format!(
                    "laser scan has {} readings, expected {LASER_READINGS}",
                    ranges.len()
                ),
            });
        }
        if self.config.shuffle_between_steps && self.step_index > 0 {
            self.particles.shuffle(&mut self.rng);
        }
        let current = *observation.pose();
        let previous = self.previous_pose.unwrap_or(current);
        let control = current.delta_from(&previous);

        self.predict(&previous, &control);
        let valid = self.particles.len();
        if let Some(ranges) = observation.ranges() {
            self.weight(ranges);
        }
        let resampled = observation.is_laser()
            && (self.step_index + 1) % self.config.resample_period == 0
            && !self.particles.is_empty();
        if resampled {
            self.resample();
        }
        self.repair();
        self.sort_by_weight();

        let Some(estimate) = self.particles.last().map(|p| p.pose) else {
            return Err(MclError::EmptyPopulation {
                step: self.step_index,
            });
        };
        self.trace.push(TracePoint {
            timestamp: observation.timestamp(),
            x: estimate.x,
            y: estimate.y,
            theta: estimate.theta,
        });
        debug!(
            "Step {} t={:.4}: {} valid after motion, {} particles{}, estimate {}",
            self.step_index,
            observation.timestamp(),
            valid,
            self.particles.len(),
            if resampled { " (resampled)" } else { "" },
            estimate
        );
        self.previous_pose = Some(current);
        self.step_index += 1;
        Ok(StepOutcome {
            particles: &self.particles,
            estimate,
            resampled,
        })
    }

    /// Run every observation through the filter and return the resulting trace.
    pub fn run(&mut self, observations: &[Observation]) -> Result<&[TracePoint]> {
        for observation in observations {
            self.step(observation)?;
        }
        Ok(&self.trace)
    }

    /// Effective number of particles, `1 / sum(w^2)` over the normalized log weights.
    pub fn effective_sample_size(&self) -> f64 {
        let weights = exp_normalize(&self.log_weights());
        let sum_of_squares: f64 = weights.iter().map(|w| w * w).sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }

    /// Weighted mean pose of the population, with the heading averaged on the unit circle.
    pub fn weighted_mean(&self) -> Option<Pose> {
        if self.particles.is_empty() {
            return None;
        }
        let weights = exp_normalize(&self.log_weights());
        let (mut x, mut y, mut sin, mut cos) = (0.0, 0.0, 0.0, 0.0);
        for (particle, w) in self.particles.iter().zip(&weights) {
            x += w * particle.pose.x;
            y += w * particle.pose.y;
            sin += w * particle.pose.theta.sin();
            cos += w * particle.pose.theta.cos();
        }
        Some(Pose::new(x, y, sin.atan2(cos)))
    }

    fn log_weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.log_weight).collect()
    }

    fn create_particles(&mut self) -> Vec<Particle> {
        (0..self.config.num_particles)
            .map(|_| Particle::new(self.sampler.sample(&self.grid, &mut self.rng)))
            .collect()
    }

    fn perturbed_clone(&mut self, particle: &Particle) -> Particle {
        let pose = self.sampler.perturb(
            &particle.pose,
            &self.grid,
            &self.config.perturbation,
            &mut self.rng,
        );
        Particle { pose, ..*particle }
    }

    fn predict(&mut self, previous: &Pose, control: &Control) {
        let before = self.particles.len();
        let threshold = self.config.valid_threshold;
        let mut survivors = Vec::with_capacity(before);
        for mut particle in self.particles.drain(..) {
            particle.pose = self
                .motion
                .predict(&particle.pose, previous, control, &mut self.rng);
            if self.grid.is_valid_position(&particle.pose, threshold) {
                survivors.push(particle);
            }
        }
        self.particles = survivors;
        if self.particles.len() < before {
            debug!(
                "Motion update dropped {} of {} particles",
                before - self.particles.len(),
                before
            );
        }
    }

    fn weight(&mut self, ranges: &[f64]) {
        let max_range = self.sensor.max_range();
        for particle in self.particles.iter_mut() {
            self.alignment.align(
                &particle.pose,
                ranges,
                &self.grid,
                &self.cache,
                max_range,
                &mut self.expected,
                &mut self.actual,
            );
            let log_likelihood = self.sensor.sum_of_log_likelihood(&self.expected, &self.actual);
            particle.accumulate_log_weight(self.config.likelihood_scale * log_likelihood);
        }
    }

    fn resample(&mut self) {
        let weights = exp_normalize(&self.log_weights());
        let counts = sample_multinomial(&weights, self.particles.len(), &mut self.rng);
        let source = std::mem::take(&mut self.particles);
        let mut next = Vec::with_capacity(source.len());
        for ((particle, count), weight) in source.iter().zip(counts).zip(weights) {
            let survivor = Particle {
                weight,
                log_weight: 0.0,
                ..*particle
            };
            for remaining in (1..=count).rev() {
                if remaining == 1 {
                    next.push(survivor);
                } else if remaining == 2 || next.len() < self.config.min_particles {
                    let clone = self.perturbed_clone(&survivor);
                    next.push(clone);
                }
            }
        }
        debug!(
            "Resampled {} particles into {}",
            source.len(),
            next.len()
        );
        self.particles = next;
    }

    fn repair(&mut self) {
        if self.particles.is_empty() {
            warn!(
                "Population emptied at step {}, resampling {} particles over the map",
                self.step_index, self.config.num_particles
            );
            self.particles = self.create_particles();
        }
        let added = self.config.min_particles.saturating_sub(self.particles.len());
        for _ in 0..added {
            let index = self.rng.random_range(0..self.particles.len());
            let source = self.particles[index];
            let clone = self.perturbed_clone(&source);
            self.particles.push(clone);
        }
        if added > 0 {
            debug!("Topped up population with {} perturbed clones", added);
        }
    }

    fn sort_by_weight(&mut self) {
        self.particles.sort_by(|a, b| {
            a.weight
                .total_cmp(&b.weight)
                .then(a.log_weight.total_cmp(&b.log_weight))
        });
    }
}
