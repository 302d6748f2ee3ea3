//! Run harness: configuration, end-to-end localization, trace files and path error.
//!
//! [`SimulationConfig`] bundles every tunable of a run and can be stored as JSON, YAML or TOML, the
//! format being chosen from the file extension. [`run_localization`] replays a robot log through a
//! freshly built filter and returns the point estimate trace, which [`write_trace`] stores as CSV with
//! one `timestamp,x,y,theta` row per step. [`path_rmse`] scores a trace against a ground-truth log.
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{MclError, Result};
use crate::filter::{FilterConfig, MonteCarloLocalization, TracePoint};
use crate::grid::OccupancyGrid;
use crate::measurements::{GaussianSensor, MixtureSensor, SensorModel};
use crate::messages::Observation;
use crate::odometry::{MotionModel, NaiveOdometry, SampledOdometry};
use crate::raycast::{ExpectedRangeCache, RayCastConfig};
use crate::DEFAULT_CELL_SIZE;

fn default_noise() -> [f64; 4] {
    SampledOdometry::default().noise
}

/// Selection of the motion model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MotionModelConfig {
    #[default]
    Naive,
    Sampled {
        #[serde(default = "default_noise")]
        noise: [f64; 4],
    },
}
impl MotionModelConfig {
    pub fn build(&self) -> Box<dyn MotionModel> {
        match self {
            MotionModelConfig::Naive => Box::new(NaiveOdometry),
            MotionModelConfig::Sampled { noise } => Box::new(SampledOdometry::new(*noise)),
        }
    }
}

/// Selection of the sensor model and its parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorModelConfig {
    Gaussian(GaussianSensor),
    Mixture(MixtureSensor),
}
impl Default for SensorModelConfig {
    fn default() -> Self {
        SensorModelConfig::Gaussian(GaussianSensor::default())
    }
}
impl SensorModelConfig {
    pub fn build(&self) -> Result<Box<dyn SensorModel>> {
        match self {
            SensorModelConfig::Gaussian(sensor) => {
                sensor.validate()?;
                Ok(Box::new(*sensor))
            }
            SensorModelConfig::Mixture(sensor) => {
                sensor.validate()?;
                Ok(Box::new(*sensor))
            }
        }
    }
    /// Range readings are clipped to this value when a log is loaded.
    pub fn max_range(&self) -> f64 {
        match self {
            SensorModelConfig::Gaussian(sensor) => sensor.max_range,
            SensorModelConfig::Mixture(sensor) => sensor.max_range,
        }
    }
}

fn default_cell_size() -> f64 {
    DEFAULT_CELL_SIZE
}

/// Every tunable of a localization run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Map length units per grid cell.
    #[serde(default = "default_cell_size")]
    pub cell_size: f64,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub raycast: RayCastConfig,
    #[serde(default)]
    pub motion_model: MotionModelConfig,
    #[serde(default)]
    pub sensor_model: SensorModelConfig,
}
impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            cell_size: default_cell_size(),
            filter: FilterConfig::default(),
            raycast: RayCastConfig::default(),
            motion_model: MotionModelConfig::default(),
            sensor_model: SensorModelConfig::default(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.cell_size > 0.0 && self.cell_size.is_finite()) {
            return Err(MclError::InvalidConfig(format!(
                "cell_size must be positive, got {}",
                self.cell_size
            )));
        }
        self.filter.validate()?;
        self.raycast.validate()?;
        self.sensor_model.build().map(|_| ())
    }

    /// Write the configuration, in the format named by the file extension.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        let text = match ConfigFormat::of(path)? {
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(io::Error::other)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self).map_err(io::Error::other)?,
            ConfigFormat::Toml => toml::to_string(self).map_err(io::Error::other)?,
        };
        fs::write(path, text)
    }
    /// Read a configuration written by [`SimulationConfig::to_file`] or by hand.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::of(path)?;
        let text = fs::read_to_string(path)?;
        match format {
            ConfigFormat::Json => serde_json::from_str(&text).map_err(io::Error::other),
            ConfigFormat::Yaml => serde_yaml::from_str(&text).map_err(io::Error::other),
            ConfigFormat::Toml => toml::from_str(&text).map_err(io::Error::other),
        }
    }
}

/// On-disk configuration formats, selected by extension (`.json`, `.yaml`/`.yml`, `.toml`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}
impl ConfigFormat {
    fn of(path: &Path) -> io::Result<Self> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("json") => Ok(ConfigFormat::Json),
            Some("yaml" | "yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported configuration extension {:?}", other.unwrap_or("")),
            )),
        }
    }
}

/// Replay `observations` through a new filter and return the point estimate of every step.
pub fn run_localization(
    grid: Arc<OccupancyGrid>,
    cache: Arc<ExpectedRangeCache>,
    observations: &[Observation],
    config: &SimulationConfig,
) -> Result<Vec<TracePoint>> {
    config.validate()?;
    cache.check_compatible(&grid, &config.raycast)?;
    let mut filter = MonteCarloLocalization::new(
        grid,
        cache,
        config.motion_model.build(),
        config.sensor_model.build()?,
        config.filter.clone(),
    )?;
    let trace = filter.run(observations)?.to_vec();
    info!(
        "Localized {} observations, final estimate {}",
        filter.steps(),
        trace
            .last()
            .map(|p| p.pose().to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    Ok(trace)
}

/// Write a trace as CSV with a `timestamp,x,y,theta` header.
pub fn write_trace<P: AsRef<Path>>(trace: &[TracePoint], path: P) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)?;
    for point in trace {
        writer.serialize(point)?;
    }
    writer.flush().map_err(|e| MclError::io(path, e))?;
    Ok(())
}

/// Read a trace written by [`write_trace`].
pub fn read_trace<P: AsRef<Path>>(path: P) -> Result<Vec<TracePoint>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut trace = Vec::new();
    for record in reader.deserialize() {
        trace.push(record?);
    }
    Ok(trace)
}

/// Root mean squared position error of a trace against a ground-truth log.
///
/// The trace is aligned so that its first point with the same timestamp as the first ground-truth
/// observation is compared with that observation, and pairs are then taken in order until either
/// sequence ends. Without a matching timestamp the sequences are compared from their starts. Returns
/// `None` when no pair can be formed.
pub fn path_rmse(trace: &[TracePoint], ground_truth: &[Observation]) -> Option<f64> {
    let first = ground_truth.first()?;
    let start = trace
        .iter()
        .position(|p| p.timestamp == first.timestamp())
        .unwrap_or(0);
    let (sum, count) = trace[start..]
        .iter()
        .zip(ground_truth)
        .fold((0.0, 0usize), |(sum, count), (estimate, truth)| {
            let dx = estimate.x - truth.pose().x;
            let dy = estimate.y - truth.pose().y;
            (sum + dx * dx + dy * dy, count + 1)
        });
    if count == 0 {
        None
    } else {
        Some((sum / count as f64).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Pose;
    use assert_approx_eq::assert_approx_eq;

    fn point(timestamp: f64, x: f64, y: f64) -> TracePoint {
        TracePoint {
            timestamp,
            x,
            y,
            theta: 0.0,
        }
    }

    fn truth(timestamp: f64, x: f64, y: f64) -> Observation {
        Observation::Odometry {
            timestamp,
            pose: Pose::new(x, y, 0.0),
        }
    }

    #[test]
    fn test_config_roundtrip_all_formats() {
        let config = SimulationConfig {
            cell_size: 5.0,
            filter: FilterConfig {
                num_particles: 1234,
                seed: 7,
                ..FilterConfig::default()
            },
            motion_model: MotionModelConfig::Sampled {
                noise: [0.01, 0.02, 0.03, 0.04],
            },
            sensor_model: SensorModelConfig::Mixture(MixtureSensor::default()),
            ..SimulationConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();
        for name in ["config.json", "config.yaml", "config.yml", "config.toml"] {
            let path = dir.path().join(name);
            config.to_file(&path).unwrap();
            let read = SimulationConfig::from_file(&path).unwrap();
            assert_eq!(read, config, "{name}");
        }
    }

    #[test]
    fn test_config_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        let err = SimulationConfig::default().to_file(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(SimulationConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_config_format_follows_extension() {
        assert_eq!(ConfigFormat::of(Path::new("a.JSON")).unwrap(), ConfigFormat::Json);
        assert_eq!(ConfigFormat::of(Path::new("dir/a.yml")).unwrap(), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::of(Path::new("a.toml")).unwrap(), ConfigFormat::Toml);
        assert!(ConfigFormat::of(Path::new("mcl")).is_err());
    }

    #[test]
    fn test_config_missing_fields_take_defaults() {
        let config: SimulationConfig =
            serde_json::from_str(r#"{"filter": {"num_particles": 10}, "sensor_model": {"type": "mixture"}}"#)
                .unwrap();
        assert_eq!(config.filter.num_particles, 10);
        assert_eq!(config.filter.min_particles, 300);
        assert_eq!(config.filter.seed, 42);
        assert_eq!(config.cell_size, 10.0);
        assert_eq!(config.raycast.bins, 120);
        assert_eq!(config.motion_model, MotionModelConfig::Naive);
        assert_eq!(
            config.sensor_model,
            SensorModelConfig::Mixture(MixtureSensor::default())
        );
    }

    #[test]
    fn test_config_validation_rejects_bad_mixture() {
        let config = SimulationConfig {
            sensor_model: SensorModelConfig::Mixture(MixtureSensor {
                rand_weight: 0.5,
                ..MixtureSensor::default()
            }),
            ..SimulationConfig::default()
        };
        assert!(matches!(config.validate(), Err(MclError::InvalidConfig(_))));
    }

    #[test]
    fn test_trace_csv_roundtrip() {
        let trace = vec![point(0.1, 1.0, 2.0), point(0.2, 3.5, -4.25)];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.csv");
        write_trace(&trace, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("timestamp,x,y,theta"));
        assert_eq!(read_trace(&path).unwrap(), trace);
    }

    #[test]
    fn test_read_trace_missing_file() {
        assert!(read_trace("nonexistent_trace.csv").is_err());
    }

    #[test]
    fn test_path_rmse_aligns_on_first_truth_timestamp() {
        let trace = vec![
            point(0.0, 100.0, 100.0),
            point(1.0, 3.0, 4.0),
            point(2.0, 10.0, 0.0),
        ];
        let ground_truth = vec![truth(1.0, 0.0, 0.0), truth(2.0, 10.0, 0.0)];
        // Errors 5 and 0: sqrt((25 + 0) / 2).
        assert_approx_eq!(path_rmse(&trace, &ground_truth).unwrap(), 12.5_f64.sqrt(), 1e-12);
    }

    #[test]
    fn test_path_rmse_without_pairs() {
        assert_eq!(path_rmse(&[point(0.0, 1.0, 1.0)], &[]), None);
        assert_eq!(path_rmse(&[], &[truth(0.0, 0.0, 0.0)]), None);
    }
}
