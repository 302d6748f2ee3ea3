//! Logged robot observations.
//!
//! A robot log is a text file with one observation per line, as space separated fields:
//!
//! ```text
//! O x y theta timestamp
//! L x y theta xl yl thetal r1 ... r180 timestamp
//! ```
//!
//! `O` records carry only the odometry pose of the robot. `L` records additionally carry the pose of
//! the laser in the odometry frame and 180 range readings that sweep counter-clockwise from 90° right of
//! the laser heading. Readings above the sensor's maximum range are clipped to it on load.
//!
//! Any line that does not match one of these layouts makes the whole log unusable and is reported as
//! [`MclError::MalformedObservation`] with its one-based line number.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::info;

use crate::error::{MclError, Result};
use crate::Pose;

/// Number of range readings in one laser scan.
pub const LASER_READINGS: usize = 180;

const ODOMETRY_FIELDS: usize = 5;
const LASER_FIELDS: usize = 1 + 3 + 3 + LASER_READINGS + 1;

/// One time step of the robot log.
#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    Odometry {
        timestamp: f64,
        pose: Pose,
    },
    Laser {
        timestamp: f64,
        pose: Pose,
        laser_pose: Pose,
        ranges: Vec<f64>,
    },
}

impl Observation {
    pub fn timestamp(&self) -> f64 {
        match self {
            Observation::Odometry { timestamp, .. } | Observation::Laser { timestamp, .. } => {
                *timestamp
            }
        }
    }

    /// Odometry pose of the robot when the observation was recorded.
    pub fn pose(&self) -> &Pose {
        match self {
            Observation::Odometry { pose, .. } | Observation::Laser { pose, .. } => pose,
        }
    }

    /// Laser readings, if the observation carries a scan.
    pub fn ranges(&self) -> Option<&[f64]> {
        match self {
            Observation::Odometry { .. } => None,
            Observation::Laser { ranges, .. } => Some(ranges),
        }
    }

    pub fn is_laser(&self) -> bool {
        matches!(self, Observation::Laser { .. })
    }

    /// Parse one log line. Blank lines yield `None`.
    ///
    /// `line` is the one-based line number used in error reports and `max_range` the value readings are
    /// clipped to.
    pub fn parse_line(text: &str, line: usize, max_range: f64) -> Result<Option<Observation>> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        let Some(kind) = fields.first() else {
            return Ok(None);
        };
        let malformed = |reason: String| MclError::MalformedObservation { line, reason };
        let number = |index: usize| -> Result<f64> {
            let field = fields[index];
            field
                .parse::<f64>()
                .map_err(|_| malformed(format!("field {index} ('{field}') is not a number")))
        };
        let pose_at = |index: usize| -> Result<Pose> {
            Ok(Pose::new(number(index)?, number(index + 1)?, number(index + 2)?))
        };
        match *kind {
            "O" => {
                if fields.len() < ODOMETRY_FIELDS {
                    return Err(malformed(format!(
                        "odometry record has {} fields, expected {ODOMETRY_FIELDS}",
                        fields.len()
                    )));
                }
                Ok(Some(Observation::Odometry {
                    timestamp: number(4)?,
                    pose: pose_at(1)?,
                }))
            }
            "L" => {
                if fields.len() < LASER_FIELDS {
                    return Err(malformed(format!(
                        "laser record has {} fields, expected {LASER_FIELDS}",
                        fields.len()
                    )));
                }
                let ranges = (7..7 + LASER_READINGS)
                    .map(|index| number(index).map(|r| r.min(max_range)))
                    .collect::<Result<Vec<f64>>>()?;
                Ok(Some(Observation::Laser {
                    timestamp: number(LASER_FIELDS - 1)?,
                    pose: pose_at(1)?,
                    laser_pose: pose_at(4)?,
                    ranges,
                }))
            }
            other => Err(malformed(format!("unknown record type '{other}'"))),
        }
    }
}

/// Read every observation of a robot log.
pub fn load_log<P: AsRef<Path>>(path: P, max_range: f64) -> Result<Vec<Observation>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| MclError::io(path, e))?;
    let mut observations = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| MclError::io(path, e))?;
        if let Some(observation) = Observation::parse_line(&line, index + 1, max_range)? {
            observations.push(observation);
        }
    }
    let scans = observations.iter().filter(|o| o.is_laser()).count();
    info!(
        "Loaded {} observations ({} laser scans) from {}",
        observations.len(),
        scans,
        path.display()
    );
    Ok(observations)
}
