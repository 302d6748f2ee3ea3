//! Occupancy grid of the known map.
//!
//! Every cell stores the probability that the robot can occupy it: `1.0` is certainly free floor,
//! `0.0` is certainly an obstacle, and the sentinel `-1` marks cells whose state is unknown. The grid
//! is loaded once and never mutated afterwards; the filter and the ray caster only ever read it.
//!
//! Cells are addressed by integer `(x, y)` coordinates. A continuous pose maps to a cell by dividing
//! its position by the cell size and flooring, so negative positions fall outside the grid.
//!
//! # Text format
//!
//! The grid file holds one line per `x` index with the whitespace separated values for every `y`
//! index. Leading lines whose first token is not a number (for example the
//! `robot_specifications->...` header of the Wean Hall map) are skipped.

use std::fmt::{self, Debug, Display};
use std::fs;
use std::path::Path;

use crate::error::{MclError, Result};
use crate::Pose;

/// Value stored for cells whose occupancy is unknown.
pub const UNKNOWN: f64 = -1.0;
/// Occupancy above which a pose is considered confidently free.
pub const DEFAULT_VALID_THRESHOLD: f64 = 0.8;

#[derive(Clone, PartialEq)]
pub struct OccupancyGrid {
    width: usize,
    height: usize,
    cell_size: f64,
    cells: Vec<f64>,
}
impl Debug for OccupancyGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unknown = self.cells.iter().filter(|v| **v < 0.0).count();
        f.debug_struct("OccupancyGrid")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("cell_size", &self.cell_size)
            .field("unknown_cells", &unknown)
            .finish()
    }
}
impl Display for OccupancyGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OccupancyGrid({}x{} cells, {} units/cell)",
            self.width, self.height, self.cell_size
        )
    }
}

impl OccupancyGrid {
    /// Build a grid from cell values laid out as `cells[x * height + y]`.
    ///
    /// Negative values are normalized to [`UNKNOWN`]; values above one or non-finite values are
    /// rejected.
    pub fn new(width: usize, height: usize, cell_size: f64, cells: Vec<f64>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(MclError::InvalidGrid {
                reason: format!("grid dimensions must be positive, got {width}x{height}"),
            });
        }
        if !(cell_size > 0.0 && cell_size.is_finite()) {
            return Err(MclError::InvalidGrid {
                reason: format!("cell size must be positive, got {cell_size}"),
            });
        }
        if cells.len() != width * height {
            return Err(MclError::InvalidGrid {
                reason: format!(
                    "expected {} cell values for a {width}x{height} grid, got {}",
                    width * height,
                    cells.len()
                ),
            });
        }
        let mut cells = cells;
        for (index, value) in cells.iter_mut().enumerate() {
            if !value.is_finite() || *value > 1.0 {
                return Err(MclError::InvalidGrid {
                    reason: format!(
                        "cell ({}, {}) holds {value}, expected a probability or -1",
                        index / height,
                        index % height
                    ),
                });
            }
            if *value < 0.0 {
                *value = UNKNOWN;
            }
        }
        Ok(OccupancyGrid {
            width,
            height,
            cell_size,
            cells,
        })
    }

    /// Build a grid from rows where `rows[x][y]` is the value of cell `(x, y)`.
    pub fn from_rows(rows: Vec<Vec<f64>>, cell_size: f64) -> Result<Self> {
        let width = rows.len();
        let height = rows.first().map_or(0, Vec::len);
        if let Some((x, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != height) {
            return Err(MclError::InvalidGrid {
                reason: format!("row {x} has {} values, expected {height}", row.len()),
            });
        }
        Self::new(width, height, cell_size, rows.into_iter().flatten().collect())
    }

    /// Parse the text format described in the module documentation.
    pub fn parse(text: &str, cell_size: f64) -> Result<Self> {
        let mut rows = Vec::new();
        for (line_index, line) in text.lines().enumerate() {
            let mut tokens = line.split_whitespace().peekable();
            match tokens.peek() {
                None => continue,
                Some(first) if first.parse::<f64>().is_err() && rows.is_empty() => continue,
                Some(_) => {}
            }
            let row = tokens
                .map(|token| {
                    token.parse::<f64>().map_err(|_| MclError::InvalidGrid {
                        reason: format!("line {}: '{token}' is not a number", line_index + 1),
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            rows.push(row);
        }
        Self::from_rows(rows, cell_size)
    }

    /// Load a grid file from disk.
    pub fn from_file<P: AsRef<Path>>(path: P, cell_size: f64) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| MclError::io(path, e))?;
        Self::parse(&text, cell_size)
    }

    /// Number of cells along `x`.
    pub fn width(&self) -> usize {
        self.width
    }
    /// Number of cells along `y`.
    pub fn height(&self) -> usize {
        self.height
    }
    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }
    /// Size of the mapped area in length units along `x` and `y`.
    pub fn extent(&self) -> (f64, f64) {
        (
            self.width as f64 * self.cell_size,
            self.height as f64 * self.cell_size,
        )
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height
    }

    /// Raw cell value, including the [`UNKNOWN`] sentinel. `None` outside the grid.
    pub fn value(&self, x: i64, y: i64) -> Option<f64> {
        if self.contains(x, y) {
            Some(self.cells[x as usize * self.height + y as usize])
        } else {
            None
        }
    }

    /// Occupancy probability of a cell. `None` outside the grid or when the cell is unknown.
    pub fn occupancy(&self, x: i64, y: i64) -> Option<f64> {
        self.value(x, y).filter(|v| *v >= 0.0)
    }

    pub fn is_unknown(&self, x: i64, y: i64) -> bool {
        matches!(self.value(x, y), Some(v) if v < 0.0)
    }

    /// Cell containing a continuous position.
    pub fn cell_of(&self, pose: &Pose) -> (i64, i64) {
        (
            (pose.x / self.cell_size).floor() as i64,
            (pose.y / self.cell_size).floor() as i64,
        )
    }

    /// A pose is valid when its cell is known and occupiable with probability above `threshold`.
    pub fn is_valid_position(&self, pose: &Pose, threshold: f64) -> bool {
        if !(pose.x.is_finite() && pose.y.is_finite()) {
            return false;
        }
        let (x, y) = self.cell_of(pose);
        self.occupancy(x, y).is_some_and(|p| p > threshold)
    }

    /// Coordinates of every cell whose occupancy exceeds `threshold`, in `x`-major order.
    pub fn free_cells(&self, threshold: f64) -> Vec<(usize, usize)> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, v)| **v > threshold)
            .map(|(index, _)| (index / self.height, index % self.height))
            .collect()
    }
}
