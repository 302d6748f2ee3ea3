//! Expected laser ranges precomputed by ray casting over the occupancy grid.
//!
//! Evaluating the sensor model needs, for every particle and every beam, the range the laser would
//! report if the robot stood exactly at the particle pose. Tracing those rays on every step is far too
//! slow for thousands of particles, so the ranges are computed once for every cell and every heading
//! bin and stored in an [`ExpectedRangeCache`]. The cache is read-only once built and can be written to
//! disk so that subsequent runs load it instead of recomputing it.
//!
//! Rays are traced with Bresenham's integer line algorithm from the centre of a cell towards the
//! furthest cell reachable at the configured maximum range:
//!
//! ```text
//!     3 │        ●
//!     2 │     ●●
//!     1 │  ●●
//!     0 ●●
//!       └──────────
//!        0 1 2 3 4 5 6 7
//! ```
//!
//! A ray stops at the first cell whose value is below the free-space threshold (unknown cells included)
//! and reports the Euclidean distance travelled in map units. A ray that leaves the grid or exhausts
//! the maximum range reports the maximum range.
//!
//! # On-disk format
//!
//! Little-endian, in order: the 8 byte magic `MCLRANGE`, a `u32` format version, `u32` width, height
//! and bin count, `f64` cell size, maximum range and free-space threshold, followed by
//! `width * height * bins` `f32` ranges in `[x][y][bin]` order.

use std::f64::consts::TAU;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{MclError, Result};
use crate::grid::OccupancyGrid;

const MAGIC: &[u8; 8] = b"MCLRANGE";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 * 4 + 8 * 3;

fn default_bins() -> usize {
    120
}
fn default_max_range() -> f64 {
    8183.0
}
fn default_free_threshold() -> f64 {
    0.7
}

/// Parameters of the ray casting precomputation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RayCastConfig {
    /// Number of heading bins partitioning `[0, 2pi)`. Bin 0 starts at heading 0.
    #[serde(default = "default_bins")]
    pub bins: usize,
    /// Range reported when a ray hits nothing, in map length units.
    #[serde(default = "default_max_range")]
    pub max_range: f64,
    /// Cells with a value below this threshold stop a ray.
    #[serde(default = "default_free_threshold")]
    pub free_threshold: f64,
}
impl Default for RayCastConfig {
    fn default() -> Self {
        RayCastConfig {
            bins: default_bins(),
            max_range: default_max_range(),
            free_threshold: default_free_threshold(),
        }
    }
}
impl RayCastConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bins < 2 || self.bins % 2 != 0 || self.bins > 360 {
            return Err(MclError::InvalidConfig(format!(
                "ray cast bins must be an even number between 2 and 360, got {}",
                self.bins
            )));
        }
        if !(self.max_range > 0.0 && self.max_range.is_finite()) {
            return Err(MclError::InvalidConfig(format!(
                "ray cast max_range must be positive, got {}",
                self.max_range
            )));
        }
        if !(0.0..=1.0).contains(&self.free_threshold) {
            return Err(MclError::InvalidConfig(format!(
                "free_threshold must lie in [0, 1], got {}",
                self.free_threshold
            )));
        }
        Ok(())
    }
}

/// Heading bin containing `theta` when `[0, 2pi)` is split into `bins` equal bins.
pub fn theta_to_bin(theta: f64, bins: usize) -> usize {
    let bin = (theta / TAU * bins as f64).floor() as i64;
    bin.rem_euclid(bins as i64) as usize
}

/// Heading at the start of a bin.
pub fn bin_to_theta(bin: usize, bins: usize) -> f64 {
    bin as f64 * TAU / bins as f64
}

/// Integer line iterator over the cells between two grid coordinates, both ends included.
#[derive(Clone, Debug)]
pub struct BresenhamLine {
    x: i64,
    y: i64,
    dx: i64,
    dy: i64,
    x_inc: i64,
    y_inc: i64,
    error: i64,
    steep: bool,
    end_x: i64,
    end_y: i64,
    done: bool,
}
impl BresenhamLine {
    pub fn new(start: (i64, i64), end: (i64, i64)) -> Self {
        let dx = (end.0 - start.0).abs();
        let dy = (end.1 - start.1).abs();
        let steep = dy > dx;
        let (x, y, end_x, end_y, dx, dy) = if steep {
            (start.1, start.0, end.1, end.0, dy, dx)
        } else {
            (start.0, start.1, end.0, end.1, dx, dy)
        };
        BresenhamLine {
            x,
            y,
            dx,
            dy,
            x_inc: if end_x > x { 1 } else { -1 },
            y_inc: if end_y > y { 1 } else { -1 },
            error: dx / 2,
            steep,
            end_x,
            end_y,
            done: false,
        }
    }
}
impl Iterator for BresenhamLine {
    type Item = (i64, i64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let cell = if self.steep {
            (self.y, self.x)
        } else {
            (self.x, self.y)
        };
        if self.x == self.end_x && self.y == self.end_y {
            self.done = true;
            return Some(cell);
        }
        self.error -= self.dy;
        if self.error < 0 {
            self.y += self.y_inc;
            self.error += self.dx;
        }
        self.x += self.x_inc;
        Some(cell)
    }
}

/// Range a laser at cell `(x, y)` pointing along `theta` would report.
pub fn trace_ray(grid: &OccupancyGrid, x: usize, y: usize, theta: f64, config: &RayCastConfig) -> f64 {
    let start = (x as i64, y as i64);
    match grid.value(start.0, start.1) {
        Some(value) if value >= config.free_threshold => {}
        _ => return 0.0,
    }
    let reach = (config.max_range / grid.cell_size()).trunc();
    let end = (
        start.0 + (reach * theta.cos()).trunc() as i64,
        start.1 + (reach * theta.sin()).trunc() as i64,
    );
    for cell in BresenhamLine::new(start, end).skip(1) {
        match grid.value(cell.0, cell.1) {
            None => return config.max_range,
            Some(value) if value < config.free_threshold => {
                let cells = (((cell.0 - start.0).pow(2) + (cell.1 - start.1).pow(2)) as f64).sqrt();
                return (cells * grid.cell_size()).min(config.max_range);
            }
            Some(_) => {}
        }
    }
    config.max_range
}

/// Expected laser range for every `(cell, heading bin)` pair of a grid.
#[derive(Clone, PartialEq)]
pub struct ExpectedRangeCache {
    width: usize,
    height: usize,
    bins: usize,
    cell_size: f64,
    max_range: f64,
    free_threshold: f64,
    ranges: Vec<f32>,
}
impl std::fmt::Debug for ExpectedRangeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpectedRangeCache")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bins", &self.bins)
            .field("cell_size", &self.cell_size)
            .field("max_range", &self.max_range)
            .field("free_threshold", &self.free_threshold)
            .finish()
    }
}

impl ExpectedRangeCache {
    /// Trace every ray of the grid. Columns of the grid are processed in parallel.
    pub fn build(grid: &OccupancyGrid, config: &RayCastConfig) -> Result<Self> {
        config.validate()?;
        let (width, height, bins) = (grid.width(), grid.height(), config.bins);
        info!(
            "Building expected range cache for {}x{} cells and {} bins",
            width, height, bins
        );
        let started = Instant::now();
        let headings: Vec<f64> = (0..bins).map(|bin| bin_to_theta(bin, bins)).collect();
        let mut ranges = vec![0.0_f32; width * height * bins];
        ranges
            .par_chunks_mut(height * bins)
            .enumerate()
            .for_each(|(x, column)| {
                for (y, cell) in column.chunks_mut(bins).enumerate() {
                    for (slot, theta) in cell.iter_mut().zip(&headings) {
                        *slot = trace_ray(grid, x, y, *theta, config) as f32;
                    }
                }
            });
        info!(
            "Expected range cache built in {:.2} s",
            started.elapsed().as_secs_f64()
        );
        Ok(ExpectedRangeCache {
            width,
            height,
            bins,
            cell_size: grid.cell_size(),
            max_range: config.max_range,
            free_threshold: config.free_threshold,
            ranges,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }
    pub fn height(&self) -> usize {
        self.height
    }
    pub fn bins(&self) -> usize {
        self.bins
    }
    pub fn max_range(&self) -> f64 {
        self.max_range
    }

    /// Expected range at cell `(x, y)` for heading bin `bin`.
    ///
    /// # Panics
    ///
    /// Panics if the cell or bin lies outside the cache.
    pub fn lookup(&self, x: usize, y: usize, bin: usize) -> f64 {
        assert!(
            x < self.width && y < self.height && bin < self.bins,
            "lookup ({x}, {y}, {bin}) outside a {}x{}x{} cache",
            self.width,
            self.height,
            self.bins
        );
        self.ranges[(x * self.height + y) * self.bins + bin] as f64
    }

    /// Reject a cache that was not built for this grid and configuration.
    pub fn check_compatible(&self, grid: &OccupancyGrid, config: &RayCastConfig) -> Result<()> {
        let mismatch = |what: &str, cached: String, wanted: String| {
            Err(MclError::CacheUnavailable {
                reason: format!("cache {what} is {cached} but {wanted} is required"),
            })
        };
        if self.width != grid.width() || self.height != grid.height() {
            return mismatch(
                "size",
                format!("{}x{}", self.width, self.height),
                format!("{}x{}", grid.width(), grid.height()),
            );
        }
        if self.cell_size != grid.cell_size() {
            return mismatch(
                "cell size",
                self.cell_size.to_string(),
                grid.cell_size().to_string(),
            );
        }
        if self.bins != config.bins {
            return mismatch("bin count", self.bins.to_string(), config.bins.to_string());
        }
        if self.max_range != config.max_range {
            return mismatch(
                "max range",
                self.max_range.to_string(),
                config.max_range.to_string(),
            );
        }
        if self.free_threshold != config.free_threshold {
            return mismatch(
                "free-space threshold",
                self.free_threshold.to_string(),
                config.free_threshold.to_string(),
            );
        }
        Ok(())
    }

    /// Write the cache to `path` in the versioned binary format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| MclError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        for dim in [self.width, self.height, self.bins] {
            header.extend_from_slice(&(dim as u32).to_le_bytes());
        }
        for value in [self.cell_size, self.max_range, self.free_threshold] {
            header.extend_from_slice(&value.to_le_bytes());
        }
        writer.write_all(&header).map_err(|e| MclError::io(path, e))?;
        for range in &self.ranges {
            writer
                .write_all(&range.to_le_bytes())
                .map_err(|e| MclError::io(path, e))?;
        }
        writer.flush().map_err(|e| MclError::io(path, e))?;
        debug!("Saved expected range cache to {}", path.display());
        Ok(())
    }

    /// Read a cache previously written by [`ExpectedRangeCache::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| MclError::CacheUnavailable {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_bytes(&bytes).map_err(|reason| MclError::CacheUnavailable {
            reason: format!("{}: {reason}", path.display()),
        })
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < HEADER_LEN {
            return Err(format!("file holds {} bytes, header needs {HEADER_LEN}", bytes.len()));
        }
        if &bytes[..8] != MAGIC {
            return Err("not an expected range cache".to_string());
        }
        let u32_at = |offset: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[offset..offset + 4]);
            u32::from_le_bytes(word)
        };
        let f64_at = |offset: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[offset..offset + 8]);
            f64::from_le_bytes(word)
        };
        let version = u32_at(8);
        if version != FORMAT_VERSION {
            return Err(format!("unsupported format version {version}"));
        }
        let (width, height, bins) = (
            u32_at(12) as usize,
            u32_at(16) as usize,
            u32_at(20) as usize,
        );
        let (cell_size, max_range, free_threshold) = (f64_at(24), f64_at(32), f64_at(40));
        let count = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(bins))
            .filter(|n| n.checked_mul(4).is_some())
            .ok_or_else(|| format!("header dimensions {width}x{height}x{bins} are too large"))?;
        let body = &bytes[HEADER_LEN..];
        if body.len() != count * 4 {
            return Err(format!(
                "expected {count} ranges for a {width}x{height}x{bins} cache, found {} bytes",
                body.len()
            ));
        }
        let ranges = body
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Ok(ExpectedRangeCache {
            width,
            height,
            bins,
            cell_size,
            max_range,
            free_threshold,
            ranges,
        })
    }

    /// Load the cache at `path` if it exists, otherwise build it and save it there.
    ///
    /// An existing file that is corrupt or was built for another grid or configuration is an error;
    /// it is never silently replaced.
    pub fn load_or_build<P: AsRef<Path>>(
        path: P,
        grid: &OccupancyGrid,
        config: &RayCastConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            info!("Loading expected range cache from {}", path.display());
            let cache = Self::load(path)?;
            cache.check_compatible(grid, config)?;
            return Ok(cache);
        }
        let cache = Self::build(grid, config)?;
        cache.save(path)?;
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    /// 11x11 room with walls on the border and open floor inside.
    fn room() -> OccupancyGrid {
        let rows = (0..11)
            .map(|x| {
                (0..11)
                    .map(|y| if x == 0 || y == 0 || x == 10 || y == 10 { 0.0 } else { 1.0 })
                    .collect()
            })
            .collect();
        OccupancyGrid::from_rows(rows, 10.0).unwrap()
    }

    fn config(bins: usize) -> RayCastConfig {
        RayCastConfig {
            bins,
            max_range: 8183.0,
            free_threshold: 0.7,
        }
    }

    #[test]
    fn bresenham_covers_both_ends_without_gaps() {
        let cells: Vec<_> = BresenhamLine::new((0, 0), (7, 3)).collect();
        assert_eq!(cells.first(), Some(&(0, 0)));
        assert_eq!(cells.last(), Some(&(7, 3)));
        assert_eq!(cells.len(), 8);
        for pair in cells.windows(2) {
            assert!((pair[1].0 - pair[0].0).abs() <= 1 && (pair[1].1 - pair[0].1).abs() <= 1);
        }
        let steep: Vec<_> = BresenhamLine::new((2, 5), (1, -1)).collect();
        assert_eq!(steep.len(), 7);
        assert_eq!(steep.last(), Some(&(1, -1)));
    }

    #[test]
    fn theta_to_bin_wraps_negative_headings() {
        assert_eq!(theta_to_bin(0.0, 120), 0);
        assert_eq!(theta_to_bin(PI, 120), 60);
        assert_eq!(theta_to_bin(-1e-9, 120), 119);
        assert_eq!(theta_to_bin(2.0 * TAU + 0.01, 120), 0);
        assert_eq!(theta_to_bin(-PI / 2.0, 4), 3);
    }

    #[test]
    fn rays_stop_at_walls() {
        let grid = room();
        let cfg = config(4);
        // From (5, 5) a wall sits five cells away in every axis direction.
        for bin in 0..4 {
            assert_approx_eq!(trace_ray(&grid, 5, 5, bin_to_theta(bin, 4), &cfg), 50.0, 1e-9);
        }
        assert_approx_eq!(trace_ray(&grid, 2, 5, PI, &cfg), 20.0, 1e-9);
    }

    #[test]
    fn occupied_start_cell_reads_zero() {
        let grid = room();
        assert_eq!(trace_ray(&grid, 0, 4, 0.0, &config(4)), 0.0);
    }

    #[test]
    fn unknown_cells_stop_rays() {
        let mut rows = vec![vec![1.0; 5]; 5];
        rows[3][0] = -1.0;
        let grid = OccupancyGrid::from_rows(rows, 10.0).unwrap();
        assert_approx_eq!(trace_ray(&grid, 0, 0, 0.0, &config(4)), 30.0, 1e-9);
    }

    #[test]
    fn open_rays_report_max_range() {
        let grid = OccupancyGrid::from_rows(vec![vec![1.0; 5]; 5], 10.0).unwrap();
        let cfg = RayCastConfig {
            max_range: 20.0,
            ..config(4)
        };
        // Exhausts the range inside the grid.
        assert_eq!(trace_ray(&grid, 0, 0, 0.0, &cfg), 20.0);
        // Leaves the grid before hitting anything.
        assert_eq!(trace_ray(&grid, 4, 4, 0.0, &config(4)), 8183.0);
    }

    #[test]
    fn build_matches_individual_rays() {
        let grid = room();
        let cfg = config(8);
        let cache = ExpectedRangeCache::build(&grid, &cfg).unwrap();
        for x in 0..grid.width() {
            for y in 0..grid.height() {
                for bin in 0..cfg.bins {
                    let expected = trace_ray(&grid, x, y, bin_to_theta(bin, cfg.bins), &cfg) as f32;
                    assert_eq!(cache.lookup(x, y, bin), expected as f64);
                }
            }
        }
    }

    #[test]
    fn save_and_load_preserve_every_range() {
        let grid = room();
        let cfg = config(8);
        let cache = ExpectedRangeCache::build(&grid, &cfg).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranges.bin");
        cache.save(&path).unwrap();
        let loaded = ExpectedRangeCache::load(&path).unwrap();
        assert_eq!(loaded, cache);
        loaded.check_compatible(&grid, &cfg).unwrap();
    }

    #[test]
    fn mismatched_cache_is_rejected() {
        let grid = room();
        let cache = ExpectedRangeCache::build(&grid, &config(8)).unwrap();
        let err = cache.check_compatible(&grid, &config(4)).unwrap_err();
        assert!(matches!(err, MclError::CacheUnavailable { .. }));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranges.bin");
        cache.save(&path).unwrap();
        let err = ExpectedRangeCache::load_or_build(&path, &grid, &config(4)).unwrap_err();
        assert!(matches!(err, MclError::CacheUnavailable { .. }));
    }

    #[test]
    fn corrupt_or_missing_files_are_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.bin");
        fs::write(&path, b"definitely not a cache").unwrap();
        assert!(matches!(
            ExpectedRangeCache::load(&path),
            Err(MclError::CacheUnavailable { .. })
        ));
        assert!(matches!(
            ExpectedRangeCache::load(dir.path().join("missing.bin")),
            Err(MclError::CacheUnavailable { .. })
        ));

        // Headers whose dimensions overflow the range count.
        for dims in [[u32::MAX; 3], [u32::MAX, u32::MAX, 1]] {
            let mut header = MAGIC.to_vec();
            header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
            for dim in dims {
                header.extend_from_slice(&dim.to_le_bytes());
            }
            for value in [10.0f64, 8183.0, 0.7] {
                header.extend_from_slice(&value.to_le_bytes());
            }
            assert_eq!(header.len(), HEADER_LEN);
            fs::write(&path, &header).unwrap();
            assert!(matches!(
                ExpectedRangeCache::load(&path),
                Err(MclError::CacheUnavailable { .. })
            ));
        }
    }

    #[test]
    fn load_or_build_creates_missing_file() {
        let grid = room();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranges.bin");
        let built = ExpectedRangeCache::load_or_build(&path, &grid, &config(4)).unwrap();
        assert!(path.exists());
        let reloaded = ExpectedRangeCache::load_or_build(&path, &grid, &config(4)).unwrap();
        assert_eq!(built, reloaded);
    }
}
