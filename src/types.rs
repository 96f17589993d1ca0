use chrono::{DateTime, Utc};
use ndarray::{Array3, Array4, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

/// Raw integer sample as delivered by the loader (reflectance DN or quality code)
pub type RawSample = i32;

/// Floating-point index value; NaN means "no value"
pub type IndexValue = f64;

/// Coordinate system enumeration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoordinateSystem {
    /// Geographic coordinates (latitude, longitude)
    Geographic,
    /// Projected coordinates (e.g., UTM)
    Projected { epsg: u32 },
}

/// Geospatial transformation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square pixels of `resolution` meters
    pub fn north_up(top_left_x: f64, top_left_y: f64, resolution: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: resolution,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -resolution,
        }
    }
}

/// Spatial grid shared by every band and time step of a stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub crs: CoordinateSystem,
    pub geo_transform: GeoTransform,
    pub rows: usize,
    pub cols: usize,
}

impl GridSpec {
    pub fn new(crs: CoordinateSystem, geo_transform: GeoTransform, rows: usize, cols: usize) -> Self {
        Self { crs, geo_transform, rows, cols }
    }

    /// Bare pixel grid without georeferencing (unit pixels, origin at 0,0)
    pub fn pixel_grid(rows: usize, cols: usize) -> Self {
        Self::new(CoordinateSystem::Geographic, GeoTransform::north_up(0.0, 0.0, 1.0), rows, cols)
    }

    /// Ground resolution in meters (x direction)
    pub fn resolution(&self) -> f64 {
        self.geo_transform.pixel_width.abs()
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }
}

/// Multi-band, multi-time raster stack indexed by (band, time, row, column).
///
/// Produced by the catalog-and-load collaborator and consumed read-only.
#[derive(Debug, Clone)]
pub struct RasterStack {
    data: Array4<RawSample>,
    bands: Vec<String>,
    times: Vec<DateTime<Utc>>,
    grid: GridSpec,
}

impl RasterStack {
    pub fn new(
        data: Array4<RawSample>,
        bands: Vec<String>,
        times: Vec<DateTime<Utc>>,
        grid: GridSpec,
    ) -> EoResult<Self> {
        let (n_bands, n_times, rows, cols) = data.dim();

        if bands.len() != n_bands {
            return Err(EoError::InvalidStack(format!(
                "{} band names for {} bands", bands.len(), n_bands
            )));
        }
        if times.len() != n_times {
            return Err(EoError::InvalidStack(format!(
                "{} timestamps for {} time steps", times.len(), n_times
            )));
        }
        if grid.shape() != (rows, cols) {
            return Err(EoError::ShapeMismatch {
                context: "raster stack grid".to_string(),
                expected: format!("{}x{}", grid.rows, grid.cols),
                found: format!("{}x{}", rows, cols),
            });
        }
        for (i, name) in bands.iter().enumerate() {
            if bands[..i].contains(name) {
                return Err(EoError::InvalidStack(format!("duplicate band name '{}'", name)));
            }
        }

        Ok(Self { data, bands, times, grid })
    }

    pub fn band_names(&self) -> &[String] {
        &self.bands
    }

    pub fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    /// (bands, times, rows, cols)
    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.data.dim()
    }

    pub fn has_band(&self, name: &str) -> bool {
        self.bands.iter().any(|b| b == name)
    }

    /// Borrow one band as a (time, row, column) view
    pub fn band(&self, name: &str) -> EoResult<ArrayView3<'_, RawSample>> {
        let index = self
            .bands
            .iter()
            .position(|b| b == name)
            .ok_or_else(|| EoError::MissingBand(name.to_string()))?;
        Ok(self.data.index_axis(Axis(0), index))
    }

    /// Copy one band into a standalone cube carrying the stack metadata
    pub fn band_cube(&self, name: &str) -> EoResult<TimeCube<RawSample>> {
        let view = self.band(name)?;
        Ok(TimeCube {
            data: view.to_owned(),
            times: self.times.clone(),
            grid: self.grid.clone(),
        })
    }
}

/// A (time, row, column) array with its acquisition timestamps and grid.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeCube<T> {
    pub data: Array3<T>,
    pub times: Vec<DateTime<Utc>>,
    pub grid: GridSpec,
}

impl<T> TimeCube<T> {
    pub fn new(data: Array3<T>, times: Vec<DateTime<Utc>>, grid: GridSpec) -> EoResult<Self> {
        let (n_times, rows, cols) = data.dim();
        if times.len() != n_times {
            return Err(EoError::InvalidStack(format!(
                "{} timestamps for {} time steps", times.len(), n_times
            )));
        }
        if grid.shape() != (rows, cols) {
            return Err(EoError::ShapeMismatch {
                context: "time cube grid".to_string(),
                expected: format!("{}x{}", grid.rows, grid.cols),
                found: format!("{}x{}", rows, cols),
            });
        }
        Ok(Self { data, times, grid })
    }

    /// (times, rows, cols)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Same shape, same timestamps, same grid
    pub fn is_aligned_with<U>(&self, other: &TimeCube<U>) -> bool {
        self.data.dim() == other.data.dim() && self.times == other.times && self.grid == other.grid
    }

    /// Build a new cube with the same metadata around `data`
    pub fn with_data<U>(&self, data: Array3<U>) -> TimeCube<U> {
        TimeCube {
            data,
            times: self.times.clone(),
            grid: self.grid.clone(),
        }
    }
}

/// Boolean exclusion mask: `true` = drop the pixel
pub type MaskCube = TimeCube<bool>;

/// Per-scene vegetation index values
pub type IndexCube = TimeCube<IndexValue>;

/// Error types for the vegetation trend pipeline
#[derive(Debug, thiserror::Error)]
pub enum EoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown sensor: {0}")]
    UnknownSensor(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing band: {0}")]
    MissingBand(String),

    #[error("Invalid raster stack: {0}")]
    InvalidStack(String),

    #[error("Shape mismatch in {context}: expected {expected}, found {found}")]
    ShapeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),
}

/// Result type for pipeline operations
pub type EoResult<T> = Result<T, EoError>;

pub(crate) fn check_same_shape<A, B>(
    context: &str,
    expected: &ArrayView3<'_, A>,
    found: &ArrayView3<'_, B>,
) -> EoResult<()> {
    if expected.dim() != found.dim() {
        return Err(EoError::ShapeMismatch {
            context: context.to_string(),
            expected: format!("{:?}", expected.dim()),
            found: format!("{:?}", found.dim()),
        });
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_stack_band_lookup() {
        let data = Array4::from_shape_fn((2, 3, 2, 2), |(b, t, _, _)| (b * 10 + t) as i32);
        let stack = RasterStack::new(
            data,
            vec!["red".to_string(), "nir08".to_string()],
            vec![utc(2020, 1, 1), utc(2020, 1, 9), utc(2020, 1, 17)],
            grid(2, 2),
        )
        .unwrap();

        let nir = stack.band("nir08").unwrap();
        assert_eq!(nir.dim(), (3, 2, 2));
        assert_eq!(nir[[2, 1, 1]], 12);
        assert!(matches!(stack.band("swir16"), Err(EoError::MissingBand(_))));
    }

    #[test]
    fn test_stack_rejects_inconsistent_metadata() {
        let data = Array4::<i32>::zeros((1, 2, 2, 2));
        let too_few_times = RasterStack::new(
            data.clone(),
            vec!["red".to_string()],
            vec![utc(2020, 1, 1)],
            grid(2, 2),
        );
        assert!(matches!(too_few_times, Err(EoError::InvalidStack(_))));

        let wrong_grid = RasterStack::new(
            data,
            vec!["red".to_string()],
            vec![utc(2020, 1, 1), utc(2020, 2, 1)],
            grid(3, 2),
        );
        assert!(matches!(wrong_grid, Err(EoError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_duplicate_band_names() {
        let data = Array4::<i32>::zeros((2, 1, 1, 1));
        let result = RasterStack::new(
            data,
            vec!["red".to_string(), "red".to_string()],
            vec![utc(2020, 1, 1)],
            grid(1, 1),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_grid_resolution() {
        assert_eq!(grid(4, 4).resolution(), 30.0);
    }
}
