//! evitrend: cloud masking, vegetation index and temporal aggregation for
//! land productivity trends (SDG indicator 15.3.1).
//!
//! The crate covers the numeric core of cloud-native Earth observation
//! workflows: turn bit-encoded quality codes into an exclusion mask, compute
//! EVI2 or EVI from scaled reflectance, reduce irregular scenes into calendar
//! periods and summarise each period over the area of interest. Loading the
//! rasters (STAC search, COG reads) is left to the caller.

pub mod types;
pub mod config;
pub mod core;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    RasterStack, TimeCube, MaskCube, IndexCube, GridSpec, GeoTransform, CoordinateSystem,
    EoError, EoResult, RawSample, IndexValue
};
pub use config::{SensorConfig, SensorRegistry, IndexFormula, BandNames, ReflectanceScaling};
pub use crate::core::{
    QualityMaskBuilder, IndexCalculator, TemporalAggregator, Grouping, Statistic, Period,
    PeriodAggregate, AreaSummary, TrendFit, VegetationPipeline, PipelineParams, PipelineOutput
};
