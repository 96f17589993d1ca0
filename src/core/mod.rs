//! Core processing modules

pub mod quality_mask;
pub mod index;
pub mod temporal;
pub mod trend;
pub mod pipeline;

// Re-export main types
pub use quality_mask::{QualityMaskBuilder, apply_mask, masked_fraction, drop_cloudy_scenes, blank_cloudy_scenes};
pub use index::IndexCalculator;
pub use temporal::{
    TemporalAggregator, Grouping, Statistic, Period, PeriodAggregate, AreaSummary,
    nan_max, nan_mean, nan_median
};
pub use trend::{TrendFit, linear_trend, sens_slope};
pub use pipeline::{VegetationPipeline, PipelineParams, PipelineOutput};
