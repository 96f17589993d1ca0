use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::{SensorConfig, SensorRegistry};
use crate::core::index::IndexCalculator;
use crate::core::quality_mask::{apply_mask, blank_cloudy_scenes, masked_fraction, QualityMaskBuilder};
use crate::core::temporal::{AreaSummary, Grouping, PeriodAggregate, Statistic, TemporalAggregator};
use crate::core::trend::{linear_trend, sens_slope, TrendFit};
use crate::types::{EoError, EoResult, IndexCube, MaskCube, RasterStack};

/// Pipeline parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    /// Sensor registry key
    pub sensor: String,
    pub grouping: Grouping,
    pub statistic: Statistic,
    /// Treat scenes with a larger masked fraction as having no valid pixel
    pub max_masked_fraction: Option<f64>,
    /// For anchored quarters, report only the periods starting in the anchor month
    pub retain_anchor_only: bool,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            sensor: "landsat-c2-l2".to_string(),
            grouping: Grouping::Monthly,
            statistic: Statistic::Max,
            max_masked_fraction: None,
            retain_anchor_only: true,
        }
    }
}

impl PipelineParams {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> EoResult<Self> {
        log::info!("Reading pipeline parameters: {}", path.as_ref().display());
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn validate(&self) -> EoResult<()> {
        self.grouping.validate()?;
        if let Some(fraction) = self.max_masked_fraction {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(EoError::InvalidConfig(format!(
                    "max_masked_fraction must be within [0, 1], got {}",
                    fraction
                )));
            }
        }
        Ok(())
    }
}

/// Final products of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub period_aggregate: PeriodAggregate,
    pub area_summary: AreaSummary,
    /// Masked fraction of every input scene, in input order
    pub scene_masked_fraction: Vec<f64>,
}

impl PipelineOutput {
    pub fn linear_trend(&self) -> EoResult<TrendFit> {
        linear_trend(&self.area_summary)
    }

    pub fn sens_slope(&self) -> EoResult<TrendFit> {
        sens_slope(&self.area_summary)
    }
}

/// Mask → index → period aggregate → area summary
#[derive(Debug, Clone)]
pub struct VegetationPipeline {
    sensor: SensorConfig,
    params: PipelineParams,
    mask_builder: QualityMaskBuilder,
    index_calculator: IndexCalculator,
    aggregator: TemporalAggregator,
}

impl VegetationPipeline {
    /// Validate configuration up front; no pixel is touched on failure
    pub fn new(sensor: SensorConfig, params: PipelineParams) -> EoResult<Self> {
        sensor.validate()?;
        params.validate()?;
        if params.sensor != sensor.collection {
            log::warn!(
                "Pipeline parameters name sensor '{}' but '{}' was supplied",
                params.sensor,
                sensor.collection
            );
        }

        Ok(Self {
            mask_builder: QualityMaskBuilder::from_sensor(&sensor)?,
            index_calculator: IndexCalculator::from_sensor(&sensor)?,
            aggregator: TemporalAggregator::new(params.grouping, params.statistic)?,
            sensor,
            params,
        })
    }

    /// Resolve `params.sensor` in the registry
    pub fn from_registry(registry: &SensorRegistry, params: PipelineParams) -> EoResult<Self> {
        let sensor = registry.get(&params.sensor)?.clone();
        Self::new(sensor, params)
    }

    pub fn sensor(&self) -> &SensorConfig {
        &self.sensor
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    pub fn run(&self, stack: &RasterStack) -> EoResult<PipelineOutput> {
        log::info!(
            "Running vegetation pipeline for {} on {:?} stack",
            self.sensor.collection,
            stack.dim()
        );
        self.check_bands(stack)?;

        let quality = stack.band_cube(&self.sensor.bands.quality)?;
        let mask = self.mask_builder.build(&quality);
        let index = self.index_calculator.compute_stack(stack, &self.sensor)?;
        let masked = self.prepare_scenes(&index, &mask)?;

        let aggregate = self.aggregator.aggregate(&masked)?;
        let period_aggregate = self.select_periods(aggregate);
        let area_summary = period_aggregate.area_summary();

        Ok(self.finish(period_aggregate, area_summary, &mask))
    }

    /// Same result as [`run`](Self::run), computed with Rayon
    #[cfg(feature = "parallel")]
    pub fn run_parallel(&self, stack: &RasterStack) -> EoResult<PipelineOutput> {
        log::info!(
            "Running parallel vegetation pipeline for {} on {:?} stack",
            self.sensor.collection,
            stack.dim()
        );
        self.check_bands(stack)?;

        let quality = stack.band_cube(&self.sensor.bands.quality)?;
        let mask = self.mask_builder.build_parallel(&quality);

        let nir = stack.band(&self.sensor.bands.nir)?;
        let red = stack.band(&self.sensor.bands.red)?;
        let blue = match (self.sensor.formula.needs_blue(), &self.sensor.bands.blue) {
            (true, Some(name)) => Some(stack.band(name)?),
            _ => None,
        };
        let index = quality.with_data(self.index_calculator.compute_parallel(nir, red, blue)?);
        let masked = self.prepare_scenes(&index, &mask)?;

        let aggregate = self.aggregator.aggregate_parallel(&masked)?;
        let period_aggregate = self.select_periods(aggregate);
        let area_summary = period_aggregate.area_summary_parallel();

        Ok(self.finish(period_aggregate, area_summary, &mask))
    }

    fn check_bands(&self, stack: &RasterStack) -> EoResult<()> {
        let bands = &self.sensor.bands;
        let mut required = vec![&bands.nir, &bands.red, &bands.quality];
        if self.sensor.formula.needs_blue() {
            if let Some(blue) = &bands.blue {
                required.push(blue);
            }
        }
        for name in required {
            if !stack.has_band(name) {
                return Err(EoError::MissingBand(name.clone()));
            }
        }
        Ok(())
    }

    fn prepare_scenes(&self, index: &IndexCube, mask: &MaskCube) -> EoResult<IndexCube> {
        let masked = apply_mask(index, mask)?;
        match self.params.max_masked_fraction {
            Some(fraction) => blank_cloudy_scenes(&masked, mask, fraction),
            None => Ok(masked),
        }
    }

    fn select_periods(&self, aggregate: PeriodAggregate) -> PeriodAggregate {
        match self.params.grouping {
            Grouping::AnchoredQuarter { start_month } if self.params.retain_anchor_only => {
                aggregate.retain_anchor(start_month)
            }
            _ => aggregate,
        }
    }

    fn finish(
        &self,
        period_aggregate: PeriodAggregate,
        area_summary: AreaSummary,
        mask: &MaskCube,
    ) -> PipelineOutput {
        log::info!(
            "Pipeline complete: {} periods, {} with a value",
            area_summary.len(),
            area_summary.valid().count()
        );
        PipelineOutput {
            period_aggregate,
            area_summary,
            scene_masked_fraction: masked_fraction(mask),
        }
    }
}
