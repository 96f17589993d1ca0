//! Calendar-period aggregation of irregular scene time series.
//!
//! Scenes are binned into contiguous calendar periods (months, or quarters
//! anchored at a chosen month) spanning the first to the last acquisition.
//! Periods without any scene are kept and hold NaN.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use ndarray::{Array3, ArrayView2, ArrayView3, ArrayViewMut2, Axis, Zip};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::types::{EoError, EoResult, GridSpec, IndexCube, IndexValue};

/// How scene timestamps are bucketed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Grouping {
    /// Calendar month start
    #[default]
    Monthly,
    /// Three-month bins whose start months are congruent to `start_month` modulo 3
    AnchoredQuarter { start_month: u32 },
}

impl Grouping {
    pub fn validate(&self) -> EoResult<()> {
        match self {
            Grouping::Monthly => Ok(()),
            Grouping::AnchoredQuarter { start_month } if (1..=12).contains(start_month) => Ok(()),
            Grouping::AnchoredQuarter { start_month } => Err(EoError::InvalidConfig(format!(
                "quarter anchor month must be within 1..=12, got {}",
                start_month
            ))),
        }
    }

    /// Length of one period in months
    pub fn months(&self) -> u32 {
        match self {
            Grouping::Monthly => 1,
            Grouping::AnchoredQuarter { .. } => 3,
        }
    }

    /// Period containing `date`
    pub fn period_of(&self, date: NaiveDate) -> EoResult<Period> {
        let offset = match self {
            Grouping::Monthly => 0,
            Grouping::AnchoredQuarter { start_month } => {
                (date.month() as i32 - *start_month as i32).rem_euclid(3)
            }
        };
        let month_start = first_of_month(date.year(), date.month())?;
        let start = shift_months(month_start, -offset)?;
        Period::new(start, self.months())
    }
}

/// Reduction applied over the scenes of one period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    #[default]
    Max,
    Median,
}

impl Statistic {
    /// Reduce `values`, ignoring NaN. Reorders the buffer.
    pub fn reduce<F: Float>(&self, values: &mut [F]) -> F {
        match self {
            Statistic::Max => nan_max(values.iter().copied()),
            Statistic::Median => nan_median(values),
        }
    }
}

/// Half-open calendar interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    fn new(start: NaiveDate, months: u32) -> EoResult<Self> {
        Ok(Self {
            start,
            end: shift_months(start, months as i32)?,
        })
    }

    pub fn start_month(&self) -> u32 {
        self.start.month()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start.format("%Y-%m"), self.end.format("%Y-%m"))
    }
}

fn first_of_month(year: i32, month: u32) -> EoResult<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| EoError::InvalidStack(format!("date {}-{:02} out of range", year, month)))
}

fn shift_months(date: NaiveDate, months: i32) -> EoResult<NaiveDate> {
    let total = date.year() * 12 + date.month0() as i32 + months;
    first_of_month(total.div_euclid(12), total.rem_euclid(12) as u32 + 1)
}

fn months_between(from: NaiveDate, to: NaiveDate) -> i32 {
    (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32
}

/// Maximum ignoring NaN; NaN when nothing is valid
pub fn nan_max<F: Float, I: IntoIterator<Item = F>>(values: I) -> F {
    values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold(None, |acc: Option<F>, v| Some(acc.map_or(v, |m| m.max(v))))
        .unwrap_or_else(F::nan)
}

/// Median ignoring NaN; the mean of the two middle values for even counts
pub fn nan_median<F: Float>(values: &mut [F]) -> F {
    let mut valid = 0;
    for i in 0..values.len() {
        if !values[i].is_nan() {
            values.swap(valid, i);
            valid += 1;
        }
    }
    let valid = &mut values[..valid];
    if valid.is_empty() {
        return F::nan();
    }

    valid.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = valid.len() / 2;
    if valid.len() % 2 == 1 {
        valid[mid]
    } else {
        let two = F::one() + F::one();
        (valid[mid - 1] + valid[mid]) / two
    }
}

/// Arithmetic mean ignoring NaN, summed in iteration order
pub fn nan_mean<F: Float, I: IntoIterator<Item = F>>(values: I) -> F {
    let (sum, count) = values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold((F::zero(), 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        F::nan()
    } else {
        sum / F::from(count).unwrap_or_else(F::nan)
    }
}

/// One reduced raster per calendar period
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodAggregate {
    pub periods: Vec<Period>,
    /// (period, row, column)
    pub values: Array3<IndexValue>,
    pub grid: GridSpec,
    pub grouping: Grouping,
    pub statistic: Statistic,
}

impl PeriodAggregate {
    pub fn len(&self) -> usize {
        self.periods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    pub fn raster(&self, index: usize) -> Option<ArrayView2<'_, IndexValue>> {
        (index < self.periods.len()).then(|| self.values.index_axis(Axis(0), index))
    }

    /// Raster of the period containing `date`
    pub fn raster_at(&self, date: NaiveDate) -> Option<ArrayView2<'_, IndexValue>> {
        let index = self.periods.iter().position(|p| p.contains(date))?;
        self.raster(index)
    }

    /// Keep only periods starting in `start_month`.
    ///
    /// With anchored quarters the other three quarter-groups per year are
    /// resampling artifacts and are dropped here.
    pub fn retain_anchor(&self, start_month: u32) -> PeriodAggregate {
        let keep: Vec<usize> = self
            .periods
            .iter()
            .enumerate()
            .filter(|(_, p)| p.start_month() == start_month)
            .map(|(i, _)| i)
            .collect();

        log::debug!(
            "Retaining {} of {} periods starting in month {}",
            keep.len(),
            self.periods.len(),
            start_month
        );

        PeriodAggregate {
            periods: keep.iter().map(|&i| self.periods[i]).collect(),
            values: self.values.select(Axis(0), &keep),
            grid: self.grid.clone(),
            grouping: self.grouping,
            statistic: self.statistic,
        }
    }

    /// NaN-ignoring spatial mean per period
    pub fn area_summary(&self) -> AreaSummary {
        let values = self
            .values
            .axis_iter(Axis(0))
            .map(|raster| nan_mean(raster.iter().copied()))
            .collect();
        AreaSummary {
            periods: self.periods.clone(),
            values,
        }
    }

    /// Parallel spatial mean, one task per period
    #[cfg(feature = "parallel")]
    pub fn area_summary_parallel(&self) -> AreaSummary {
        use rayon::prelude::*;

        let values = self
            .values
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|raster| nan_mean(raster.iter().copied()))
            .collect();
        AreaSummary {
            periods: self.periods.clone(),
            values,
        }
    }
}

/// One scalar per period; NaN where the whole area had no value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AreaSummary {
    pub periods: Vec<Period>,
    pub values: Vec<IndexValue>,
}

impl AreaSummary {
    pub fn len(&self) -> usize {
        self.periods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Period, IndexValue)> + '_ {
        self.periods.iter().zip(self.values.iter().copied())
    }

    /// Periods that carry a value
    pub fn valid(&self) -> impl Iterator<Item = (&Period, IndexValue)> + '_ {
        self.iter().filter(|(_, v)| !v.is_nan())
    }
}

/// Reduces a scene cube into calendar periods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TemporalAggregator {
    grouping: Grouping,
    statistic: Statistic,
}

impl TemporalAggregator {
    pub fn new(grouping: Grouping, statistic: Statistic) -> EoResult<Self> {
        grouping.validate()?;
        Ok(Self { grouping, statistic })
    }

    pub fn monthly_max() -> Self {
        Self {
            grouping: Grouping::Monthly,
            statistic: Statistic::Max,
        }
    }

    pub fn grouping(&self) -> Grouping {
        self.grouping
    }

    pub fn statistic(&self) -> Statistic {
        self.statistic
    }

    /// Contiguous periods from the first to the last timestamp, with the scene
    /// indices falling into each
    pub fn group_times(&self, times: &[DateTime<Utc>]) -> EoResult<(Vec<Period>, Vec<Vec<usize>>)> {
        let dates: Vec<NaiveDate> = times.iter().map(|t| t.date_naive()).collect();
        let (first, last) = match (dates.iter().min(), dates.iter().max()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Ok((Vec::new(), Vec::new())),
        };

        let first = self.grouping.period_of(first)?;
        let last = self.grouping.period_of(last)?;
        let step = self.grouping.months() as i32;
        let count = (months_between(first.start, last.start) / step + 1) as usize;

        let mut periods = Vec::with_capacity(count);
        for i in 0..count {
            periods.push(Period::new(shift_months(first.start, i as i32 * step)?, step as u32)?);
        }

        let mut groups = vec![Vec::new(); count];
        for (t, date) in dates.iter().enumerate() {
            let period = self.grouping.period_of(*date)?;
            let index = (months_between(first.start, period.start) / step) as usize;
            groups[index].push(t);
        }

        Ok((periods, groups))
    }

    pub fn aggregate(&self, cube: &IndexCube) -> EoResult<PeriodAggregate> {
        let (periods, groups) = self.prepare(cube)?;
        let (_, rows, cols) = cube.dim();
        let mut values = Array3::from_elem((periods.len(), rows, cols), IndexValue::NAN);

        for (out, group) in values.axis_iter_mut(Axis(0)).zip(groups.iter()) {
            self.reduce_group(cube.data.view(), group, out);
        }

        Ok(self.finish(periods, values, cube))
    }

    /// Parallel aggregation, one task per period
    #[cfg(feature = "parallel")]
    pub fn aggregate_parallel(&self, cube: &IndexCube) -> EoResult<PeriodAggregate> {
        use rayon::prelude::*;

        let (periods, groups) = self.prepare(cube)?;
        let (_, rows, cols) = cube.dim();
        let mut values = Array3::from_elem((periods.len(), rows, cols), IndexValue::NAN);
        let data = cube.data.view();

        values
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(p, out)| self.reduce_group(data, &groups[p], out));

        Ok(self.finish(periods, values, cube))
    }

    fn prepare(&self, cube: &IndexCube) -> EoResult<(Vec<Period>, Vec<Vec<usize>>)> {
        self.grouping.validate()?;
        log::info!(
            "Aggregating {} scenes with {:?} / {:?}",
            cube.times.len(),
            self.grouping,
            self.statistic
        );
        let (periods, groups) = self.group_times(&cube.times)?;
        if periods.is_empty() {
            log::warn!("No scenes to aggregate");
        }
        let empty = groups.iter().filter(|g| g.is_empty()).count();
        if empty > 0 {
            log::debug!("{} of {} periods have no scenes", empty, periods.len());
        }
        Ok((periods, groups))
    }

    fn reduce_group(
        &self,
        data: ArrayView3<'_, IndexValue>,
        group: &[usize],
        out: ArrayViewMut2<'_, IndexValue>,
    ) {
        if group.is_empty() {
            return;
        }
        let mut buffer = Vec::with_capacity(group.len());
        Zip::indexed(out).for_each(|(r, c), value| {
            buffer.clear();
            buffer.extend(group.iter().map(|&t| data[[t, r, c]]));
            *value = self.statistic.reduce(&mut buffer);
        });
    }

    fn finish(&self, periods: Vec<Period>, values: Array3<IndexValue>, cube: &IndexCube) -> PeriodAggregate {
        log::info!("Aggregated into {} periods", periods.len());
        PeriodAggregate {
            periods,
            values,
            grid: cube.grid.clone(),
            grouping: self.grouping,
            statistic: self.statistic,
        }
    }
}
