//! Trend estimation over an area summary (productivity trajectory).

use serde::Serialize;

use crate::core::temporal::{nan_median, AreaSummary};
use crate::types::{EoError, EoResult};

const DAYS_PER_YEAR: f64 = 365.25;

/// Linear fit of the summary against time in years
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendFit {
    /// Index units per year
    pub slope: f64,
    /// Value at the first valid period
    pub intercept: f64,
    /// Coefficient of determination (NaN for an OLS fit on a constant series)
    pub r_squared: f64,
    /// Number of periods used
    pub samples: usize,
}

/// (years since first valid period, value) for every period with a value
fn valid_points(summary: &AreaSummary) -> EoResult<Vec<(f64, f64)>> {
    let mut valid = summary.valid().peekable();
    let origin = match valid.peek() {
        Some((period, _)) => period.start,
        None => return Err(EoError::InsufficientData("area summary has no valid periods".to_string())),
    };

    let points: Vec<(f64, f64)> = valid
        .map(|(period, value)| {
            let days = (period.start - origin).num_days() as f64;
            (days / DAYS_PER_YEAR, value)
        })
        .collect();

    if points.len() < 2 {
        return Err(EoError::InsufficientData(format!(
            "trend needs at least two valid periods, found {}",
            points.len()
        )));
    }
    Ok(points)
}

/// Ordinary least squares slope, intercept and r²
pub fn linear_trend(summary: &AreaSummary) -> EoResult<TrendFit> {
    let points = valid_points(summary)?;
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for (x, y) in &points {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }

    if sxx == 0.0 {
        return Err(EoError::InsufficientData(
            "all valid periods share the same start date".to_string(),
        ));
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let r_squared = if syy == 0.0 { f64::NAN } else { (sxy * sxy) / (sxx * syy) };

    log::debug!(
        "Linear trend over {} periods: slope {:.5}/yr, r² {:.3}",
        points.len(),
        slope,
        r_squared
    );

    Ok(TrendFit {
        slope,
        intercept,
        r_squared,
        samples: points.len(),
    })
}

/// Theil-Sen estimator: median of all pairwise slopes
pub fn sens_slope(summary: &AreaSummary) -> EoResult<TrendFit> {
    let points = valid_points(summary)?;

    let mut slopes = Vec::with_capacity(points.len() * (points.len() - 1) / 2);
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            let dx = points[j].0 - points[i].0;
            if dx != 0.0 {
                slopes.push((points[j].1 - points[i].1) / dx);
            }
        }
    }
    if slopes.is_empty() {
        return Err(EoError::InsufficientData(
            "all valid periods share the same start date".to_string(),
        ));
    }

    let slope = nan_median(&mut slopes);
    let mut intercepts: Vec<f64> = points.iter().map(|(x, y)| y - slope * x).collect();
    let intercept = nan_median(&mut intercepts);

    Ok(TrendFit {
        slope,
        intercept,
        r_squared: f64::NAN,
        samples: points.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::temporal::{Grouping, Period};
    use approx::assert_abs_diff_eq;
    use chrono::NaiveDate;

    fn yearly(values: &[f64]) -> AreaSummary {
        let g = Grouping::AnchoredQuarter { start_month: 2 };
        let periods: Vec<Period> = (0..values.len())
            .map(|i| g.period_of(NaiveDate::from_ymd_opt(2015 + i as i32, 2, 1).unwrap()).unwrap())
            .collect();
        AreaSummary {
            periods,
            values: values.to_vec(),
        }
    }

    #[test]
    fn test_linear_trend_on_straight_line() {
        let summary = yearly(&[0.30, 0.31, 0.32, 0.33, 0.34]);
        let fit = linear_trend(&summary).unwrap();
        // years are 365 or 366 days, so the slope is only approximately 0.01
        assert_abs_diff_eq!(fit.slope, 0.01, epsilon = 1e-4);
        assert_abs_diff_eq!(fit.intercept, 0.30, epsilon = 1e-3);
        assert!(fit.r_squared > 0.999);
        assert_eq!(fit.samples, 5);
    }

    #[test]
    fn test_missing_periods_are_skipped() {
        let summary = yearly(&[f64::NAN, 0.5, f64::NAN, 0.4]);
        let fit = linear_trend(&summary).unwrap();
        assert_eq!(fit.samples, 2);
        assert!(fit.slope < 0.0);
    }

    #[test]
    fn test_insufficient_data() {
        assert!(matches!(
            linear_trend(&yearly(&[0.2, f64::NAN])),
            Err(EoError::InsufficientData(_))
        ));
        assert!(sens_slope(&yearly(&[f64::NAN, f64::NAN])).is_err());
    }

    #[test]
    fn test_sens_slope_resists_outlier() {
        let summary = yearly(&[0.30, 0.31, 0.90, 0.33, 0.34, 0.35]);
        let robust = sens_slope(&summary).unwrap();
        assert_abs_diff_eq!(robust.slope, 0.01, epsilon = 2e-3);
        assert_eq!(robust.samples, 6);
    }

    #[test]
    fn test_sens_slope_two_points() {
        let fit = sens_slope(&yearly(&[0.2, 0.4])).unwrap();
        let years = 365.0 / DAYS_PER_YEAR;
        assert_abs_diff_eq!(fit.slope, 0.2 / years, epsilon = 1e-12);
        assert_abs_diff_eq!(fit.intercept, 0.2, epsilon = 1e-12);
        assert!(fit.r_squared.is_nan());
    }

    #[test]
    fn test_constant_series() {
        let fit = linear_trend(&yearly(&[0.5, 0.5, 0.5])).unwrap();
        assert_eq!(fit.slope, 0.0);
        assert!(fit.r_squared.is_nan());
    }
}
