//! Python bindings for notebook callers

use chrono::{DateTime, TimeZone, Utc};
use numpy::{PyReadonlyArray3, ToPyArray};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::config::SensorRegistry;
use crate::core::{nan_mean, Grouping, IndexCalculator, QualityMaskBuilder, Statistic, TemporalAggregator};
use crate::types::{EoError, GridSpec, TimeCube};

fn to_py_err(e: EoError) -> PyErr {
    match e {
        EoError::InvalidConfig(_) | EoError::UnknownSensor(_) | EoError::ShapeMismatch { .. } => {
            PyErr::new::<PyValueError, _>(format!("{}", e))
        }
        other => PyErr::new::<PyRuntimeError, _>(format!("{}", other)),
    }
}

fn parse_grouping(grouping: &str, start_month: u32) -> PyResult<Grouping> {
    match grouping.to_lowercase().as_str() {
        "monthly" | "ms" => Ok(Grouping::Monthly),
        "quarterly" | "qs" => Ok(Grouping::AnchoredQuarter { start_month }),
        _ => Err(PyValueError::new_err(format!("Invalid grouping: {}", grouping))),
    }
}

fn parse_statistic(statistic: &str) -> PyResult<Statistic> {
    match statistic.to_lowercase().as_str() {
        "max" => Ok(Statistic::Max),
        "median" => Ok(Statistic::Median),
        _ => Err(PyValueError::new_err(format!("Invalid statistic: {}", statistic))),
    }
}

/// Boolean exclusion mask from quality codes
#[pyfunction]
fn quality_mask(
    py: Python,
    codes: PyReadonlyArray3<i32>,
    reject_bitmask: i32,
    nodata: i32,
) -> PyResult<PyObject> {
    let builder = QualityMaskBuilder::new(reject_bitmask, nodata);
    let mask = builder.build_mask(codes.as_array());
    Ok(mask.to_pyarray(py).into())
}

/// EVI2 / EVI for a built-in sensor from raw DN arrays (time, row, column)
#[pyfunction]
#[pyo3(signature = (sensor, nir, red, blue=None))]
fn vegetation_index(
    py: Python,
    sensor: String,
    nir: PyReadonlyArray3<i32>,
    red: PyReadonlyArray3<i32>,
    blue: Option<PyReadonlyArray3<i32>>,
) -> PyResult<PyObject> {
    let registry = SensorRegistry::builtin();
    let config = registry.get(&sensor).map_err(to_py_err)?;
    let calculator = IndexCalculator::from_sensor(config).map_err(to_py_err)?;

    let blue_view = blue.as_ref().map(|b| b.as_array());
    let index = calculator
        .compute(nir.as_array(), red.as_array(), blue_view)
        .map_err(to_py_err)?;
    Ok(index.to_pyarray(py).into())
}

/// Period aggregate of index values; timestamps are Unix seconds (UTC)
#[pyfunction]
#[pyo3(signature = (values, timestamps, grouping="monthly", start_month=1, statistic="max", anchor_only=true))]
fn period_aggregate(
    py: Python,
    values: PyReadonlyArray3<f64>,
    timestamps: Vec<i64>,
    grouping: &str,
    start_month: u32,
    statistic: &str,
    anchor_only: bool,
) -> PyResult<PyObject> {
    let grouping = parse_grouping(grouping, start_month)?;
    let statistic = parse_statistic(statistic)?;

    let times = timestamps
        .iter()
        .map(|&s| {
            Utc.timestamp_opt(s, 0)
                .single()
                .ok_or_else(|| PyValueError::new_err(format!("Invalid timestamp: {}", s)))
        })
        .collect::<PyResult<Vec<DateTime<Utc>>>>()?;

    let data = values.as_array().to_owned();
    let (_, rows, cols) = data.dim();
    let cube = TimeCube::new(data, times, GridSpec::pixel_grid(rows, cols)).map_err(to_py_err)?;

    let aggregator = TemporalAggregator::new(grouping, statistic).map_err(to_py_err)?;
    let mut aggregate = aggregator.aggregate(&cube).map_err(to_py_err)?;
    if let (Grouping::AnchoredQuarter { start_month }, true) = (grouping, anchor_only) {
        aggregate = aggregate.retain_anchor(start_month);
    }
    let summary = aggregate.area_summary();

    let result = PyDict::new(py);
    let periods: Vec<String> = aggregate.periods.iter().map(|p| p.start.to_string()).collect();
    result.set_item("periods", periods)?;
    result.set_item("data", aggregate.values.to_pyarray(py))?;
    result.set_item("area_summary", summary.values)?;
    Ok(result.into())
}

/// NaN-ignoring spatial mean per leading-axis slice
#[pyfunction]
fn area_mean(values: PyReadonlyArray3<f64>) -> Vec<f64> {
    values
        .as_array()
        .outer_iter()
        .map(|raster| nan_mean(raster.iter().copied()))
        .collect()
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(quality_mask, m)?)?;
    m.add_function(wrap_pyfunction!(vegetation_index, m)?)?;
    m.add_function(wrap_pyfunction!(period_aggregate, m)?)?;
    m.add_function(wrap_pyfunction!(area_mean, m)?)?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
