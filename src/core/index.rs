use crate::config::{IndexFormula, ReflectanceScaling, SensorConfig};
use crate::types::{
    check_same_shape, EoError, EoResult, IndexCube, IndexValue, RasterStack, RawSample,
};
use ndarray::{Array3, ArrayView3, Zip};

/// EVI2 gain
const EVI2_G: f64 = 2.4;

// EVI coefficients from MODIS documentation
const EVI_G: f64 = 2.5;
const EVI_C1: f64 = 6.0;
const EVI_C2: f64 = 7.5;
const EVI_L: f64 = 1.0;

/// Vegetation index calculator over scaled reflectance bands
#[derive(Debug, Clone)]
pub struct IndexCalculator {
    formula: IndexFormula,
    scaling: ReflectanceScaling,
}

impl IndexCalculator {
    pub fn new(formula: IndexFormula, scaling: ReflectanceScaling) -> EoResult<Self> {
        scaling.validate()?;
        Ok(Self { formula, scaling })
    }

    pub fn from_sensor(sensor: &SensorConfig) -> EoResult<Self> {
        Self::new(sensor.formula, sensor.scaling.clone())
    }

    pub fn formula(&self) -> IndexFormula {
        self.formula
    }

    /// DN to reflectance; out-of-range values become NaN
    #[inline]
    pub fn scale_value(&self, raw: RawSample) -> IndexValue {
        let value = raw as f64 * self.scaling.scale_factor + self.scaling.offset;

        let above_floor = match self.scaling.lower_bound {
            Some(lower) => value >= lower,
            None => value > 0.0,
        };
        let below_ceiling = self.scaling.upper_bound.map_or(true, |upper| value <= upper);

        if above_floor && below_ceiling {
            value
        } else {
            IndexValue::NAN
        }
    }

    pub fn scale_band(&self, raw: ArrayView3<'_, RawSample>) -> Array3<IndexValue> {
        raw.mapv(|v| self.scale_value(v))
    }

    /// Two-band EVI on reflectances
    #[inline]
    pub fn evi2(nir: IndexValue, red: IndexValue) -> IndexValue {
        bounded_ratio(EVI2_G * (nir - red), nir + red + 1.0)
    }

    /// Three-band EVI on reflectances
    #[inline]
    pub fn evi(nir: IndexValue, red: IndexValue, blue: IndexValue) -> IndexValue {
        bounded_ratio(EVI_G * (nir - red), nir + EVI_C1 * red - EVI_C2 * blue + EVI_L)
    }

    /// Index for one pixel from raw DNs
    pub fn pixel(&self, nir: RawSample, red: RawSample, blue: Option<RawSample>) -> IndexValue {
        let nir = self.scale_value(nir);
        let red = self.scale_value(red);
        match (self.formula, blue) {
            (IndexFormula::Evi2, _) => Self::evi2(nir, red),
            (IndexFormula::Evi, Some(blue)) => Self::evi(nir, red, self.scale_value(blue)),
            (IndexFormula::Evi, None) => IndexValue::NAN,
        }
    }

    /// Index for whole (time, row, column) band arrays.
    ///
    /// Band shapes are checked before any pixel is computed.
    pub fn compute(
        &self,
        nir: ArrayView3<'_, RawSample>,
        red: ArrayView3<'_, RawSample>,
        blue: Option<ArrayView3<'_, RawSample>>,
    ) -> EoResult<Array3<IndexValue>> {
        self.check_inputs(&nir, &red, blue.as_ref())?;
        log::debug!("Computing {:?} for {:?} pixels", self.formula, nir.dim());

        let result = match (self.formula, blue) {
            (IndexFormula::Evi, Some(blue)) => Zip::from(&nir)
                .and(&red)
                .and(&blue)
                .map_collect(|&n, &r, &b| self.pixel(n, r, Some(b))),
            _ => Zip::from(&nir)
                .and(&red)
                .map_collect(|&n, &r| self.pixel(n, r, None)),
        };

        Ok(result)
    }

    /// Parallel index computation using Rayon
    #[cfg(feature = "parallel")]
    pub fn compute_parallel(
        &self,
        nir: ArrayView3<'_, RawSample>,
        red: ArrayView3<'_, RawSample>,
        blue: Option<ArrayView3<'_, RawSample>>,
    ) -> EoResult<Array3<IndexValue>> {
        self.check_inputs(&nir, &red, blue.as_ref())?;
        log::debug!("Computing {:?} in parallel for {:?} pixels", self.formula, nir.dim());

        let result = match (self.formula, blue) {
            (IndexFormula::Evi, Some(blue)) => Zip::from(&nir)
                .and(&red)
                .and(&blue)
                .par_map_collect(|&n, &r, &b| self.pixel(n, r, Some(b))),
            _ => Zip::from(&nir)
                .and(&red)
                .par_map_collect(|&n, &r| self.pixel(n, r, None)),
        };

        Ok(result)
    }

    /// Index cube for the sensor's bands of a stack
    pub fn compute_stack(&self, stack: &RasterStack, sensor: &SensorConfig) -> EoResult<IndexCube> {
        let nir = stack.band(&sensor.bands.nir)?;
        let red = stack.band(&sensor.bands.red)?;
        let blue = match (self.formula, &sensor.bands.blue) {
            (IndexFormula::Evi, Some(name)) => Some(stack.band(name)?),
            _ => None,
        };

        let values = self.compute(nir, red, blue)?;
        Ok(IndexCube {
            data: values,
            times: stack.times().to_vec(),
            grid: stack.grid().clone(),
        })
    }

    fn check_inputs(
        &self,
        nir: &ArrayView3<'_, RawSample>,
        red: &ArrayView3<'_, RawSample>,
        blue: Option<&ArrayView3<'_, RawSample>>,
    ) -> EoResult<()> {
        check_same_shape("red band", nir, red)?;
        match (self.formula, blue) {
            (IndexFormula::Evi, Some(blue)) => check_same_shape("blue band", nir, blue),
            (IndexFormula::Evi, None) => Err(EoError::InvalidConfig(
                "three-band EVI requires a blue band".to_string(),
            )),
            (IndexFormula::Evi2, _) => Ok(()),
        }
    }
}

/// numerator / denominator, NaN on a zero denominator or a result outside [-1, 1]
#[inline]
fn bounded_ratio(numerator: IndexValue, denominator: IndexValue) -> IndexValue {
    if denominator == 0.0 {
        return IndexValue::NAN;
    }
    let value = numerator / denominator;
    if (-1.0..=1.0).contains(&value) {
        value
    } else {
        IndexValue::NAN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn hls_scaling() -> ReflectanceScaling {
        ReflectanceScaling::default()
    }

    #[test]
    fn test_evi2_reference_value() {
        let calc = IndexCalculator::new(IndexFormula::Evi2, hls_scaling()).unwrap();
        let value = calc.pixel(3000, 1000, None);
        assert_abs_diff_eq!(value, 2.4 * 0.2 / 1.4, epsilon = 1e-12);
        assert_abs_diff_eq!(value, 0.342857, epsilon = 1e-6);
    }

    #[test]
    fn test_equal_bands_give_exact_zero() {
        let calc = IndexCalculator::new(IndexFormula::Evi2, hls_scaling()).unwrap();
        for dn in [1, 250, 1000, 4321, 10000] {
            assert_eq!(calc.pixel(dn, dn, None), 0.0);
        }

        let calc = IndexCalculator::new(IndexFormula::Evi, hls_scaling()).unwrap();
        assert_eq!(calc.pixel(2000, 2000, Some(1)), 0.0);
    }

    #[test]
    fn test_three_band_reference_value() {
        let calc = IndexCalculator::new(IndexFormula::Evi, hls_scaling()).unwrap();
        let value = calc.pixel(4000, 800, Some(400));
        let expected = 2.5 * (0.4 - 0.08) / (0.4 + 6.0 * 0.08 - 7.5 * 0.04 + 1.0);
        assert_abs_diff_eq!(value, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_non_positive_reflectance_is_no_value() {
        let calc = IndexCalculator::new(IndexFormula::Evi2, hls_scaling()).unwrap();
        assert!(calc.scale_value(0).is_nan());
        assert!(calc.scale_value(-9999).is_nan());
        assert!(calc.pixel(3000, 0, None).is_nan());
        assert!(calc.pixel(-9999, 1000, None).is_nan());
    }

    #[test]
    fn test_lower_and_upper_bounds() {
        let scaling = ReflectanceScaling {
            scale_factor: 0.0000275,
            offset: -0.2,
            lower_bound: Some(-0.01),
            upper_bound: Some(1.0),
        };
        let calc = IndexCalculator::new(IndexFormula::Evi2, scaling).unwrap();

        // 7273 * 0.0000275 - 0.2 = 0.0000075
        assert!(calc.scale_value(7273) > 0.0);
        // slightly negative but above the clip
        assert!(!calc.scale_value(7000).is_nan());
        // below the clip
        assert!(calc.scale_value(6000).is_nan());
        // above 1.0 reflectance
        assert!(calc.scale_value(50000).is_nan());
    }

    #[test]
    fn test_zero_denominator_is_no_value() {
        assert!(IndexCalculator::evi2(-0.5, -0.5).is_nan());
        // nir + 6*red - 7.5*blue + 1 == 0
        assert!(IndexCalculator::evi(0.5, 0.21875, 0.375).is_nan());
    }

    #[test]
    fn test_nan_propagates() {
        assert!(IndexCalculator::evi2(f64::NAN, 0.1).is_nan());
        assert!(IndexCalculator::evi(0.3, 0.1, f64::NAN).is_nan());
    }

    #[test]
    fn test_output_bounded_for_valid_reflectances() {
        // deterministic xorshift sweep
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % 10_000) as RawSample + 1
        };

        let evi2 = IndexCalculator::new(IndexFormula::Evi2, hls_scaling()).unwrap();
        let evi = IndexCalculator::new(IndexFormula::Evi, hls_scaling()).unwrap();
        for _ in 0..20_000 {
            let (n, r, b) = (next(), next(), next());
            for value in [evi2.pixel(n, r, None), evi.pixel(n, r, Some(b))] {
                assert!(value.is_nan() || (-1.0..=1.0).contains(&value), "{} {} {} -> {}", n, r, b, value);
            }
        }
    }

    #[test]
    fn test_compute_shape_mismatch() {
        let calc = IndexCalculator::new(IndexFormula::Evi2, hls_scaling()).unwrap();
        let nir = Array3::<i32>::from_elem((2, 3, 3), 3000);
        let red = Array3::<i32>::from_elem((2, 3, 4), 1000);
        let result = calc.compute(nir.view(), red.view(), None);
        assert!(matches!(result, Err(EoError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_three_band_requires_blue() {
        let calc = IndexCalculator::new(IndexFormula::Evi, hls_scaling()).unwrap();
        let band = Array3::<i32>::from_elem((1, 2, 2), 3000);
        assert!(matches!(
            calc.compute(band.view(), band.view(), None),
            Err(EoError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invalid_scaling_rejected() {
        let scaling = ReflectanceScaling {
            scale_factor: f64::NAN,
            ..ReflectanceScaling::default()
        };
        assert!(IndexCalculator::new(IndexFormula::Evi2, scaling).is_err());
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_parallel_matches_sequential() {
        let calc = IndexCalculator::new(IndexFormula::Evi, hls_scaling()).unwrap();
        let nir = Array3::from_shape_fn((3, 20, 20), |(t, r, c)| (t * 997 + r * 131 + c * 17) as i32 % 9000);
        let red = Array3::from_shape_fn((3, 20, 20), |(t, r, c)| (t * 31 + r * 7 + c * 101) as i32 % 4000);
        let blue = Array3::from_shape_fn((3, 20, 20), |(t, r, c)| (t * 3 + r * 53 + c * 11) as i32 % 2000);

        let seq = calc.compute(nir.view(), red.view(), Some(blue.view())).unwrap();
        let par = calc.compute_parallel(nir.view(), red.view(), Some(blue.view())).unwrap();

        assert_eq!(seq.len(), par.len());
        for (a, b) in seq.iter().zip(par.iter()) {
            assert!(a.to_bits() == b.to_bits());
        }
    }
}
