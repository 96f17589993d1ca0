use crate::config::SensorConfig;
use crate::types::{check_same_shape, EoError, EoResult, IndexValue, MaskCube, RawSample, TimeCube};
use ndarray::{Array3, ArrayView3, Axis, Zip};

/// Builds the per-pixel exclusion mask from bit-encoded quality codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityMaskBuilder {
    reject_bitmask: RawSample,
    nodata: RawSample,
}

impl QualityMaskBuilder {
    pub fn new(reject_bitmask: RawSample, nodata: RawSample) -> Self {
        Self { reject_bitmask, nodata }
    }

    /// Builder for a sensor's reject flags and no-data code
    pub fn from_sensor(sensor: &SensorConfig) -> EoResult<Self> {
        Ok(Self::new(sensor.reject_bitmask()?, sensor.nodata))
    }

    pub fn reject_bitmask(&self) -> RawSample {
        self.reject_bitmask
    }

    pub fn nodata(&self) -> RawSample {
        self.nodata
    }

    /// `true` when any reject bit is set or the code is the no-data sentinel
    #[inline]
    pub fn is_masked(&self, code: RawSample) -> bool {
        (code & self.reject_bitmask) != 0 || code == self.nodata
    }

    pub fn build_mask(&self, codes: ArrayView3<'_, RawSample>) -> Array3<bool> {
        let builder = *self;
        codes.mapv(|code| builder.is_masked(code))
    }

    /// Mask cube with the same timestamps and grid as `codes`
    pub fn build(&self, codes: &TimeCube<RawSample>) -> MaskCube {
        log::debug!(
            "Building quality mask: reject bitmask {:#b}, no-data {}",
            self.reject_bitmask, self.nodata
        );
        let mask = self.build_mask(codes.data.view());
        warn_if_fully_masked(&mask);
        codes.with_data(mask)
    }

    /// Parallel mask construction using Rayon
    #[cfg(feature = "parallel")]
    pub fn build_parallel(&self, codes: &TimeCube<RawSample>) -> MaskCube {
        let builder = *self;
        let mask = Zip::from(&codes.data).par_map_collect(|&code| builder.is_masked(code));
        warn_if_fully_masked(&mask);
        codes.with_data(mask)
    }
}

fn warn_if_fully_masked(mask: &Array3<bool>) {
    if !mask.is_empty() && mask.iter().all(|&m| m) {
        log::warn!("Every pixel of every scene is masked");
    }
}

fn check_alignment<T>(context: &str, values: &TimeCube<T>, mask: &MaskCube) -> EoResult<()> {
    check_same_shape(context, &values.data.view(), &mask.data.view())?;
    if !values.is_aligned_with(mask) {
        return Err(EoError::ShapeMismatch {
            context: context.to_string(),
            expected: "mask with the same timestamps and grid as the values".to_string(),
            found: "different acquisition times or grid".to_string(),
        });
    }
    Ok(())
}

/// Replace masked values with NaN
pub fn apply_mask(
    values: &TimeCube<IndexValue>,
    mask: &MaskCube,
) -> EoResult<TimeCube<IndexValue>> {
    check_alignment("mask application", values, mask)?;

    let masked = Zip::from(&values.data)
        .and(&mask.data)
        .map_collect(|&v, &m| if m { IndexValue::NAN } else { v });

    Ok(values.with_data(masked))
}

/// Fraction of masked pixels per scene
pub fn masked_fraction(mask: &MaskCube) -> Vec<f64> {
    let (_, rows, cols) = mask.dim();
    let pixels = rows * cols;

    mask.data
        .axis_iter(Axis(0))
        .map(|scene| {
            if pixels == 0 {
                return 1.0;
            }
            scene.iter().filter(|&&m| m).count() as f64 / pixels as f64
        })
        .collect()
}

fn check_fraction_threshold(max_fraction: f64) -> EoResult<()> {
    if !(0.0..=1.0).contains(&max_fraction) {
        return Err(EoError::InvalidConfig(format!(
            "masked fraction threshold must be within [0, 1], got {}",
            max_fraction
        )));
    }
    Ok(())
}

/// Drop scenes whose masked fraction exceeds `max_fraction`
pub fn drop_cloudy_scenes<T: Clone>(
    cube: &TimeCube<T>,
    mask: &MaskCube,
    max_fraction: f64,
) -> EoResult<TimeCube<T>> {
    check_fraction_threshold(max_fraction)?;
    check_same_shape("scene filter", &cube.data.view(), &mask.data.view())?;

    let fractions = masked_fraction(mask);
    let keep: Vec<usize> = fractions
        .iter()
        .enumerate()
        .filter(|(_, f)| **f <= max_fraction)
        .map(|(i, _)| i)
        .collect();

    log::info!(
        "Keeping {} of {} scenes with masked fraction <= {:.2}",
        keep.len(),
        fractions.len(),
        max_fraction
    );

    Ok(TimeCube {
        data: cube.data.select(Axis(0), &keep),
        times: keep.iter().map(|&i| cube.times[i]).collect(),
        grid: cube.grid.clone(),
    })
}

/// Set every pixel of scenes whose masked fraction exceeds `max_fraction` to NaN,
/// keeping the time axis (see [`drop_cloudy_scenes`] for removal)
pub fn blank_cloudy_scenes(
    values: &TimeCube<IndexValue>,
    mask: &MaskCube,
    max_fraction: f64,
) -> EoResult<TimeCube<IndexValue>> {
    check_fraction_threshold(max_fraction)?;
    check_alignment("scene filter", values, mask)?;

    let fractions = masked_fraction(mask);
    let mut blanked = values.data.clone();
    let mut rejected = 0;
    for (mut scene, &fraction) in blanked.axis_iter_mut(Axis(0)).zip(&fractions) {
        if fraction > max_fraction {
            scene.fill(IndexValue::NAN);
            rejected += 1;
        }
    }

    log::info!(
        "Blanked {} of {} scenes with masked fraction > {:.2}",
        rejected,
        fractions.len(),
        max_fraction
    );

    Ok(values.with_data(blanked))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::{grid, utc};
    use ndarray::Array3;

    fn qa_cube(data: Array3<RawSample>) -> TimeCube<RawSample> {
        let times = (0..data.dim().0).map(|i| utc(2021, 3, 1 + i as u32)).collect();
        let (_, rows, cols) = data.dim();
        TimeCube::new(data, times, grid(rows, cols)).unwrap()
    }

    #[test]
    fn test_mask_matches_bitwise_contract() {
        let builder = QualityMaskBuilder::new(0b1_1010, 1);
        for code in -64..1024 {
            let expected = (code & 0b1_1010) != 0 || code == 1;
            assert_eq!(builder.is_masked(code), expected, "code {}", code);
        }
    }

    #[test]
    fn test_zero_bitmask_reduces_to_nodata_check() {
        let builder = QualityMaskBuilder::new(0, 255);
        for code in 0..512 {
            assert_eq!(builder.is_masked(code), code == 255);
        }
    }

    #[test]
    fn test_build_preserves_shape_and_metadata() {
        let codes = qa_cube(Array3::from_shape_fn((3, 4, 5), |(t, r, c)| (t * 20 + r * 5 + c) as i32));
        let builder = QualityMaskBuilder::new(0b1000, 0);
        let mask = builder.build(&codes);

        assert!(mask.is_aligned_with(&codes));
        assert!(mask.data[[0, 0, 0]]); // sentinel
        assert!(mask.data[[0, 1, 3]]); // code 8
        assert!(!mask.data[[0, 1, 2]]); // code 7
    }

    #[test]
    fn test_landsat_qa_codes() {
        let builder = QualityMaskBuilder::from_sensor(&SensorConfig::landsat_c2_l2()).unwrap();
        assert!(!builder.is_masked(21824)); // clear land
        assert!(builder.is_masked(22280)); // high-confidence cloud (bit 3)
        assert!(builder.is_masked(23888)); // cloud shadow (bit 4)
        assert!(builder.is_masked(1)); // fill
        assert!(!builder.is_masked(21952)); // water
    }

    #[test]
    fn test_apply_mask_sets_nan() {
        let codes = qa_cube(Array3::from_elem((2, 2, 2), 0));
        let mut mask = QualityMaskBuilder::new(1, -1).build(&codes);
        mask.data[[1, 0, 1]] = true;

        let values = codes.with_data(Array3::from_elem((2, 2, 2), 0.5));
        let masked = apply_mask(&values, &mask).unwrap();

        assert!(masked.data[[1, 0, 1]].is_nan());
        assert_eq!(masked.data.iter().filter(|v| v.is_nan()).count(), 1);
        assert_eq!(values.data[[1, 0, 1]], 0.5);
    }

    #[test]
    fn test_apply_mask_shape_mismatch() {
        let codes = qa_cube(Array3::from_elem((2, 2, 2), 0));
        let mask = QualityMaskBuilder::new(1, -1).build(&codes);
        let other = qa_cube(Array3::from_elem((2, 3, 2), 0));
        let values = other.with_data(Array3::from_elem((2, 3, 2), 0.5));

        assert!(matches!(apply_mask(&values, &mask), Err(EoError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_masked_fraction_and_scene_filter() {
        let mut qa = Array3::from_elem((3, 2, 2), 0);
        qa[[1, 0, 0]] = 8;
        qa.index_axis_mut(Axis(0), 2).fill(8);
        let codes = qa_cube(qa);
        let mask = QualityMaskBuilder::new(8, -1).build(&codes);

        assert_eq!(masked_fraction(&mask), vec![0.0, 0.25, 1.0]);

        let kept = drop_cloudy_scenes(&codes, &mask, 0.5).unwrap();
        assert_eq!(kept.dim(), (2, 2, 2));
        assert_eq!(kept.times, vec![codes.times[0], codes.times[1]]);

        assert!(drop_cloudy_scenes(&codes, &mask, 1.5).is_err());
    }

    #[test]
    fn test_apply_mask_rejects_different_grid() {
        let codes = qa_cube(Array3::from_elem((2, 2, 2), 0));
        let mask = QualityMaskBuilder::new(1, -1).build(&codes);
        let mut values = codes.with_data(Array3::from_elem((2, 2, 2), 0.5));
        values.grid.geo_transform.top_left_x += 30.0;

        assert!(matches!(apply_mask(&values, &mask), Err(EoError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_blank_cloudy_scenes_keeps_time_axis() {
        let mut qa = Array3::from_elem((3, 2, 2), 0);
        qa[[1, 0, 0]] = 8;
        qa.index_axis_mut(Axis(0), 0).fill(8);
        let codes = qa_cube(qa);
        let mask = QualityMaskBuilder::new(8, -1).build(&codes);
        let values = codes.with_data(Array3::from_elem((3, 2, 2), 0.25));

        let blanked = blank_cloudy_scenes(&values, &mask, 0.5).unwrap();
        assert!(blanked.is_aligned_with(&values));
        assert!(blanked.data.index_axis(Axis(0), 0).iter().all(|v| v.is_nan()));
        assert!(blanked.data.index_axis(Axis(0), 1).iter().all(|&v| v == 0.25));
        assert!(blanked.data.index_axis(Axis(0), 2).iter().all(|&v| v == 0.25));

        assert!(blank_cloudy_scenes(&values, &mask, -0.1).is_err());
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_parallel_matches_sequential() {
        let codes = qa_cube(Array3::from_shape_fn((4, 16, 16), |(t, r, c)| ((t * 7 + r * 3 + c) % 40) as i32));
        let builder = QualityMaskBuilder::new(0b10110, 0);
        assert_eq!(builder.build(&codes), builder.build_parallel(&codes));
    }
}
