//! Per-sensor configuration: band names, reflectance scaling, quality bits and
//! the index formula, looked up by collection identifier.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::types::{EoError, EoResult, RawSample};

/// Vegetation index variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexFormula {
    /// Two-band EVI: 2.4 * (nir - red) / (nir + red + 1)
    Evi2,
    /// Three-band EVI: 2.5 * (nir - red) / (nir + 6*red - 7.5*blue + 1)
    Evi,
}

impl IndexFormula {
    pub fn needs_blue(&self) -> bool {
        matches!(self, IndexFormula::Evi)
    }
}

/// Asset names of the bands a sensor delivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandNames {
    pub red: String,
    pub nir: String,
    #[serde(default)]
    pub blue: Option<String>,
    pub quality: String,
}

/// Linear DN-to-reflectance scaling and the valid reflectance range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectanceScaling {
    pub scale_factor: f64,
    #[serde(default)]
    pub offset: f64,
    /// Inclusive lower bound; when unset, values <= 0 are invalid
    #[serde(default)]
    pub lower_bound: Option<f64>,
    /// Inclusive upper bound
    #[serde(default)]
    pub upper_bound: Option<f64>,
}

impl Default for ReflectanceScaling {
    fn default() -> Self {
        Self {
            scale_factor: 0.0001,
            offset: 0.0,
            lower_bound: None,
            upper_bound: None,
        }
    }
}

impl ReflectanceScaling {
    pub fn validate(&self) -> EoResult<()> {
        if !self.scale_factor.is_finite() || self.scale_factor == 0.0 {
            return Err(EoError::InvalidConfig(format!(
                "scale factor must be finite and non-zero, got {}",
                self.scale_factor
            )));
        }
        if !self.offset.is_finite() {
            return Err(EoError::InvalidConfig(format!(
                "offset must be finite, got {}",
                self.offset
            )));
        }
        for bound in [self.lower_bound, self.upper_bound].into_iter().flatten() {
            if !bound.is_finite() {
                return Err(EoError::InvalidConfig(format!(
                    "reflectance bounds must be finite, got {}",
                    bound
                )));
            }
        }
        if let (Some(lo), Some(hi)) = (self.lower_bound, self.upper_bound) {
            if lo > hi {
                return Err(EoError::InvalidConfig(format!(
                    "lower bound {} exceeds upper bound {}",
                    lo, hi
                )));
            }
        }
        Ok(())
    }
}

/// Static description of one sensor / collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Collection identifier, e.g. "landsat-c2-l2"
    pub collection: String,
    pub bands: BandNames,
    pub scaling: ReflectanceScaling,
    /// Named bit positions of the quality band
    pub quality_bits: BTreeMap<String, u8>,
    /// Names of the bits that invalidate a pixel
    pub reject_flags: Vec<String>,
    /// Quality code meaning "no observation"
    pub nodata: RawSample,
    pub formula: IndexFormula,
}

impl SensorConfig {
    /// Landsat Collection 2 Level-2 surface reflectance (QA_PIXEL bits)
    pub fn landsat_c2_l2() -> Self {
        Self {
            collection: "landsat-c2-l2".to_string(),
            bands: BandNames {
                red: "red".to_string(),
                nir: "nir08".to_string(),
                blue: Some("blue".to_string()),
                quality: "qa_pixel".to_string(),
            },
            scaling: ReflectanceScaling {
                scale_factor: 0.0000275,
                offset: -0.2,
                lower_bound: None,
                upper_bound: Some(1.0),
            },
            quality_bits: bits(&[
                ("fill", 0),
                ("dilated_cloud", 1),
                ("cirrus", 2),
                ("cloud", 3),
                ("cloud_shadow", 4),
                ("snow", 5),
                ("clear", 6),
                ("water", 7),
            ]),
            reject_flags: names(&["dilated_cloud", "cirrus", "cloud", "cloud_shadow"]),
            nodata: 1,
            formula: IndexFormula::Evi2,
        }
    }

    /// Harmonized Landsat Sentinel-2, Landsat 8/9 part (Fmask bits)
    pub fn hls_l30() -> Self {
        Self {
            collection: "hls2-l30".to_string(),
            bands: BandNames {
                red: "B04".to_string(),
                nir: "B05".to_string(),
                blue: Some("B02".to_string()),
                quality: "Fmask".to_string(),
            },
            scaling: ReflectanceScaling::default(),
            quality_bits: hls_fmask_bits(),
            reject_flags: names(&["cloud", "adjacent_cloud", "cloud_shadow"]),
            nodata: 255,
            formula: IndexFormula::Evi,
        }
    }

    /// Harmonized Landsat Sentinel-2, Sentinel-2 part (Fmask bits)
    pub fn hls_s30() -> Self {
        Self {
            collection: "hls2-s30".to_string(),
            bands: BandNames {
                red: "B04".to_string(),
                nir: "B8A".to_string(),
                blue: Some("B02".to_string()),
                quality: "Fmask".to_string(),
            },
            ..Self::hls_l30()
        }
    }

    /// Check the record before any pixel is touched
    pub fn validate(&self) -> EoResult<()> {
        if self.collection.is_empty() {
            return Err(EoError::InvalidConfig("empty collection identifier".to_string()));
        }
        self.scaling.validate().map_err(|e| match e {
            EoError::InvalidConfig(msg) => {
                EoError::InvalidConfig(format!("{}: {}", self.collection, msg))
            }
            other => other,
        })?;
        if self.formula.needs_blue() && self.bands.blue.is_none() {
            return Err(EoError::InvalidConfig(format!(
                "{}: three-band EVI requires a blue band",
                self.collection
            )));
        }
        for (name, bit) in &self.quality_bits {
            if *bit >= RawSample::BITS as u8 {
                return Err(EoError::InvalidConfig(format!(
                    "{}: quality bit '{}' at position {} does not fit the quality code",
                    self.collection, name, bit
                )));
            }
        }
        self.reject_bitmask().map(|_| ())
    }

    /// OR of the reject flags' bits
    pub fn reject_bitmask(&self) -> EoResult<RawSample> {
        reject_bitmask_for(&self.quality_bits, &self.reject_flags).map_err(|e| match e {
            EoError::InvalidConfig(msg) => {
                EoError::InvalidConfig(format!("{}: {}", self.collection, msg))
            }
            other => other,
        })
    }
}

/// Build a reject bitmask from named flags
pub fn reject_bitmask_for<S: AsRef<str>>(
    quality_bits: &BTreeMap<String, u8>,
    flags: &[S],
) -> EoResult<RawSample> {
    let mut mask: RawSample = 0;
    for flag in flags {
        let flag = flag.as_ref();
        let bit = quality_bits
            .get(flag)
            .ok_or_else(|| EoError::InvalidConfig(format!("unknown quality flag '{}'", flag)))?;
        if *bit >= RawSample::BITS as u8 {
            return Err(EoError::InvalidConfig(format!(
                "quality flag '{}' bit {} out of range",
                flag, bit
            )));
        }
        mask |= 1 << bit;
    }
    Ok(mask)
}

fn hls_fmask_bits() -> BTreeMap<String, u8> {
    bits(&[
        ("cirrus", 0),
        ("cloud", 1),
        ("adjacent_cloud", 2),
        ("cloud_shadow", 3),
        ("snow_ice", 4),
        ("water", 5),
        ("aerosol_low", 6),
        ("aerosol_high", 7),
    ])
}

fn bits(pairs: &[(&str, u8)]) -> BTreeMap<String, u8> {
    pairs.iter().map(|(n, b)| (n.to_string(), *b)).collect()
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Immutable lookup of sensor configurations keyed by collection id
#[derive(Debug, Clone, Default)]
pub struct SensorRegistry {
    sensors: HashMap<String, SensorConfig>,
}

impl SensorRegistry {
    /// Registry with the built-in Landsat and HLS presets
    pub fn builtin() -> Self {
        let mut sensors = HashMap::new();
        for config in [
            SensorConfig::landsat_c2_l2(),
            SensorConfig::hls_l30(),
            SensorConfig::hls_s30(),
        ] {
            sensors.insert(config.collection.clone(), config);
        }
        Self { sensors }
    }

    /// Build a registry from records, validating each one
    pub fn from_configs<I>(configs: I) -> EoResult<Self>
    where
        I: IntoIterator<Item = SensorConfig>,
    {
        Self::default().extended(configs)
    }

    /// Return a new registry with `configs` added (replacing same-named entries)
    pub fn extended<I>(mut self, configs: I) -> EoResult<Self>
    where
        I: IntoIterator<Item = SensorConfig>,
    {
        for config in configs {
            config.validate()?;
            log::debug!("Registering sensor configuration '{}'", config.collection);
            self.sensors.insert(config.collection.clone(), config);
        }
        Ok(self)
    }

    /// Parse a JSON array of sensor records
    pub fn from_json_str(json: &str) -> EoResult<Self> {
        let configs: Vec<SensorConfig> = serde_json::from_str(json)?;
        Self::from_configs(configs)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> EoResult<Self> {
        log::info!("Reading sensor configuration: {}", path.as_ref().display());
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn get(&self, collection: &str) -> EoResult<&SensorConfig> {
        self.sensors
            .get(collection)
            .ok_or_else(|| EoError::UnknownSensor(collection.to_string()))
    }

    pub fn collections(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.sensors.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}
