//! Domain types for dryer production records and extracted examples.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of temperature zones in the dryer.
pub const ZONE_COUNT: usize = 6;

/// Number of belt conveyors after the feed conveyor.
pub const BELT_COUNT: usize = 3;

/// Feed speed plus every belt speed.
pub const CONVEYOR_COUNT: usize = 1 + BELT_COUNT;

/// Zones, inlet air, then conveyor speeds.
pub const FEATURE_DIM: usize = ZONE_COUNT + 1 + CONVEYOR_COUNT;

/// Width of the regression head; the same layout as the features.
pub const OUTPUT_DIM: usize = FEATURE_DIM;

/// Images per side of an [`ImagePair`].
pub const IMAGES_PER_SIDE: usize = 3;

/// Side length images are resized to.
pub const IMAGE_SIDE: usize = 32;

pub const IMAGE_CHANNELS: usize = 3;

/// Product types handled on the line.
pub const KNOWN_PRODUCTS: [&str; 3] = ["Ail", "Oignon", "Échalote"];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One temperature reading: six zone values plus the inlet-air value.
///
/// Values are kept as raw JSON because operators type them as free text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemperatureEntry {
    #[serde(rename = "heure", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(rename = "cels", default)]
    pub zones: Vec<Value>,
    #[serde(rename = "air_neuf", default, skip_serializing_if = "Option::is_none")]
    pub inlet_air: Option<Value>,
}

impl TemperatureEntry {
    pub fn new(time: impl Into<String>, zones: &[f64], inlet_air: f64) -> Self {
        Self {
            time: Some(time.into()),
            zones: zones.iter().map(|z| Value::from(*z)).collect(),
            inlet_air: Some(Value::from(inlet_air)),
        }
    }

    /// An entry is usable when it carries exactly one value per zone and an inlet-air value.
    pub fn is_valid(&self) -> bool {
        self.zones.len() == ZONE_COUNT && self.inlet_air.is_some()
    }
}

/// Conveyor speeds at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConveyorEntry {
    #[serde(rename = "heure", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(rename = "vit_stockeur", default, skip_serializing_if = "Option::is_none")]
    pub feed: Option<Value>,
    #[serde(rename = "tapis1", default, skip_serializing_if = "Option::is_none")]
    pub belt1: Option<Value>,
    #[serde(rename = "tapis2", default, skip_serializing_if = "Option::is_none")]
    pub belt2: Option<Value>,
    #[serde(rename = "tapis3", default, skip_serializing_if = "Option::is_none")]
    pub belt3: Option<Value>,
}

impl ConveyorEntry {
    pub fn new(time: impl Into<String>, feed: f64, belts: [f64; BELT_COUNT]) -> Self {
        Self {
            time: Some(time.into()),
            feed: Some(Value::from(feed)),
            belt1: Some(Value::from(belts[0])),
            belt2: Some(Value::from(belts[1])),
            belt3: Some(Value::from(belts[2])),
        }
    }

    /// Named raw values in feature order.
    pub fn fields(&self) -> [(&'static str, Option<&Value>); CONVEYOR_COUNT] {
        [
            ("vit_stockeur", self.feed.as_ref()),
            ("tapis1", self.belt1.as_ref()),
            ("tapis2", self.belt2.as_ref()),
            ("tapis3", self.belt3.as_ref()),
        ]
    }
}

/// The dryer snapshot carried by a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FurnaceSnapshot {
    #[serde(rename = "temperatures_consignes", default)]
    pub setpoints: Vec<TemperatureEntry>,
    #[serde(rename = "temperatures_reelles", default)]
    pub actuals: Vec<TemperatureEntry>,
    #[serde(rename = "tapis", default)]
    pub conveyors: Vec<ConveyorEntry>,
}

impl FurnaceSnapshot {
    /// Most recent setpoint entry that passes [`TemperatureEntry::is_valid`].
    pub fn last_valid_setpoint(&self) -> Option<&TemperatureEntry> {
        self.setpoints.iter().rev().find(|t| t.is_valid())
    }

    pub fn last_valid_actual(&self) -> Option<&TemperatureEntry> {
        self.actuals.iter().rev().find(|t| t.is_valid())
    }

    pub fn latest_conveyor(&self) -> Option<&ConveyorEntry> {
        self.conveyors.last()
    }
}

/// Immutable snapshot of the dryer log at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(rename = "four_data", default)]
    pub furnace: FurnaceSnapshot,
}

impl ProductionRecord {
    pub fn new(timestamp: impl Into<String>, furnace: FurnaceSnapshot) -> Self {
        Self {
            timestamp: Some(timestamp.into()),
            furnace,
        }
    }

    /// Parses the `%Y-%m-%d %H:%M:%S` timestamp, if present and well formed.
    pub fn recorded_at(&self) -> Option<NaiveDateTime> {
        self.timestamp
            .as_deref()
            .and_then(|ts| NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok())
    }
}

/// Reference (conforming) and currently observed (non-conforming) images.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePair {
    #[serde(rename = "img_list_conformes", default)]
    pub conforming: Vec<PathBuf>,
    #[serde(rename = "img_list_non_conformes", default)]
    pub observed: Vec<PathBuf>,
}

impl ImagePair {
    pub fn new(conforming: Vec<PathBuf>, observed: Vec<PathBuf>) -> Self {
        Self {
            conforming,
            observed,
        }
    }

    /// Conforming paths first, then observed, in concatenation order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.conforming
            .iter()
            .chain(self.observed.iter())
            .map(PathBuf::as_path)
    }

    pub fn is_complete(&self) -> bool {
        self.conforming.len() == IMAGES_PER_SIDE && self.observed.len() == IMAGES_PER_SIDE
    }
}

/// One entry of an externally supplied validation document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationEntry {
    #[serde(flatten)]
    pub record: ProductionRecord,
    #[serde(flatten)]
    pub images: ImagePair,
}

/// Fixed-layout process vector: six zones, inlet air, feed speed, three belt speeds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessVector(pub [f32; FEATURE_DIM]);

/// Model input built from setpoints.
pub type FeatureVector = ProcessVector;

/// Supervision target built from actual readings.
pub type TargetVector = ProcessVector;

/// Model output, same positional layout as [`TargetVector`].
pub type PredictedTargetVector = ProcessVector;

impl ProcessVector {
    pub fn from_parts(
        zones: [f32; ZONE_COUNT],
        inlet_air: f32,
        conveyors: [f32; CONVEYOR_COUNT],
    ) -> Self {
        let mut values = [0.0; FEATURE_DIM];
        values[..ZONE_COUNT].copy_from_slice(&zones);
        values[ZONE_COUNT] = inlet_air;
        values[ZONE_COUNT + 1..].copy_from_slice(&conveyors);
        Self(values)
    }

    /// Builds a vector from a model output row; `None` when the width is wrong.
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        let values: [f32; FEATURE_DIM] = values.try_into().ok()?;
        Some(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn zone_temperatures(&self) -> &[f32] {
        &self.0[..ZONE_COUNT]
    }

    pub fn inlet_air(&self) -> f32 {
        self.0[ZONE_COUNT]
    }

    pub fn feed_speed(&self) -> f32 {
        self.0[ZONE_COUNT + 1]
    }

    pub fn belt_speeds(&self) -> &[f32] {
        &self.0[ZONE_COUNT + 2..]
    }

    /// Zone temperatures followed by inlet air.
    pub fn temperatures(&self) -> &[f32] {
        &self.0[..=ZONE_COUNT]
    }
}

impl fmt::Display for ProcessVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let zones = self
            .zone_temperatures()
            .iter()
            .map(|z| format!("{z:.2}"))
            .collect::<Vec<_>>()
            .join(", ");
        let belts = self
            .belt_speeds()
            .iter()
            .map(|b| format!("{b:.2}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "zones [{zones}] | inlet air {:.2} | feed {:.2} | belts [{belts}]",
            self.inlet_air(),
            self.feed_speed()
        )
    }
}

/// Height x width x channel image buffer with values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl ImageTensor {
    pub fn zeros(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            data: vec![0.0; height * width * IMAGE_CHANNELS],
        }
    }

    /// Shape of the stacked image for a full pair at the standard resolution.
    pub fn pair_shape() -> ImageShape {
        ImageShape::new(IMAGE_SIDE, IMAGE_SIDE * IMAGES_PER_SIDE * 2)
    }

    pub fn shape(&self) -> ImageShape {
        ImageShape::new(self.height, self.width)
    }

    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|v| *v == 0.0)
    }
}

/// Spatial size of an image input; channels are always RGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn channels(&self) -> usize {
        IMAGE_CHANNELS
    }
}

impl Default for ImageShape {
    fn default() -> Self {
        ImageTensor::pair_shape()
    }
}

impl fmt::Display for ImageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, IMAGE_CHANNELS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_layout() {
        assert_eq!(FEATURE_DIM, 11);
        let v = ProcessVector::from_parts(
            [1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            7.0,
            [8.0, 9.0, 10.0, 11.0],
        );
        assert_eq!(v.zone_temperatures(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(v.inlet_air(), 7.0);
        assert_eq!(v.feed_speed(), 8.0);
        assert_eq!(v.belt_speeds(), &[9.0, 10.0, 11.0]);
        assert_eq!(v.temperatures().len(), 7);
    }

    #[test]
    fn test_from_slice_rejects_wrong_width() {
        assert!(ProcessVector::from_slice(&[0.0; 10]).is_none());
        assert!(ProcessVector::from_slice(&[0.0; 11]).is_some());
    }

    #[test]
    fn test_last_valid_entry_scans_in_reverse() {
        let furnace = FurnaceSnapshot {
            setpoints: vec![
                TemperatureEntry::new("08:00", &[60.0; 6], 20.0),
                TemperatureEntry::new("09:00", &[70.0; 6], 25.0),
                TemperatureEntry::new("10:00", &[80.0; 5], 30.0),
            ],
            ..Default::default()
        };
        let entry = furnace.last_valid_setpoint().unwrap();
        assert_eq!(entry.time.as_deref(), Some("09:00"));
        assert!(furnace.last_valid_actual().is_none());
    }

    #[test]
    fn test_record_json_layout() {
        let json = r#"{
            "timestamp": "2024-03-01 10:15:00",
            "four_data": {
                "temperatures_consignes": [{"heure": "10:00", "cels": ["60","61","62","63","64","65"], "air_neuf": "20"}],
                "temperatures_reelles": [],
                "tapis": [{"heure": "10:00", "vit_stockeur": "1.5", "tapis1": "2"}]
            }
        }"#;
        let record: ProductionRecord = serde_json::from_str(json).unwrap();
        assert!(record.furnace.last_valid_setpoint().is_some());
        assert!(record.furnace.latest_conveyor().unwrap().belt3.is_none());
        assert_eq!(
            record.recorded_at().unwrap().format("%H:%M").to_string(),
            "10:15"
        );
    }

    #[test]
    fn test_validation_entry_flattens_images() {
        let json = r#"{
            "four_data": {},
            "img_list_conformes": ["a.png", "b.png", "c.png"],
            "img_list_non_conformes": ["d.png", "e.png", "f.png"]
        }"#;
        let entry: ValidationEntry = serde_json::from_str(json).unwrap();
        assert!(entry.images.is_complete());
        assert_eq!(entry.images.paths().count(), 6);
    }

    #[test]
    fn test_pair_shape() {
        let shape = ImageTensor::pair_shape();
        assert_eq!(shape, ImageShape::new(32, 192));
        assert_eq!(shape.to_string(), "32x192x3");
    }
}
