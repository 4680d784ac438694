//! The feature extractor: one production record plus one image pair in,
//! one fixed-shape example out.

use std::path::PathBuf;

use dryer_core::{
    CoercionLog, ConveyorEntry, Error, FeatureVector, ImagePair, ImageShape, ImageTensor,
    ProcessVector, ProductionRecord, Result, TargetVector, TemperatureEntry, CONVEYOR_COUNT,
    IMAGES_PER_SIDE, IMAGE_SIDE, ZONE_COUNT,
};
use tracing::{debug, warn};

use crate::augmentation::GeometricJitter;
use crate::images::{concat_width, load_rgb};

/// A supervised example extracted from one record.
#[derive(Debug, Clone)]
pub struct ExtractedExample {
    pub features: FeatureVector,
    pub target: TargetVector,
    pub image: ImageTensor,
    /// Scalars that had to be coerced or defaulted
    pub coercions: CoercionLog,
    /// The image set was unreadable and replaced with zeros
    pub zero_filled: bool,
}

/// Model inputs for a live record, with the observed targets when logged.
#[derive(Debug, Clone)]
pub struct PredictionInput {
    pub features: FeatureVector,
    pub observed: Option<TargetVector>,
    pub image: ImageTensor,
    pub coercions: CoercionLog,
}

/// Stateless extractor; safe to share across threads.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    image_side: u32,
    jitter: GeometricJitter,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self {
            image_side: IMAGE_SIDE as u32,
            jitter: GeometricJitter::default(),
        }
    }

    pub fn with_image_side(mut self, side: u32) -> Self {
        self.image_side = side;
        self
    }

    pub fn with_jitter(mut self, jitter: GeometricJitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Shape of the stacked image this extractor produces.
    pub fn image_shape(&self) -> ImageShape {
        let side = self.image_side as usize;
        ImageShape::new(side, side * IMAGES_PER_SIDE * 2)
    }

    /// Strict extraction used for training.
    ///
    /// Fails with `IncompleteRecord` when no valid setpoint or actual entry
    /// exists, and with `ImageLoad` when any image is unreadable.
    pub fn extract(
        &self,
        record: &ProductionRecord,
        images: &ImagePair,
        augmentation: bool,
    ) -> Result<ExtractedExample> {
        let (features, target, coercions) = self.numeric(record)?;
        let image = self.load_image_pair(images, augmentation)?;
        Ok(ExtractedExample {
            features,
            target,
            image,
            coercions,
            zero_filled: false,
        })
    }

    /// Evaluation extraction: an unreadable image set becomes a zero tensor.
    pub fn extract_lenient(
        &self,
        record: &ProductionRecord,
        images: &ImagePair,
    ) -> Result<ExtractedExample> {
        let (features, target, coercions) = self.numeric(record)?;
        let (image, zero_filled) = match self.load_image_pair(images, false) {
            Ok(image) => (image, false),
            Err(err @ Error::ImageLoad { .. }) => {
                warn!(error = %err, "zero-filling image set for evaluation");
                let shape = self.image_shape();
                (ImageTensor::zeros(shape.height, shape.width), true)
            }
            Err(err) => return Err(err),
        };
        Ok(ExtractedExample {
            features,
            target,
            image,
            coercions,
            zero_filled,
        })
    }

    /// Live-inference extraction. Setpoints and images are required; actual
    /// readings are optional.
    pub fn extract_inputs(
        &self,
        record: &ProductionRecord,
        images: &ImagePair,
    ) -> Result<PredictionInput> {
        let furnace = &record.furnace;
        let setpoint = furnace.last_valid_setpoint().ok_or_else(|| {
            Error::IncompleteRecord(format!(
                "no setpoint entry with {ZONE_COUNT} zones and inlet air"
            ))
        })?;
        let conveyor = furnace.latest_conveyor();

        let mut coercions = CoercionLog::new();
        let features = process_vector("setpoint", setpoint, conveyor, &mut coercions);
        let observed = furnace
            .last_valid_actual()
            .map(|actual| process_vector("actual", actual, conveyor, &mut coercions));
        let image = self.load_image_pair(images, false)?;

        Ok(PredictionInput {
            features,
            observed,
            image,
            coercions,
        })
    }

    fn numeric(
        &self,
        record: &ProductionRecord,
    ) -> Result<(FeatureVector, TargetVector, CoercionLog)> {
        let furnace = &record.furnace;
        let (setpoint, actual) = match (furnace.last_valid_setpoint(), furnace.last_valid_actual()) {
            (Some(s), Some(a)) => (s, a),
            (setpoint, _) => {
                let missing = if setpoint.is_none() { "setpoint" } else { "actual" };
                return Err(Error::IncompleteRecord(format!(
                    "no {missing} entry with {ZONE_COUNT} zones and inlet air{}",
                    record
                        .timestamp
                        .as_deref()
                        .map(|ts| format!(" (record {ts})"))
                        .unwrap_or_default()
                )));
            }
        };
        let conveyor = furnace.latest_conveyor();
        if conveyor.is_none() {
            debug!("record has no conveyor entry, speeds default to 0");
        }

        let mut coercions = CoercionLog::new();
        let features = process_vector("setpoint", setpoint, conveyor, &mut coercions);
        let target = process_vector("actual", actual, conveyor, &mut coercions);
        Ok((features, target, coercions))
    }

    /// Loads the six images of a pair and stacks them along the width.
    pub fn load_image_pair(&self, images: &ImagePair, augmentation: bool) -> Result<ImageTensor> {
        if !images.is_complete() {
            return Err(Error::image_load(
                PathBuf::from("<image set>"),
                format!(
                    "expected {IMAGES_PER_SIDE} conforming and {IMAGES_PER_SIDE} observed images, found {} and {}",
                    images.conforming.len(),
                    images.observed.len()
                ),
            ));
        }

        let mut tiles = Vec::with_capacity(IMAGES_PER_SIDE * 2);
        for path in images.paths() {
            let image = load_rgb(path, self.image_side)?;
            tiles.push(if augmentation {
                self.jitter.apply(&image)
            } else {
                image
            });
        }
        Ok(concat_width(&tiles))
    }
}

fn process_vector(
    side: &str,
    temperatures: &TemperatureEntry,
    conveyor: Option<&ConveyorEntry>,
    coercions: &mut CoercionLog,
) -> ProcessVector {
    let mut zones = [0.0; ZONE_COUNT];
    for (i, (slot, raw)) in zones.iter_mut().zip(&temperatures.zones).enumerate() {
        *slot = coercions.scalar(&format!("{side}.cels[{i}]"), Some(raw));
    }
    let inlet_air = coercions.scalar(&format!("{side}.air_neuf"), temperatures.inlet_air.as_ref());

    let mut speeds = [0.0; CONVEYOR_COUNT];
    if let Some(conveyor) = conveyor {
        for (slot, (name, raw)) in speeds.iter_mut().zip(conveyor.fields()) {
            *slot = coercions.scalar(name, raw);
        }
    }
    ProcessVector::from_parts(zones, inlet_air, speeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use dryer_core::{ConveyorEntry, FurnaceSnapshot, FEATURE_DIM};
    use serde_json::json;
    use tempfile::TempDir;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_extractor_is_thread_safe() {
        assert_send_sync::<FeatureExtractor>();
    }

    #[test]
    fn test_valid_record_yields_eleven_values() -> Result<()> {
        let dir = TempDir::new()?;
        let images = fixtures::image_pair(dir.path(), "set")?;
        let record = fixtures::record(0);
        let example = FeatureExtractor::new().extract(&record, &images, false)?;

        assert_eq!(example.features.as_slice().len(), FEATURE_DIM);
        assert_eq!(example.target.as_slice().len(), FEATURE_DIM);
        assert_eq!(example.features.zone_temperatures()[0], 60.0);
        assert_eq!(example.target.zone_temperatures()[0], 58.0);
        assert_eq!(example.features.feed_speed(), example.target.feed_speed());
        assert_eq!(example.image.shape(), ImageShape::new(32, 192));
        assert!(example.coercions.is_clean());
        Ok(())
    }

    #[test]
    fn test_five_zone_setpoint_is_incomplete() -> Result<()> {
        let dir = TempDir::new()?;
        let images = fixtures::image_pair(dir.path(), "set")?;
        let record = fixtures::record_with_zones(5);
        let result = FeatureExtractor::new().extract(&record, &images, false);
        assert!(matches!(result, Err(Error::IncompleteRecord(_))));
        Ok(())
    }

    #[test]
    fn test_missing_actuals_is_incomplete() {
        let mut record = fixtures::record(0);
        record.furnace.actuals.clear();
        let err = FeatureExtractor::new().numeric(&record).unwrap_err();
        assert!(err.to_string().contains("actual"));
    }

    #[test]
    fn test_free_text_and_missing_conveyors() {
        let mut record = fixtures::record(0);
        record.furnace.setpoints[0].zones[2] = json!("about 70");
        record.furnace.conveyors = vec![ConveyorEntry {
            feed: Some(json!("1.5")),
            ..Default::default()
        }];

        let (features, _, coercions) = FeatureExtractor::new().numeric(&record).unwrap();
        assert_eq!(features.zone_temperatures()[2], 0.0);
        assert_eq!(features.feed_speed(), 1.5);
        assert_eq!(features.belt_speeds(), &[0.0, 0.0, 0.0]);
        assert_eq!(coercions.coerced, 1);
        // three belts missing on both the feature and target side
        assert_eq!(coercions.defaulted, 6);
    }

    #[test]
    fn test_no_conveyor_defaults_to_zero() {
        let mut record = fixtures::record(0);
        record.furnace.conveyors.clear();
        let (features, target, _) = FeatureExtractor::new().numeric(&record).unwrap();
        assert_eq!(features.feed_speed(), 0.0);
        assert_eq!(target.belt_speeds(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_strict_and_lenient_image_handling() -> Result<()> {
        let dir = TempDir::new()?;
        let mut images = fixtures::image_pair(dir.path(), "set")?;
        images.observed[1] = dir.path().join("does_not_exist.png");
        let record = fixtures::record(0);
        let extractor = FeatureExtractor::new();

        assert!(matches!(
            extractor.extract(&record, &images, true),
            Err(Error::ImageLoad { .. })
        ));

        let example = extractor.extract_lenient(&record, &images)?;
        assert!(example.zero_filled);
        assert!(example.image.is_zero());
        assert_eq!(example.image.shape(), extractor.image_shape());
        Ok(())
    }

    #[test]
    fn test_short_image_set_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let mut images = fixtures::image_pair(dir.path(), "set")?;
        images.conforming.pop();
        let result = FeatureExtractor::new().load_image_pair(&images, false);
        assert!(matches!(result, Err(Error::ImageLoad { .. })));
        Ok(())
    }

    #[test]
    fn test_prediction_inputs_without_actuals() -> Result<()> {
        let dir = TempDir::new()?;
        let images = fixtures::image_pair(dir.path(), "live")?;
        let record = ProductionRecord {
            timestamp: None,
            furnace: FurnaceSnapshot {
                setpoints: vec![TemperatureEntry::new("10:00", &[70.0; 6], 22.0)],
                ..Default::default()
            },
        };
        let input = FeatureExtractor::new().extract_inputs(&record, &images)?;
        assert!(input.observed.is_none());
        assert_eq!(input.features.inlet_air(), 22.0);
        Ok(())
    }

    #[test]
    fn test_augmentation_keeps_shape() -> Result<()> {
        let dir = TempDir::new()?;
        let images = fixtures::image_pair(dir.path(), "aug")?;
        let example = FeatureExtractor::new().extract(&fixtures::record(1), &images, true)?;
        assert_eq!(example.image.shape(), ImageShape::new(32, 192));
        assert!(example.image.data.iter().all(|v| (0.0..=1.0).contains(v)));
        Ok(())
    }
}
