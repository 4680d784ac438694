//! Feature extraction for the dryer-line models.
//!
//! Turns raw production records and their image pairs into fixed-shape
//! examples: an 11-value feature vector built from setpoints, an 11-value
//! target built from actual readings, and a width-stacked image tensor.

pub mod augmentation;
pub mod extractor;
pub mod images;
pub mod records;
pub mod sets;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use augmentation::{GeometricJitter, JitterConfig};
pub use extractor::{ExtractedExample, FeatureExtractor, PredictionInput};
pub use images::{concat_width, load_rgb};
pub use records::{load_validation_entries, RecordStore};
pub use sets::{TrainingSet, TrainingSetRegistry};
