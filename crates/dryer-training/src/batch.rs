//! Example gathering and tensor batching.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use dryer_core::{Error, ImageTensor, ProcessVector, Result, IMAGE_CHANNELS};
use dryer_features::{ExtractedExample, FeatureExtractor, TrainingSet};
use tracing::{info, warn};

/// Model inputs and targets for one mini-batch.
#[derive(Debug, Clone)]
pub struct RegressorBatch<B: Backend> {
    /// `[batch, channels, height, width]`
    pub images: Tensor<B, 4>,
    /// `[batch, features]`
    pub numeric: Tensor<B, 2>,
    /// `[batch, outputs]`
    pub targets: Tensor<B, 2>,
}

/// A training set that produced no example, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSet {
    pub name: String,
    pub reason: String,
}

/// Examples extracted for one product type.
#[derive(Debug, Clone, Default)]
pub struct GatheredExamples {
    pub examples: Vec<ExtractedExample>,
    pub skipped: Vec<SkippedSet>,
    /// Sets whose product type matched
    pub candidates: usize,
}

impl GatheredExamples {
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn refs(&self) -> Vec<&ExtractedExample> {
        self.examples.iter().collect()
    }
}

/// Extracts every set of `product_type`, dropping the ones that fail recoverably.
pub fn gather_examples<'a>(
    sets: impl IntoIterator<Item = &'a TrainingSet>,
    product_type: &str,
    extractor: &FeatureExtractor,
    augmentation: bool,
) -> Result<GatheredExamples> {
    let mut gathered = GatheredExamples::default();
    for set in sets.into_iter().filter(|s| s.product_type == product_type) {
        gathered.candidates += 1;
        match extractor.extract(&set.record, &set.images, augmentation) {
            Ok(example) => gathered.examples.push(example),
            Err(err) if err.is_recoverable() => {
                warn!(set = %set.name, error = %err, "skipping training set");
                gathered.skipped.push(SkippedSet {
                    name: set.name.clone(),
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }

    if gathered.candidates == 0 {
        return Err(Error::InsufficientData(format!(
            "no training set for product type '{product_type}'"
        )));
    }
    if gathered.is_empty() {
        return Err(Error::InsufficientData(format!(
            "none of the {} sets for '{product_type}' could be extracted",
            gathered.candidates
        )));
    }
    info!(
        product = product_type,
        examples = gathered.len(),
        skipped = gathered.skipped.len(),
        "gathered training examples"
    );
    Ok(gathered)
}

/// Stacks HWC image buffers into an NCHW tensor.
pub fn images_tensor<B: Backend>(images: &[&ImageTensor], device: &B::Device) -> Tensor<B, 4> {
    let (height, width) = images
        .first()
        .map(|image| (image.height, image.width))
        .unwrap_or((0, 0));
    let mut data = Vec::with_capacity(images.len() * height * width * IMAGE_CHANNELS);
    for image in images {
        data.extend_from_slice(&image.data);
    }
    Tensor::<B, 4>::from_floats(
        TensorData::new(data, [images.len(), height, width, IMAGE_CHANNELS]),
        device,
    )
    .permute([0, 3, 1, 2])
}

pub fn vectors_tensor<B: Backend>(vectors: &[&ProcessVector], device: &B::Device) -> Tensor<B, 2> {
    let width = vectors.first().map(|v| v.as_slice().len()).unwrap_or(0);
    let data: Vec<f32> = vectors
        .iter()
        .flat_map(|v| v.as_slice().iter().copied())
        .collect();
    Tensor::<B, 2>::from_floats(TensorData::new(data, [vectors.len(), width]), device)
}

pub fn batch_examples<B: Backend>(
    examples: &[&ExtractedExample],
    device: &B::Device,
) -> RegressorBatch<B> {
    let images: Vec<&ImageTensor> = examples.iter().map(|e| &e.image).collect();
    let features: Vec<&ProcessVector> = examples.iter().map(|e| &e.features).collect();
    let targets: Vec<&ProcessVector> = examples.iter().map(|e| &e.target).collect();

    RegressorBatch {
        images: images_tensor(&images, device),
        numeric: vectors_tensor(&features, device),
        targets: vectors_tensor(&targets, device),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use dryer_features::fixtures;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    #[test]
    fn test_batch_shapes() -> Result<()> {
        let dir = TempDir::new()?;
        let sets = fixtures::training_sets(dir.path(), "Ail", 3)?;
        let gathered = gather_examples(&sets, "Ail", &FeatureExtractor::new(), false)?;
        let batch = batch_examples::<TestBackend>(&gathered.refs(), &Default::default());

        assert_eq!(batch.images.dims(), [3, 3, 32, 192]);
        assert_eq!(batch.numeric.dims(), [3, 11]);
        assert_eq!(batch.targets.dims(), [3, 11]);
        Ok(())
    }

    #[test]
    fn test_channel_layout() {
        let mut image = ImageTensor::zeros(1, 2);
        // pixel (0, 1) is pure blue
        image.data[5] = 1.0;
        let tensor = images_tensor::<TestBackend>(&[&image], &Default::default());
        let values = tensor.into_data().to_vec::<f32>().unwrap();
        // channel-major: r0 r1 g0 g1 b0 b1
        assert_eq!(values, vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_gather_filters_product_and_skips_incomplete() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sets = fixtures::training_sets(dir.path(), "Ail", 4)?;
        sets[1].record = fixtures::record_with_zones(5);
        sets.extend(fixtures::training_sets(dir.path(), "Oignon", 2)?);

        let gathered = gather_examples(&sets, "Ail", &FeatureExtractor::new(), false)?;
        assert_eq!(gathered.candidates, 4);
        assert_eq!(gathered.len(), 3);
        assert_eq!(gathered.skipped[0].name, "set_2");
        Ok(())
    }

    #[test]
    fn test_gather_without_matching_product() -> Result<()> {
        let dir = TempDir::new()?;
        let sets = fixtures::training_sets(dir.path(), "Ail", 2)?;
        let result = gather_examples(&sets, "Échalote", &FeatureExtractor::new(), false);
        assert!(matches!(result, Err(Error::InsufficientData(_))));
        Ok(())
    }
}
