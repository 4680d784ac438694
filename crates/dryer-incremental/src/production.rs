//! Buffer of live production examples awaiting a fine-tuning pass.

use burn::tensor::backend::AutodiffBackend;
use dryer_core::{ImagePair, ProductionRecord, Result};
use dryer_features::{ExtractedExample, FeatureExtractor};
use dryer_training::TrainedModel;
use tracing::{debug, info};

use crate::finetuning::{fine_tune, FineTuneMode, FineTuneReport};

/// Strictly extracted examples collected from the running line.
#[derive(Debug, Clone, Default)]
pub struct ProductionBuffer {
    examples: Vec<ExtractedExample>,
}

impl ProductionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extracts and buffers one record. Incomplete records and unreadable
    /// images are rejected, leaving the buffer unchanged.
    pub fn collect(
        &mut self,
        extractor: &FeatureExtractor,
        record: &ProductionRecord,
        images: &ImagePair,
        augmentation: bool,
    ) -> Result<usize> {
        let example = extractor.extract(record, images, augmentation)?;
        self.push(example);
        Ok(self.examples.len())
    }

    pub fn push(&mut self, example: ExtractedExample) {
        self.examples.push(example);
        debug!(buffered = self.examples.len(), "production example buffered");
    }

    pub fn examples(&self) -> &[ExtractedExample] {
        &self.examples
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Fine-tunes `model` on everything buffered; drains only on success.
    pub fn fine_tune<B: AutodiffBackend>(
        &mut self,
        model: &mut TrainedModel<B>,
        mode: FineTuneMode,
    ) -> Result<FineTuneReport> {
        let report = fine_tune(model, &self.examples, mode)?;
        info!(drained = self.examples.len(), "production buffer consumed");
        self.examples.clear();
        Ok(report)
    }
}
