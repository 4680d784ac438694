//! Shuffled k-fold cross-validation.

use std::fmt;

use burn::tensor::backend::AutodiffBackend;
use dryer_core::{Error, RegressionMetrics, Result};
use dryer_features::{ExtractedExample, FeatureExtractor, TrainingSet};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::batch::gather_examples;
use crate::evaluator::predict_rows;
use crate::model::TrainedModel;
use crate::trainer::{fit, FitPlan};

pub const DEFAULT_FOLDS: usize = 5;

/// One train/validation split, as indices into the example list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Splitter matching the usual shuffled k-fold: the permutation is cut into
/// `k` contiguous blocks, the first `n % k` of them one element longer.
#[derive(Debug, Clone, Copy)]
pub struct KFold {
    pub k: usize,
    pub seed: u64,
    pub shuffle: bool,
}

impl KFold {
    pub fn new(k: usize, seed: u64) -> Self {
        Self {
            k,
            seed,
            shuffle: true,
        }
    }

    pub fn split(&self, n: usize) -> Result<Vec<Fold>> {
        if self.k < 2 {
            return Err(Error::InvalidConfig(format!(
                "k-fold needs at least 2 folds, got {}",
                self.k
            )));
        }
        if n < self.k {
            return Err(Error::InsufficientData(format!(
                "{n} examples cannot fill {} folds",
                self.k
            )));
        }

        let mut order: Vec<usize> = (0..n).collect();
        if self.shuffle {
            order.shuffle(&mut ChaCha8Rng::seed_from_u64(self.seed));
        }

        let base = n / self.k;
        let extra = n % self.k;
        let mut folds = Vec::with_capacity(self.k);
        let mut start = 0;
        for fold in 0..self.k {
            let size = base + usize::from(fold < extra);
            let end = start + size;
            let validation = order[start..end].to_vec();
            let train = order[..start]
                .iter()
                .chain(&order[end..])
                .copied()
                .collect();
            folds.push(Fold { train, validation });
            start = end;
        }
        Ok(folds)
    }
}

impl Default for KFold {
    fn default() -> Self {
        Self::new(DEFAULT_FOLDS, 42)
    }
}

#[derive(Debug, Clone)]
pub struct CrossValidationReport {
    pub folds: Vec<RegressionMetrics>,
    pub mean: RegressionMetrics,
    pub examples_used: usize,
}

impl fmt::Display for CrossValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, metrics) in self.folds.iter().enumerate() {
            writeln!(f, "fold {}: {metrics}", index + 1)?;
        }
        write!(f, "mean over {} folds: {}", self.folds.len(), self.mean)
    }
}

/// Scores the model's configuration with `DEFAULT_FOLDS` fresh networks.
///
/// `model` itself is never trained or modified.
pub fn cross_validate<'a, B: AutodiffBackend>(
    model: &TrainedModel<B>,
    sets: impl IntoIterator<Item = &'a TrainingSet>,
    product_type: &str,
    extractor: &FeatureExtractor,
) -> Result<CrossValidationReport> {
    let config = model.config();
    let gathered = gather_examples(sets, product_type, extractor, false)?;
    let splitter = KFold::new(DEFAULT_FOLDS, config.cv_seed);
    let folds = splitter.split(gathered.len())?;
    let plan = FitPlan::new(config.n_epochs, config.batch_size)
        .with_seed(config.cv_seed)
        .with_best_checkpoint(config.use_checkpoints);

    let mut scores = Vec::with_capacity(folds.len());
    for (index, fold) in folds.iter().enumerate() {
        let train: Vec<&ExtractedExample> =
            fold.train.iter().map(|&i| &gathered.examples[i]).collect();
        let held_out: Vec<&ExtractedExample> =
            fold.validation.iter().map(|&i| &gathered.examples[i]).collect();

        let (network, _) = fit(
            model.fresh_network(),
            &train,
            model.compile_spec(),
            &plan,
            model.device(),
        )?;
        let predictions = predict_rows(&network, &held_out, model.device());
        let targets: Vec<f32> = held_out
            .iter()
            .flat_map(|e| e.target.as_slice().iter().copied())
            .collect();
        let metrics = RegressionMetrics::compute(&predictions, &targets, model.output_dim())?;
        info!(
            fold = index + 1,
            train = train.len(),
            validation = held_out.len(),
            "{metrics}"
        );
        scores.push(metrics);
    }

    let mean = RegressionMetrics::mean(&scores)
        .ok_or_else(|| Error::InsufficientData("no fold was scored".to_string()))?;
    info!(product = product_type, "cross-validation mean: {mean}");
    Ok(CrossValidationReport {
        folds: scores,
        mean,
        examples_used: gathered.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_split_partitions_every_index_once() -> Result<()> {
        let folds = KFold::new(5, 42).split(12)?;
        assert_eq!(folds.len(), 5);

        let sizes: Vec<usize> = folds.iter().map(|f| f.validation.len()).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2, 2]);

        let mut seen = BTreeSet::new();
        for fold in &folds {
            assert_eq!(fold.train.len() + fold.validation.len(), 12);
            for index in &fold.validation {
                assert!(seen.insert(*index), "index {index} held out twice");
                assert!(!fold.train.contains(index));
            }
        }
        assert_eq!(seen.len(), 12);
        Ok(())
    }

    #[test]
    fn test_split_is_reproducible_per_seed() -> Result<()> {
        let first = KFold::new(5, 42).split(20)?;
        let second = KFold::new(5, 42).split(20)?;
        let other = KFold::new(5, 7).split(20)?;
        assert_eq!(first, second);
        assert_ne!(first, other);
        Ok(())
    }

    #[test]
    fn test_unshuffled_split_is_contiguous() -> Result<()> {
        let splitter = KFold {
            shuffle: false,
            ..KFold::new(5, 0)
        };
        let folds = splitter.split(10)?;
        assert_eq!(folds[0].validation, vec![0, 1]);
        assert_eq!(folds[4].validation, vec![8, 9]);
        Ok(())
    }

    #[test]
    fn test_too_few_examples() {
        assert!(matches!(
            KFold::default().split(4),
            Err(Error::InsufficientData(_))
        ));
        assert!(matches!(
            KFold::new(1, 42).split(10),
            Err(Error::InvalidConfig(_))
        ));
    }
}
