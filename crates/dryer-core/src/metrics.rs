//! Regression metrics and training history.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::MetricKind;
use crate::error::{Error, Result};

/// Error metrics over a set of multi-output predictions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    /// Mean squared error over every element
    pub mse: f64,
    /// Mean absolute error over every element
    pub mae: f64,
    /// Coefficient of determination, averaged over output columns
    pub r2: f64,
}

impl RegressionMetrics {
    /// Computes metrics from row-major `[rows, width]` buffers.
    ///
    /// A column whose target is constant scores 1.0 when predicted exactly
    /// and 0.0 otherwise, so single-sample folds still yield a finite R².
    pub fn compute(predictions: &[f32], targets: &[f32], width: usize) -> Result<Self> {
        if width == 0 || predictions.len() != targets.len() || predictions.len() % width != 0 {
            return Err(Error::InsufficientData(format!(
                "cannot score {} predictions against {} targets of width {width}",
                predictions.len(),
                targets.len()
            )));
        }
        let rows = predictions.len() / width;
        if rows == 0 {
            return Err(Error::InsufficientData("no samples to score".to_string()));
        }

        let count = predictions.len() as f64;
        let mut squared = 0.0;
        let mut absolute = 0.0;
        for (p, t) in predictions.iter().zip(targets) {
            let diff = f64::from(*p) - f64::from(*t);
            squared += diff * diff;
            absolute += diff.abs();
        }

        let mut r2_sum = 0.0;
        for col in 0..width {
            let column = |buf: &[f32], row: usize| f64::from(buf[row * width + col]);
            let mean = (0..rows).map(|r| column(targets, r)).sum::<f64>() / rows as f64;
            let mut ss_res = 0.0;
            let mut ss_tot = 0.0;
            for r in 0..rows {
                let t = column(targets, r);
                let p = column(predictions, r);
                ss_res += (t - p).powi(2);
                ss_tot += (t - mean).powi(2);
            }
            r2_sum += if ss_tot > 0.0 {
                1.0 - ss_res / ss_tot
            } else if ss_res == 0.0 {
                1.0
            } else {
                0.0
            };
        }

        Ok(Self {
            mse: squared / count,
            mae: absolute / count,
            r2: r2_sum / width as f64,
        })
    }

    /// Averages each metric across folds.
    pub fn mean(reports: &[RegressionMetrics]) -> Option<Self> {
        if reports.is_empty() {
            return None;
        }
        let n = reports.len() as f64;
        Some(Self {
            mse: reports.iter().map(|m| m.mse).sum::<f64>() / n,
            mae: reports.iter().map(|m| m.mae).sum::<f64>() / n,
            r2: reports.iter().map(|m| m.r2).sum::<f64>() / n,
        })
    }

    pub fn rmse(&self) -> f64 {
        self.mse.sqrt()
    }

    pub fn get(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::Mae => self.mae,
            MetricKind::Mse => self.mse,
            MetricKind::Rmse => self.rmse(),
        }
    }
}

impl fmt::Display for RegressionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MSE {:.4} | MAE {:.4} | R² {:.4}", self.mse, self.mae, self.r2)
    }
}

/// Loss and configured metrics for one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub loss: f64,
    pub metrics: Vec<(MetricKind, f64)>,
}

impl fmt::Display for EpochReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch {} loss {:.4}", self.epoch, self.loss)?;
        for (kind, value) in &self.metrics {
            write!(f, " {kind} {value:.4}")?;
        }
        Ok(())
    }
}

/// Per-epoch history of one training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochReport>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, report: EpochReport) {
        self.epochs.push(report);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn final_loss(&self) -> Option<f64> {
        self.epochs.last().map(|e| e.loss)
    }

    /// Epoch with the lowest loss; the earliest wins a tie.
    pub fn best_epoch(&self) -> Option<&EpochReport> {
        self.epochs
            .iter()
            .filter(|e| e.loss.is_finite())
            .fold(None, |best: Option<&EpochReport>, e| match best {
                Some(b) if b.loss <= e.loss => Some(b),
                _ => Some(e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_predictions() {
        let targets = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let m = RegressionMetrics::compute(&targets, &targets, 2).unwrap();
        assert_eq!(m.mse, 0.0);
        assert_eq!(m.mae, 0.0);
        assert_eq!(m.r2, 1.0);
    }

    #[test]
    fn test_known_values() {
        // one column: targets 1,2,3 predictions 2,2,2
        let m = RegressionMetrics::compute(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0], 1).unwrap();
        assert!((m.mse - 2.0 / 3.0).abs() < 1e-9);
        assert!((m.mae - 2.0 / 3.0).abs() < 1e-9);
        assert!(m.r2.abs() < 1e-9);
    }

    #[test]
    fn test_constant_column_r2() {
        let exact = RegressionMetrics::compute(&[5.0], &[5.0], 1).unwrap();
        assert_eq!(exact.r2, 1.0);
        let off = RegressionMetrics::compute(&[4.0], &[5.0], 1).unwrap();
        assert_eq!(off.r2, 0.0);
    }

    #[test]
    fn test_shape_mismatch() {
        assert!(RegressionMetrics::compute(&[1.0, 2.0], &[1.0], 1).is_err());
        assert!(RegressionMetrics::compute(&[], &[], 11).is_err());
    }

    #[test]
    fn test_mean_across_folds() {
        let folds = [
            RegressionMetrics { mse: 1.0, mae: 0.5, r2: 0.8 },
            RegressionMetrics { mse: 3.0, mae: 1.5, r2: 0.4 },
        ];
        let mean = RegressionMetrics::mean(&folds).unwrap();
        assert_eq!(mean.mse, 2.0);
        assert_eq!(mean.mae, 1.0);
        assert!((mean.r2 - 0.6).abs() < 1e-12);
        assert!(RegressionMetrics::mean(&[]).is_none());
    }

    #[test]
    fn test_history_best_epoch() {
        let mut history = TrainingHistory::new();
        for (epoch, loss) in [(1, 3.0), (2, 1.0), (3, 1.0), (4, 2.0)] {
            history.push(EpochReport { epoch, loss, metrics: vec![(MetricKind::Mae, loss)] });
        }
        assert_eq!(history.best_epoch().map(|e| e.epoch), Some(2));
        assert_eq!(history.final_loss(), Some(2.0));
        assert_eq!(history.len(), 4);
    }
}
