use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Mean cross entropy over a `(batch, num_classes)` logit tensor.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    /// Graph-attached mean loss only; nothing is read back to the host.
    pub fn loss(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
        let (batch, num_classes) = logits.dims2()?;
        if batch == 0 {
            return Err(TrainingError::runtime(
                "no samples available for loss computation",
            ));
        }
        if num_classes == 0 {
            return Err(TrainingError::runtime(
                "logits class dimension must be greater than zero",
            ));
        }
        let targets = labels_as_indices(targets, batch)?;
        let log_probs = ops::log_softmax(logits, D::Minus1)?;
        Ok(gather_targets(&log_probs, &targets)?.mean_all()?.neg()?)
    }

    /// [`loss`](Self::loss) plus host-side metrics for reporting.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let loss = self.loss(logits, targets)?;
        let (batch, _) = logits.dims2()?;
        let average_loss = loss.to_scalar::<f32>()?;
        let correct = count_correct(logits, targets)?;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                samples: batch,
                correct,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    samples: usize,
    correct: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn correct(&self) -> usize {
        self.correct
    }

    pub fn accuracy(&self) -> f32 {
        if self.samples == 0 {
            0.0
        } else {
            self.correct as f32 / self.samples as f32
        }
    }
}

/// Batch-mean negative log-likelihood: `-mean(outputs[i, target_i])`.
///
/// `outputs` is consumed as given, so callers decide whether it holds
/// log-probabilities or raw scores.
pub fn nll_loss_mean(outputs: &Tensor, targets: &Tensor) -> Result<f64, TrainingError> {
    let (batch, _) = outputs.dims2()?;
    if batch == 0 {
        return Err(TrainingError::runtime("no samples available for nll loss"));
    }
    let targets = labels_as_indices(targets, batch)?;
    let picked = gather_targets(outputs, &targets)?;
    let mean = picked.to_dtype(DType::F64)?.mean_all()?.neg()?.to_scalar::<f64>()?;
    Ok(mean)
}

/// Number of rows whose arg-max matches the label.
pub fn count_correct(outputs: &Tensor, targets: &Tensor) -> Result<usize, TrainingError> {
    let (batch, _) = outputs.dims2()?;
    let targets = labels_as_indices(targets, batch)?;
    let predictions = outputs.argmax(D::Minus1)?;
    let correct = predictions
        .eq(&targets)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(correct as usize)
}

/// Flattens labels to a `(batch,)` u32 tensor on the device of the caller.
pub fn labels_as_indices(targets: &Tensor, batch: usize) -> Result<Tensor, TrainingError> {
    if targets.elem_count() != batch {
        return Err(TrainingError::runtime(format!(
            "expected {} labels got {}",
            batch,
            targets.elem_count()
        )));
    }
    let flat = targets.flatten_all()?;
    match flat.dtype() {
        DType::U32 => Ok(flat),
        DType::I64 | DType::U8 => Ok(flat.to_dtype(DType::U32)?),
        dtype => Err(TrainingError::runtime(format!(
            "unsupported label dtype {:?}",
            dtype
        ))),
    }
}

fn gather_targets(values: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
    let indices = targets.unsqueeze(1)?;
    Ok(values.gather(&indices, 1)?.squeeze(1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn cross_entropy_matches_hand_computation() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[2f32, 0.0], [0.0, 1.0]], &device)?;
        let labels = Tensor::new(&[0u32, 0], &device)?;

        let output = CrossEntropyLoss::new().compute(&logits, &labels)?;

        let first = (1.0f32 + (-2.0f32).exp()).ln();
        let second = (1.0f32 + 1.0f32.exp()).ln();
        let expected = (first + second) / 2.0;
        assert!((output.metrics.average_loss() - expected).abs() < 1e-5);
        assert_eq!(output.metrics.correct(), 1);
        assert_eq!(output.metrics.accuracy(), 0.5);
        Ok(())
    }

    #[test]
    fn nll_averages_selected_entries() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let outputs = Tensor::new(&[[-0.5f32, -1.0], [-2.0, -0.25]], &device)?;
        let labels = Tensor::new(&[1i64, 1], &device)?;
        assert!((nll_loss_mean(&outputs, &labels)? - 0.625).abs() < 1e-9);
        assert_eq!(count_correct(&outputs, &labels)?, 1);
        Ok(())
    }

    #[test]
    fn loss_only_path_matches_full_compute() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0.3f32, -1.2, 2.0], [1.0, 0.0, -0.5]], &device)?;
        let labels = Tensor::new(&[2u32, 1], &device)?;
        let criterion = CrossEntropyLoss::new();

        let loss = criterion.loss(&logits, &labels)?.to_scalar::<f32>()?;
        let full = criterion.compute(&logits, &labels)?;
        assert_eq!(loss, full.metrics.average_loss());
        assert_eq!(full.loss.to_scalar::<f32>()?, loss);
        Ok(())
    }

    #[test]
    fn label_count_must_match_batch() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((3, 4), DType::F32, &device)?;
        let labels = Tensor::new(&[0u32, 1], &device)?;
        assert!(CrossEntropyLoss::new().compute(&logits, &labels).is_err());
        Ok(())
    }
}
