//! Disagreement measures between two predicted class distributions.
//!
//! All inputs are `(batch, num_classes)` probability tensors. The symmetric KL
//! policy cuts the gradient through each term's target with [`Detached`], so
//! every distribution only receives gradient from the term where it is the
//! input.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops;

/// Added inside the logarithm of [`entropy`] to keep `ln(0)` out of the graph.
pub const ENTROPY_EPSILON: f64 = 1e-6;

/// A tensor cut from the autograd graph.
///
/// Backpropagation never reaches the tensor this was built from, whatever the
/// detached value is later combined with.
#[derive(Debug, Clone)]
pub struct Detached(Tensor);

impl Detached {
    pub fn new(tensor: &Tensor) -> Self {
        Self(tensor.detach())
    }

    pub fn as_tensor(&self) -> &Tensor {
        &self.0
    }

    /// Reads a zero-dimensional value back to the host.
    pub fn to_scalar(&self) -> Result<f32> {
        self.0.to_dtype(DType::F32)?.to_scalar::<f32>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscrepancyMode {
    /// Average of the two KL terms with detached targets.
    SymmetricKl,
    /// `mean(|p - q|)`.
    AbsoluteDifference,
    /// Entropy of the first distribution; the second is ignored.
    Entropy,
}

impl DiscrepancyMode {
    /// Entropy takes precedence over the absolute-difference flag.
    pub fn from_flags(entropy: bool, use_abs_diff: bool) -> Self {
        if entropy {
            DiscrepancyMode::Entropy
        } else if use_abs_diff {
            DiscrepancyMode::AbsoluteDifference
        } else {
            DiscrepancyMode::SymmetricKl
        }
    }

    /// Scalar discrepancy that stays attached to the graph of its inputs.
    pub fn compute(self, dist1: &Tensor, dist2: &Tensor) -> Result<Tensor> {
        match self {
            DiscrepancyMode::Entropy => entropy(dist1),
            DiscrepancyMode::AbsoluteDifference => (dist1 - dist2)?.abs()?.mean_all(),
            DiscrepancyMode::SymmetricKl => {
                let forward = kl_div(
                    &ops::log_softmax(dist1, D::Minus1)?,
                    &Detached::new(dist2),
                )?;
                let backward = kl_div(
                    &ops::log_softmax(dist2, D::Minus1)?,
                    &Detached::new(dist1),
                )?;
                (forward + backward)?.affine(0.5, 0.0)
            }
        }
    }

    /// Same value as [`compute`](Self::compute) for values already cut from the graph.
    pub fn measure(self, dist1: &Detached, dist2: &Detached) -> Result<f32> {
        Detached::new(&self.compute(dist1.as_tensor(), dist2.as_tensor())?).to_scalar()
    }
}

/// `-mean(p * ln(p + eps))` over every element.
pub fn entropy(probs: &Tensor) -> Result<Tensor> {
    let log = probs.affine(1.0, ENTROPY_EPSILON)?.log()?;
    probs.mul(&log)?.mean_all()?.neg()
}

/// Element-mean `target * (ln(target) - log_input)` with `0 * ln(0) = 0`.
pub fn kl_div(log_input: &Tensor, target: &Detached) -> Result<Tensor> {
    let target = target.as_tensor();
    let log_target = target.maximum(f32::MIN_POSITIVE)?.log()?;
    target.mul(&(log_target - log_input)?)?.mean_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn probs(rows: &[[f32; 3]]) -> Tensor {
        Tensor::from_vec(rows.concat(), (rows.len(), 3), &Device::Cpu).unwrap()
    }

    fn scalar(tensor: Tensor) -> f32 {
        tensor.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn entropy_is_non_negative() -> Result<()> {
        let logits = Tensor::randn(0f32, 3.0, (16, 10), &Device::Cpu)?;
        let p = ops::softmax(&logits, D::Minus1)?;
        assert!(scalar(entropy(&p)?) >= 0.0);
        Ok(())
    }

    #[test]
    fn entropy_of_one_hot_is_zero() -> Result<()> {
        let p = probs(&[[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]);
        assert!(scalar(entropy(&p)?).abs() < 1e-5);

        let uniform = probs(&[[1.0 / 3.0; 3]]);
        assert!(scalar(entropy(&uniform)?) > 0.3);
        Ok(())
    }

    #[test]
    fn divergence_modes_are_symmetric() -> Result<()> {
        let a = probs(&[[0.7, 0.2, 0.1], [0.1, 0.1, 0.8]]);
        let b = probs(&[[0.3, 0.3, 0.4], [0.5, 0.25, 0.25]]);
        for mode in [DiscrepancyMode::SymmetricKl, DiscrepancyMode::AbsoluteDifference] {
            let ab = scalar(mode.compute(&a, &b)?);
            let ba = scalar(mode.compute(&b, &a)?);
            assert!((ab - ba).abs() < 1e-6, "{mode:?}: {ab} vs {ba}");
            assert!(ab > 0.0);
        }
        Ok(())
    }

    #[test]
    fn absolute_difference_of_identical_inputs_is_zero() -> Result<()> {
        let a = probs(&[[0.6, 0.3, 0.1]]);
        assert_eq!(scalar(DiscrepancyMode::AbsoluteDifference.compute(&a, &a)?), 0.0);
        Ok(())
    }

    #[test]
    fn kl_self_discrepancy_reflects_double_normalisation() -> Result<()> {
        let uniform = Tensor::new(&[[0.5f32, 0.5]], &Device::Cpu)?;
        let at_uniform = scalar(DiscrepancyMode::SymmetricKl.compute(&uniform, &uniform)?);
        assert!(at_uniform.abs() < 1e-6);

        // log_softmax([1, 0]) = [1 - ln(1 + e), -ln(1 + e)]
        let one_hot = Tensor::new(&[[1f32, 0.0]], &Device::Cpu)?;
        let expected = ((1.0f32 + std::f32::consts::E).ln() - 1.0) / 2.0;
        let got = scalar(DiscrepancyMode::SymmetricKl.compute(&one_hot, &one_hot)?);
        assert!((got - expected).abs() < 1e-5, "{got} vs {expected}");
        Ok(())
    }

    #[test]
    fn entropy_mode_ignores_second_distribution() -> Result<()> {
        let a = probs(&[[0.6, 0.3, 0.1]]);
        let b = probs(&[[0.1, 0.1, 0.8]]);
        let c = probs(&[[1.0, 0.0, 0.0]]);
        let mode = DiscrepancyMode::from_flags(true, true);
        assert_eq!(mode, DiscrepancyMode::Entropy);
        assert_eq!(scalar(mode.compute(&a, &b)?), scalar(mode.compute(&a, &c)?));
        Ok(())
    }

    #[test]
    fn detached_target_receives_no_gradient() -> Result<()> {
        let device = Device::Cpu;
        let target = Var::new(&[[0.2f32, 0.8]], &device)?;
        let input = Var::new(&[[0.4f32, 0.6]], &device)?;

        let log_input = ops::log_softmax(input.as_tensor(), D::Minus1)?;
        let loss = kl_div(&log_input, &Detached::new(target.as_tensor()))?;
        let grads = loss.backward()?;

        assert!(grads.get(input.as_tensor()).is_some());
        assert!(grads.get(target.as_tensor()).is_none());
        Ok(())
    }

    #[test]
    fn measure_matches_compute() -> Result<()> {
        let a = probs(&[[0.7, 0.2, 0.1]]);
        let b = probs(&[[0.2, 0.2, 0.6]]);
        let mode = DiscrepancyMode::SymmetricKl;
        let attached = scalar(mode.compute(&a, &b)?);
        let detached = mode.measure(&Detached::new(&a), &Detached::new(&b))?;
        assert_eq!(attached, detached);
        Ok(())
    }
}
