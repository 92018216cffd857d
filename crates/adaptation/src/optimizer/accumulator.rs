use candle_core::{backprop::GradStore, Tensor};

use crate::{optimizer::TrainerOptimizer, TrainingError};

/// Holds the gradients of at most one backward pass.
///
/// A new backward pass is refused until [`clear`](Self::clear) has run, so
/// gradients from one update stage can never be consumed by the next.
#[derive(Default)]
pub struct GradientAccumulator {
    store: Option<GradStore>,
}

impl GradientAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backward(&mut self, loss: &Tensor) -> Result<&mut GradStore, TrainingError> {
        if self.store.is_some() {
            return Err(TrainingError::runtime(
                "backward pass requested before previous gradients were cleared",
            ));
        }
        let grads = loss.backward()?;
        Ok(self.store.insert(grads))
    }

    pub fn is_clear(&self) -> bool {
        self.store.is_none()
    }

    /// Zeroes the gradients of every listed optimizer and releases the store.
    pub fn clear(&mut self, optimizers: &[&TrainerOptimizer]) {
        if let Some(mut store) = self.store.take() {
            for optimizer in optimizers {
                optimizer.zero_grad(&mut store);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn second_backward_requires_clear() -> Result<(), TrainingError> {
        let w = Var::new(&[1f32, 2.0], &Device::Cpu)?;
        let loss = w.as_tensor().sqr()?.sum_all()?;
        let mut grads = GradientAccumulator::new();

        grads.backward(&loss)?;
        assert!(!grads.is_clear());
        assert!(grads.backward(&loss).is_err());

        grads.clear(&[]);
        assert!(grads.is_clear());
        assert!(grads.backward(&loss).is_ok());
        Ok(())
    }
}
