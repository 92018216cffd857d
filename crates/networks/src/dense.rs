//! Dense affine projections backed by candle [`Var`]s.
//!
//! Inputs are `(batch, input_dim)` and outputs `(batch, output_dim)`. Weights
//! are stored `(output_dim, input_dim)` in f32 so optimizer updates never need
//! a dtype round trip.

use candle_core::{DType, Device, Error, Result, Tensor, Var};

/// Weight initialisation policies.
#[derive(Debug, Clone)]
pub enum DenseInit {
    /// Xavier/Glorot uniform.
    XavierUniform,
    /// Kaiming/He uniform with the given leaky slope (0 for ReLU).
    KaimingUniform { negative_slope: f64 },
}

impl DenseInit {
    fn sample(&self, shape: (usize, usize), device: &Device) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let bound = match self {
            DenseInit::XavierUniform => (6.0f64 / (fan_in + fan_out)).sqrt(),
            DenseInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                3.0f64.sqrt() * gain / fan_in.sqrt()
            }
        };
        Tensor::rand(-bound as f32, bound as f32, shape, device)
    }
}

#[derive(Debug, Clone)]
pub struct Dense {
    weight: Var,
    bias: Option<Var>,
}

impl Dense {
    /// Wraps existing parameters. `weight` must be `(output_dim, input_dim)`
    /// and `bias`, when present, `(output_dim,)`.
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_dim, _) = weight.dims2()?;
        if let Some(bias) = bias.as_ref() {
            if bias.dims() != [out_dim] {
                return Err(Error::Msg(format!(
                    "dense bias expected shape [{out_dim}] got {:?}",
                    bias.dims()
                )));
            }
        }
        let weight = Var::from_tensor(&weight.to_dtype(DType::F32)?)?;
        let bias = match bias {
            Some(bias) => Some(Var::from_tensor(&bias.to_dtype(DType::F32)?)?),
            None => None,
        };
        Ok(Self { weight, bias })
    }

    pub fn with_init(
        input_dim: usize,
        output_dim: usize,
        bias: bool,
        init: &DenseInit,
        device: &Device,
    ) -> Result<Self> {
        let weight = init.sample((output_dim, input_dim), device)?;
        let bias = if bias {
            Some(Tensor::zeros(output_dim, DType::F32, device)?)
        } else {
            None
        };
        Self::new(weight, bias)
    }

    pub fn input_dim(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn output_dim(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, in_dim) = xs.dims2()?;
        if in_dim != self.input_dim() {
            return Err(Error::Msg(format!(
                "dense layer expects {} input features got {in_dim}",
                self.input_dim()
            )));
        }
        let out = xs.matmul(&self.weight.as_tensor().t()?)?;
        match &self.bias {
            Some(bias) => out.broadcast_add(bias.as_tensor()),
            None => Ok(out),
        }
    }

    /// Parameters named `{prefix}.weight` and `{prefix}.bias`.
    pub fn parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut params = vec![(format!("{prefix}.weight"), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push((format!("{prefix}.bias"), bias.clone()));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_applies_weight_and_bias() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::new(&[[1f32, 2.0], [0.0, -1.0], [3.0, 0.5]], &device)?;
        let bias = Tensor::new(&[0.5f32, 0.0, -1.0], &device)?;
        let dense = Dense::new(weight, Some(bias))?;

        let xs = Tensor::new(&[[1f32, 1.0]], &device)?;
        let out = dense.forward(&xs)?.to_vec2::<f32>()?;

        assert_eq!(out, vec![vec![3.5, -1.0, 2.5]]);
        Ok(())
    }

    #[test]
    fn rejects_mismatched_input() -> Result<()> {
        let device = Device::Cpu;
        let dense = Dense::with_init(4, 2, true, &DenseInit::XavierUniform, &device)?;
        let xs = Tensor::zeros((3, 5), DType::F32, &device)?;
        assert!(dense.forward(&xs).is_err());
        Ok(())
    }

    #[test]
    fn kaiming_samples_stay_within_bound() -> Result<()> {
        let device = Device::Cpu;
        let dense = Dense::with_init(
            64,
            8,
            false,
            &DenseInit::KaimingUniform { negative_slope: 0.0 },
            &device,
        )?;
        let bound = (6.0f32 / 64.0).sqrt();
        let max = dense.weight.as_tensor().abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(max <= bound);
        assert_eq!(dense.parameters("fc").len(), 1);
        Ok(())
    }
}
