pub mod accumulator;

pub use accumulator::GradientAccumulator;

use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{config, TrainingError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerConfig {
    MomentumSgd(SgdConfig),
    Adam(AdamConfig),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl TryFrom<&config::OptimizerConfig> for OptimizerConfig {
    type Error = TrainingError;

    fn try_from(value: &config::OptimizerConfig) -> Result<Self, Self::Error> {
        if !value.learning_rate.is_finite() || value.learning_rate <= 0.0 {
            return Err(TrainingError::initialization(format!(
                "learning rate must be positive and finite (got {})",
                value.learning_rate
            )));
        }
        Ok(match value.kind {
            config::OptimizerType::Momentum => OptimizerConfig::MomentumSgd(SgdConfig {
                learning_rate: value.learning_rate,
                momentum: value.momentum,
                weight_decay: config::WEIGHT_DECAY,
            }),
            config::OptimizerType::Adam => OptimizerConfig::Adam(AdamConfig {
                learning_rate: value.learning_rate,
                beta1: value.beta1,
                beta2: value.beta2,
                epsilon: value.epsilon,
                weight_decay: config::WEIGHT_DECAY,
            }),
        })
    }
}

/// Update rule bound to exactly one module's parameters.
///
/// Weight decay is the coupled L2 form: it is added to the gradient before
/// momentum or moment estimation.
#[derive(Debug)]
pub struct TrainerOptimizer {
    label: String,
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    state: SlotState,
}

#[derive(Debug)]
enum SlotState {
    Sgd {
        momentum_buffer: Option<Tensor>,
    },
    Adam {
        first_moment: Tensor,
        second_moment: Tensor,
        steps: i32,
    },
}

impl TrainerOptimizer {
    pub fn new(
        label: impl Into<String>,
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        let label = label.into();
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(format!(
                "optimizer for {label} requires at least one parameter"
            )));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer for {label} expects f32 parameter '{}' got {:?}",
                    name,
                    tensor.dtype()
                )));
            }
            let state = match config {
                OptimizerConfig::MomentumSgd(_) => SlotState::Sgd {
                    momentum_buffer: None,
                },
                OptimizerConfig::Adam(_) => SlotState::Adam {
                    first_moment: tensor.zeros_like()?,
                    second_moment: tensor.zeros_like()?,
                    steps: 0,
                },
            };
            params.push(ParameterSlot {
                name,
                param: var,
                state,
            });
        }

        Ok(Self {
            label,
            config,
            params,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::MomentumSgd(cfg) => cfg.learning_rate,
            OptimizerConfig::Adam(cfg) => cfg.learning_rate,
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    /// Applies one update to every bound parameter that has a gradient in
    /// `grads`, consuming those gradients. Parameters without a gradient are
    /// left untouched. Returns the number of parameters updated.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<usize, TrainingError> {
        let mut updated = 0;
        for slot in &mut self.params {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let param = slot.param.as_tensor().detach();
            let grad = grad.to_dtype(DType::F32)?;
            if grad.dims() != param.dims() {
                return Err(TrainingError::runtime(format!(
                    "{}: gradient shape {:?} does not match parameter '{}' {:?}",
                    self.label,
                    grad.dims(),
                    slot.name,
                    param.dims()
                )));
            }

            let next = match (self.config, &mut slot.state) {
                (OptimizerConfig::MomentumSgd(cfg), SlotState::Sgd { momentum_buffer }) => {
                    sgd_update(cfg, &param, &grad, momentum_buffer)?
                }
                (
                    OptimizerConfig::Adam(cfg),
                    SlotState::Adam {
                        first_moment,
                        second_moment,
                        steps,
                    },
                ) => {
                    *steps += 1;
                    adam_update(cfg, &param, &grad, first_moment, second_moment, *steps)?
                }
                _ => {
                    return Err(TrainingError::runtime(format!(
                        "{}: optimizer state does not match its configuration",
                        self.label
                    )))
                }
            };
            slot.param.set(&next)?;
            updated += 1;
        }
        Ok(updated)
    }

    /// Drops any gradient recorded for this optimizer's parameters.
    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }
}

fn decayed_gradient(grad: &Tensor, param: &Tensor, weight_decay: f64) -> candle_core::Result<Tensor> {
    if weight_decay == 0.0 {
        Ok(grad.clone())
    } else {
        grad + param.affine(weight_decay, 0.0)?
    }
}

fn sgd_update(
    cfg: SgdConfig,
    param: &Tensor,
    grad: &Tensor,
    momentum_buffer: &mut Option<Tensor>,
) -> Result<Tensor, TrainingError> {
    let mut direction = decayed_gradient(grad, param, cfg.weight_decay)?;
    if cfg.momentum != 0.0 {
        let buffer = match momentum_buffer.take() {
            Some(prev) => (prev.affine(cfg.momentum, 0.0)? + &direction)?,
            None => direction.clone(),
        };
        direction = buffer.clone();
        *momentum_buffer = Some(buffer);
    }
    Ok((param - direction.affine(cfg.learning_rate, 0.0)?)?)
}

fn adam_update(
    cfg: AdamConfig,
    param: &Tensor,
    grad: &Tensor,
    first_moment: &mut Tensor,
    second_moment: &mut Tensor,
    step: i32,
) -> Result<Tensor, TrainingError> {
    let grad = decayed_gradient(grad, param, cfg.weight_decay)?;

    let new_m = (first_moment.affine(cfg.beta1, 0.0)? + grad.affine(1.0 - cfg.beta1, 0.0)?)?;
    let new_v =
        (second_moment.affine(cfg.beta2, 0.0)? + grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

    let bias_correction1 = 1.0 - cfg.beta1.powi(step);
    let bias_correction2 = 1.0 - cfg.beta2.powi(step);

    let denom = new_v
        .sqrt()?
        .affine(1.0 / bias_correction2.sqrt(), cfg.epsilon)?;
    let update = new_m
        .div(&denom)?
        .affine(cfg.learning_rate / bias_correction1, 0.0)?;

    *first_moment = new_m;
    *second_moment = new_v;
    Ok((param - update)?)
}
