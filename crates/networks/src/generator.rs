use candle_core::{Device, Error, Result, Tensor, Var};
use candle_nn::ops;

use crate::{
    config::ArchitectureConfig,
    dense::{Dense, DenseInit},
    DomainModule,
};

/// Shared feature extractor: flattens images and applies a ReLU dense stack.
pub struct Generator {
    layers: Vec<Dense>,
    dropout: f32,
    training: bool,
}

impl Generator {
    pub fn new(config: &ArchitectureConfig, device: &Device) -> Result<Self> {
        let init = DenseInit::KaimingUniform { negative_slope: 0.0 };
        let mut widths = vec![config.input_dim()];
        widths.extend(&config.generator_hidden);
        widths.push(config.feature_dim);

        let layers = widths
            .windows(2)
            .map(|pair| Dense::with_init(pair[0], pair[1], true, &init, device))
            .collect::<Result<Vec<_>>>()?;
        Self::from_layers(layers, config.dropout)
    }

    /// Assembles a generator from explicit layers. Dropout is applied between
    /// layers, never after the last one.
    pub fn from_layers(layers: Vec<Dense>, dropout: f32) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::Msg("generator requires at least one layer".into()));
        }
        for pair in layers.windows(2) {
            if pair[0].output_dim() != pair[1].input_dim() {
                return Err(Error::Msg(format!(
                    "generator layer widths do not chain ({} -> {})",
                    pair[0].output_dim(),
                    pair[1].input_dim()
                )));
            }
        }
        Ok(Self {
            layers,
            dropout,
            training: true,
        })
    }

    pub fn feature_dim(&self) -> usize {
        self.layers.last().map_or(0, Dense::output_dim)
    }
}

impl DomainModule for Generator {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let mut hidden = images.flatten_from(1)?;
        let last = self.layers.len() - 1;
        for (idx, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden)?.relu()?;
            if idx != last && self.training && self.dropout > 0.0 {
                hidden = ops::dropout(&hidden, self.dropout)?;
            }
        }
        Ok(hidden)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(idx, layer)| layer.parameters(&format!("generator.fc{idx}")))
            .collect()
    }
}
