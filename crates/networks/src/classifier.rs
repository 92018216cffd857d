use candle_core::{Device, Error, Result, Tensor, Var};
use candle_nn::ops;

use crate::{
    config::ArchitectureConfig,
    dense::{Dense, DenseInit},
    DomainModule,
};

/// Classifier head mapping generator features to class logits.
///
/// Hidden layers run `dropout -> dense -> relu`; the output layer is a plain
/// projection, so the forward pass returns unnormalised logits.
pub struct Classifier {
    hidden: Vec<Dense>,
    head: Dense,
    dropout: f32,
    training: bool,
}

impl Classifier {
    pub fn new(config: &ArchitectureConfig, device: &Device) -> Result<Self> {
        let relu_init = DenseInit::KaimingUniform { negative_slope: 0.0 };
        let mut widths = vec![config.feature_dim];
        widths.extend(&config.classifier_hidden);

        let hidden = widths
            .windows(2)
            .map(|pair| Dense::with_init(pair[0], pair[1], true, &relu_init, device))
            .collect::<Result<Vec<_>>>()?;
        let last_width = *widths.last().unwrap_or(&config.feature_dim);
        let head = Dense::with_init(
            last_width,
            config.num_classes,
            true,
            &DenseInit::XavierUniform,
            device,
        )?;
        Self::from_layers(hidden, head, config.dropout)
    }

    pub fn from_layers(hidden: Vec<Dense>, head: Dense, dropout: f32) -> Result<Self> {
        let mut expected = hidden.first().map(Dense::input_dim);
        for layer in hidden.iter().chain(std::iter::once(&head)) {
            if let Some(width) = expected {
                if width != layer.input_dim() {
                    return Err(Error::Msg(format!(
                        "classifier layer expects {} inputs but previous layer yields {width}",
                        layer.input_dim()
                    )));
                }
            }
            expected = Some(layer.output_dim());
        }
        Ok(Self {
            hidden,
            head,
            dropout,
            training: true,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.head.output_dim()
    }
}

impl DomainModule for Classifier {
    fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let mut hidden = features.clone();
        for layer in &self.hidden {
            if self.training && self.dropout > 0.0 {
                hidden = ops::dropout(&hidden, self.dropout)?;
            }
            hidden = layer.forward(&hidden)?.relu()?;
        }
        self.head.forward(&hidden)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        let mut params: Vec<_> = self
            .hidden
            .iter()
            .enumerate()
            .flat_map(|(idx, layer)| layer.parameters(&format!("classifier.fc{idx}")))
            .collect();
        params.extend(self.head.parameters("classifier.head"));
        params
    }
}
