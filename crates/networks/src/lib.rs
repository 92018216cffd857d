//! Feature generator and classifier heads used by the adaptation solver.
//!
//! Every module exposes its trainable state as named [`Var`]s so optimizers and
//! checkpoints can address parameters without knowing the architecture.

pub mod classifier;
pub mod config;
pub mod dense;
pub mod generator;

use candle_core::{Device, Result, Tensor, Var};

pub use classifier::Classifier;
pub use config::ArchitectureConfig;
pub use dense::{Dense, DenseInit};
pub use generator::Generator;

/// A trainable network taking part in adaptation.
pub trait DomainModule {
    /// Runs the forward pass on a batch whose leading dimension is the batch size.
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    /// Switches between training behaviour (dropout active) and inference.
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Named parameters in a stable order.
    fn parameters(&self) -> Vec<(String, Var)>;
}

/// The three networks of a domain pair, placed on `device`.
pub struct ModuleSet {
    pub generator: Generator,
    pub c1: Classifier,
    pub c2: Classifier,
}

/// Builds a generator and two independently initialised classifiers for
/// `source -> target`.
pub fn build_modules(source: &str, target: &str, device: &Device) -> Result<ModuleSet> {
    let config = ArchitectureConfig::for_domains(source, target)?;
    build_modules_with_config(&config, device)
}

pub fn build_modules_with_config(config: &ArchitectureConfig, device: &Device) -> Result<ModuleSet> {
    config.validate()?;
    Ok(ModuleSet {
        generator: Generator::new(config, device)?,
        c1: Classifier::new(config, device)?,
        c2: Classifier::new(config, device)?,
    })
}
