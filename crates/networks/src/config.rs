use candle_core::{Error, Result};

/// Layer sizes for one source/target pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchitectureConfig {
    pub channels: usize,
    pub image_size: usize,
    pub generator_hidden: Vec<usize>,
    pub feature_dim: usize,
    pub classifier_hidden: Vec<usize>,
    pub num_classes: usize,
    pub dropout: f32,
}

impl ArchitectureConfig {
    /// Picks the preset for a domain pair. USPS on either side selects the
    /// small digit network, otherwise the source domain decides.
    pub fn for_domains(source: &str, target: &str) -> Result<Self> {
        let source = source.to_ascii_lowercase();
        let target = target.to_ascii_lowercase();
        if source == "usps" || target == "usps" {
            return Ok(Self {
                channels: 1,
                image_size: 28,
                generator_hidden: vec![1024],
                feature_dim: 512,
                classifier_hidden: vec![256],
                num_classes: 10,
                dropout: 0.5,
            });
        }
        match source.as_str() {
            "svhn" => Ok(Self {
                channels: 3,
                image_size: 32,
                generator_hidden: vec![2048, 2048],
                feature_dim: 1024,
                classifier_hidden: vec![512],
                num_classes: 10,
                dropout: 0.5,
            }),
            "synth" => Ok(Self {
                channels: 3,
                image_size: 40,
                generator_hidden: vec![2048],
                feature_dim: 1024,
                classifier_hidden: vec![512],
                num_classes: 43,
                dropout: 0.5,
            }),
            _ => Err(Error::Msg(format!(
                "no architecture registered for domain pair {source} -> {target}"
            ))),
        }
    }

    /// Flattened length of one input image.
    pub fn input_dim(&self) -> usize {
        self.channels * self.image_size * self.image_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.image_size == 0 {
            return Err(Error::Msg("image shape must be non-empty".into()));
        }
        if self.feature_dim == 0 {
            return Err(Error::Msg("feature_dim must be greater than zero".into()));
        }
        if self.num_classes < 2 {
            return Err(Error::Msg("num_classes must be at least 2".into()));
        }
        if self.generator_hidden.iter().chain(&self.classifier_hidden).any(|&w| w == 0) {
            return Err(Error::Msg("hidden widths must be greater than zero".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Msg("dropout must be in [0, 1)".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usps_on_either_side_selects_digit_preset() {
        let forward = ArchitectureConfig::for_domains("usps", "mnist").unwrap();
        let backward = ArchitectureConfig::for_domains("mnist", "usps").unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward.input_dim(), 784);
    }

    #[test]
    fn synth_to_gtsrb_has_43_classes() {
        let config = ArchitectureConfig::for_domains("synth", "gtsrb").unwrap();
        assert_eq!(config.num_classes, 43);
        assert_eq!(config.input_dim(), 3 * 40 * 40);
    }

    #[test]
    fn unknown_pair_is_rejected() {
        assert!(ArchitectureConfig::for_domains("mnist", "svhn").is_err());
    }
}
