use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use networks::{
    build_modules, build_modules_with_config, ArchitectureConfig, Classifier, Dense,
    DomainModule, Generator,
};

fn tiny_config() -> ArchitectureConfig {
    ArchitectureConfig {
        channels: 1,
        image_size: 4,
        generator_hidden: vec![12],
        feature_dim: 8,
        classifier_hidden: vec![6],
        num_classes: 3,
        dropout: 0.5,
    }
}

#[test]
fn generator_and_heads_produce_logits() -> Result<()> {
    let device = Device::Cpu;
    let modules = build_modules_with_config(&tiny_config(), &device)?;
    let images = Tensor::rand(0f32, 1f32, (5, 1, 4, 4), &device)?;

    let features = modules.generator.forward(&images)?;
    assert_eq!(features.dims(), &[5, 8]);

    let logits = modules.c1.forward(&features)?;
    assert_eq!(logits.dims(), &[5, 3]);
    assert_eq!(logits.dtype(), DType::F32);
    Ok(())
}

#[test]
fn inference_mode_is_deterministic() -> Result<()> {
    let device = Device::Cpu;
    let mut modules = build_modules_with_config(&tiny_config(), &device)?;
    modules.generator.set_training(false);
    modules.c1.set_training(false);
    assert!(!modules.c1.is_training());

    let images = Tensor::rand(0f32, 1f32, (4, 1, 4, 4), &device)?;
    let first = modules.c1.forward(&modules.generator.forward(&images)?)?;
    let second = modules.c1.forward(&modules.generator.forward(&images)?)?;

    assert_eq!(first.to_vec2::<f32>()?, second.to_vec2::<f32>()?);
    Ok(())
}

#[test]
fn heads_are_initialised_independently() -> Result<()> {
    let modules = build_modules_with_config(&tiny_config(), &Device::Cpu)?;
    let c1 = modules.c1.parameters();
    let c2 = modules.c2.parameters();
    assert_eq!(c1.len(), c2.len());

    let w1 = c1[0].1.as_tensor().flatten_all()?.to_vec1::<f32>()?;
    let w2 = c2[0].1.as_tensor().flatten_all()?.to_vec1::<f32>()?;
    assert_ne!(w1, w2);
    Ok(())
}

#[test]
fn parameter_names_are_stable() -> Result<()> {
    let modules = build_modules_with_config(&tiny_config(), &Device::Cpu)?;
    let names: Vec<_> = modules
        .c1
        .parameters()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(
        names,
        [
            "classifier.fc0.weight",
            "classifier.fc0.bias",
            "classifier.head.weight",
            "classifier.head.bias",
        ]
    );
    assert_eq!(modules.generator.parameters().len(), 4);
    Ok(())
}

#[test]
fn identity_generator_passes_positive_inputs_through() -> Result<()> {
    let device = Device::Cpu;
    let identity = Dense::new(Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &device)?, None)?;
    let generator = Generator::from_layers(vec![identity], 0.0)?;
    let images = Tensor::new(&[[0.25f32, 2.0], [1.0, 0.5]], &device)?;

    let features = generator.forward(&images)?;

    assert_eq!(features.to_vec2::<f32>()?, images.to_vec2::<f32>()?);
    assert_eq!(generator.feature_dim(), 2);
    Ok(())
}

#[test]
fn classifier_rejects_unchained_layers() -> Result<()> {
    let device = Device::Cpu;
    let hidden = Dense::new(Tensor::zeros((4, 3), DType::F32, &device)?, None)?;
    let head = Dense::new(Tensor::zeros((2, 5), DType::F32, &device)?, None)?;
    assert!(Classifier::from_layers(vec![hidden], head, 0.0).is_err());
    Ok(())
}

#[test]
fn presets_build_for_known_pairs() -> Result<()> {
    let modules = build_modules("usps", "mnist", &Device::Cpu)?;
    assert_eq!(modules.c2.num_classes(), 10);
    assert!(build_modules("mnist", "svhn", &Device::Cpu).is_err());
    Ok(())
}
