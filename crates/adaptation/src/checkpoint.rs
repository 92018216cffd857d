use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use networks::DomainModule;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::TrainingError;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleRole {
    #[serde(rename = "G")]
    Generator,
    C1,
    C2,
}

impl ModuleRole {
    pub const ALL: [ModuleRole; 3] = [ModuleRole::Generator, ModuleRole::C1, ModuleRole::C2];

    pub fn suffix(self) -> &'static str {
        match self {
            ModuleRole::Generator => "G",
            ModuleRole::C1 => "C1",
            ModuleRole::C2 => "C2",
        }
    }
}

/// Identifies one saved snapshot of the three networks.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointKey<'a> {
    pub directory: &'a Path,
    pub source: &'a str,
    pub target: &'a str,
    pub epoch: usize,
}

impl CheckpointKey<'_> {
    fn stem(&self) -> String {
        format!(
            "{}_to_{}_model_epoch{}",
            self.source, self.target, self.epoch
        )
    }

    /// `{dir}/{source}_to_{target}_model_epoch{epoch}_{G|C1|C2}.safetensors`
    pub fn module_path(&self, role: ModuleRole) -> PathBuf {
        self.directory
            .join(format!("{}_{}.safetensors", self.stem(), role.suffix()))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.directory.join(format!("{}_manifest.json", self.stem()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub role: ModuleRole,
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub epoch: usize,
    pub source: String,
    pub target: String,
    pub files: Vec<FileRecord>,
}

/// Writes one safetensors file per module and a manifest covering all of them.
pub fn save_modules(
    key: CheckpointKey<'_>,
    modules: [(ModuleRole, &dyn DomainModule); 3],
) -> Result<CheckpointManifest, TrainingError> {
    fs::create_dir_all(key.directory).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            key.directory.display()
        ))
    })?;

    let mut files = Vec::with_capacity(modules.len());
    for (role, module) in modules {
        let path = key.module_path(role);
        save_module_weights(module, &path)?;
        files.push(file_record(role, &path)?);
    }

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        epoch: key.epoch,
        source: key.source.to_string(),
        target: key.target.to_string(),
        files,
    };
    write_json(&key.manifest_path(), &manifest)?;
    Ok(manifest)
}

/// Loads the snapshot named by `key` into `modules`.
///
/// Every module file must exist. When a manifest is present each file is
/// checked against its recorded digest before any parameter is overwritten.
pub fn restore_modules(
    key: CheckpointKey<'_>,
    modules: [(ModuleRole, &dyn DomainModule); 3],
) -> Result<(), TrainingError> {
    for (role, _) in &modules {
        let path = key.module_path(*role);
        if !path.is_file() {
            return Err(TrainingError::initialization(format!(
                "checkpoint for {} not found at {}",
                role.suffix(),
                path.display()
            )));
        }
    }

    let manifest_path = key.manifest_path();
    if manifest_path.is_file() {
        let manifest: CheckpointManifest = read_json(&manifest_path)?;
        ensure_version_supported(manifest.version)?;
        for (role, _) in &modules {
            let record = manifest
                .files
                .iter()
                .find(|record| record.role == *role)
                .ok_or_else(|| {
                    TrainingError::initialization(format!(
                        "checkpoint manifest {} has no entry for {}",
                        manifest_path.display(),
                        role.suffix()
                    ))
                })?;
            validate_file(&key.module_path(*role), &record.sha256)?;
        }
    }

    for (role, module) in modules {
        apply_module_weights(module, &key.module_path(role))?;
    }
    Ok(())
}

pub fn apply_module_weights(module: &dyn DomainModule, path: &Path) -> Result<(), TrainingError> {
    let parameters = module.parameters();
    let Some((_, first)) = parameters.first() else {
        return Err(TrainingError::initialization(
            "module contains no parameters to restore",
        ));
    };
    let device = first.as_tensor().device().clone();
    let tensors = load_safetensors(path, &device).map_err(|err| {
        TrainingError::initialization(format!("failed to read {}: {err}", path.display()))
    })?;
    let mut params_by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in parameters {
        let tensor = params_by_name.remove(&name).ok_or_else(|| {
            TrainingError::initialization(format!(
                "checkpoint {} missing parameter {name}",
                path.display()
            ))
        })?;
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor.to_dtype(desired_dtype)?
        };
        var.set(&tensor).map_err(|err| {
            TrainingError::initialization(format!("cannot restore parameter {name}: {err}"))
        })?;
    }

    if !params_by_name.is_empty() {
        let mut extra = params_by_name.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::initialization(format!(
            "checkpoint {} contains unused parameters: {}",
            path.display(),
            extra.join(", ")
        )));
    }

    Ok(())
}

fn save_module_weights(module: &dyn DomainModule, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = module.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "module contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, _> = named_parameters
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize weights to {}: {err}",
            path.display()
        ))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(role: ModuleRole, path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        role,
        filename,
        sha256,
        bytes,
    })
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::initialization(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::initialization(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::initialization(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use networks::{build_modules_with_config, ArchitectureConfig, Classifier, Generator};

    fn tiny_config() -> ArchitectureConfig {
        ArchitectureConfig {
            channels: 1,
            image_size: 2,
            generator_hidden: vec![3],
            feature_dim: 3,
            classifier_hidden: vec![],
            num_classes: 2,
            dropout: 0.0,
        }
    }

    fn roles<'a>(
        generator: &'a Generator,
        c1: &'a Classifier,
        c2: &'a Classifier,
    ) -> [(ModuleRole, &'a dyn DomainModule); 3] {
        [
            (ModuleRole::Generator, generator as &dyn DomainModule),
            (ModuleRole::C1, c1 as &dyn DomainModule),
            (ModuleRole::C2, c2 as &dyn DomainModule),
        ]
    }

    #[test]
    fn paths_follow_naming_scheme() {
        let key = CheckpointKey {
            directory: Path::new("ckpt"),
            source: "svhn",
            target: "mnist",
            epoch: 20,
        };
        assert_eq!(
            key.module_path(ModuleRole::Generator),
            Path::new("ckpt/svhn_to_mnist_model_epoch20_G.safetensors")
        );
        assert_eq!(
            key.module_path(ModuleRole::C2),
            Path::new("ckpt/svhn_to_mnist_model_epoch20_C2.safetensors")
        );
    }

    #[test]
    fn save_then_restore_reproduces_outputs() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let saved = build_modules_with_config(&tiny_config(), &device)?;
        let restored = build_modules_with_config(&tiny_config(), &device)?;
        let key = CheckpointKey {
            directory: dir.path(),
            source: "usps",
            target: "mnist",
            epoch: 3,
        };

        let manifest = save_modules(key, roles(&saved.generator, &saved.c1, &saved.c2))?;
        assert_eq!(manifest.files.len(), 3);
        restore_modules(key, roles(&restored.generator, &restored.c1, &restored.c2))?;

        let input = Tensor::new(&[[[[0.1f32, 0.2], [0.3, 0.4]]]], &device)?;
        let expected = saved.c2.forward(&saved.generator.forward(&input)?)?;
        let actual = restored.c2.forward(&restored.generator.forward(&input)?)?;
        assert_eq!(expected.to_vec2::<f32>()?, actual.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn restore_without_files_is_an_initialization_error() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let modules = build_modules_with_config(&tiny_config(), &Device::Cpu)?;
        let key = CheckpointKey {
            directory: dir.path(),
            source: "usps",
            target: "mnist",
            epoch: 100,
        };
        let err = restore_modules(key, roles(&modules.generator, &modules.c1, &modules.c2))
            .unwrap_err();
        assert!(matches!(err, TrainingError::Initialization(_)));
        Ok(())
    }

    #[test]
    fn tampered_file_fails_checksum() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let modules = build_modules_with_config(&tiny_config(), &Device::Cpu)?;
        let key = CheckpointKey {
            directory: dir.path(),
            source: "usps",
            target: "mnist",
            epoch: 1,
        };
        save_modules(key, roles(&modules.generator, &modules.c1, &modules.c2))?;
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(key.module_path(ModuleRole::C1))?;
        file.write_all(b"junk")?;

        let err = restore_modules(key, roles(&modules.generator, &modules.c1, &modules.c2))
            .unwrap_err();
        assert!(err.to_string().contains("checksum"));
        Ok(())
    }
}
