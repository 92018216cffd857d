use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use adaptation::{Solver, SolverConfig, TrainingError};
use clap::Parser;
use serde_json::{Map, Number, Value};

fn main() {
    if let Err(err) = run() {
        eprintln!("adaptation failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Maximum classifier discrepancy domain adaptation",
    long_about = None
)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "TOML or JSON solver config")]
    config: Option<PathBuf>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override a configuration value using a dot-separated path"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Source domain (svhn, synth, usps, mnist)")]
    source: Option<String>,

    #[arg(long, help = "Target domain (mnist, gtsrb, usps)")]
    target: Option<String>,

    #[arg(long, help = "Restore networks from --resume-epoch and only evaluate")]
    eval_only: bool,

    #[arg(long, value_name = "EPOCH", help = "Checkpoint epoch restored by --eval-only")]
    resume_epoch: Option<usize>,

    #[arg(long, help = "Save networks every checkpoint.save_epoch epochs")]
    save_model: bool,

    #[arg(long, help = "Run on the CPU even if a GPU is available")]
    cpu: bool,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SolverConfig::load(path)?,
        None => SolverConfig::default(),
    };
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    apply_flags(&mut config, &args);
    config.validate()?;

    let mut solver = Solver::new(config)?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let summaries = solver.run_with_shutdown(&shutdown_flag)?;
    if let Some(last) = summaries.last() {
        solver.logger().info(format!(
            "finished after epoch {}: C1 {:.4} C2 {:.4}",
            last.epoch, last.accuracy_c1, last.accuracy_c2
        ));
    }
    Ok(())
}

fn apply_flags(config: &mut SolverConfig, args: &Args) {
    if let Some(source) = &args.source {
        config.data.source = source.clone();
    }
    if let Some(target) = &args.target {
        config.data.target = target.clone();
    }
    if args.eval_only {
        config.checkpoint.eval_only = true;
    }
    if let Some(epoch) = args.resume_epoch {
        config.checkpoint.resume_epoch = epoch;
    }
    if args.save_model {
        config.checkpoint.save_model = true;
    }
    if args.cpu {
        config.runtime.cpu = true;
    }
}

fn apply_overrides(
    config: SolverConfig,
    overrides: &[OverrideArg],
) -> Result<SolverConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        assign_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    Value::String(trimmed.to_string())
}

fn assign_at_path(root: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "override path '{path}' has an empty segment"
        )));
    }
    let Some((last, parents)) = segments.split_last() else {
        return Err(TrainingError::runtime("override path must not be empty"));
    };

    let Some(mut map) = root.as_object_mut() else {
        return Err(TrainingError::runtime("override root must be a JSON object"));
    };
    for segment in parents {
        let entry = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if entry.is_null() {
            *entry = Value::Object(Map::new());
        }
        let Some(child) = entry.as_object_mut() else {
            return Err(TrainingError::runtime(format!(
                "override path segment '{segment}' points to a non-object value"
            )));
        };
        map = child;
    }
    map.insert(last.to_string(), new_value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn override_arg(raw: &str) -> OverrideArg {
        raw.parse().unwrap()
    }

    #[test]
    fn overrides_reach_nested_fields() {
        let config = apply_overrides(
            SolverConfig::default(),
            &[
                override_arg("adaptation.num_k=2"),
                override_arg("optimizer.learning_rate=0.01"),
                override_arg("data.source=usps"),
                override_arg("runtime.batch_index_limit=null"),
            ],
        )
        .unwrap();
        assert_eq!(config.adaptation.num_k, 2);
        assert!((config.optimizer.learning_rate - 0.01).abs() < 1e-12);
        assert_eq!(config.data.source, "usps");
        assert_eq!(config.runtime.batch_index_limit, None);
    }

    #[test]
    fn override_fills_null_section() {
        let mut root = serde_json::json!({ "runtime": { "record_dir": null } });
        assign_at_path(&mut root, "runtime.record_dir.inner", Value::Bool(true)).unwrap();
        assert_eq!(root["runtime"]["record_dir"]["inner"], Value::Bool(true));
    }

    #[test]
    fn override_without_equals_is_rejected() {
        assert!("adaptation.num_k".parse::<OverrideArg>().is_err());
    }

    #[test]
    fn override_through_scalar_fails() {
        let err = apply_overrides(
            SolverConfig::default(),
            &[override_arg("adaptation.num_k.inner=1")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("'num_k' points to a non-object value"));
    }
}
