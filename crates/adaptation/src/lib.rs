pub mod checkpoint;
pub mod config;
pub mod data;
pub mod discrepancy;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod solver;

pub use checkpoint::{CheckpointKey, CheckpointManifest, ModuleRole};
pub use config::{SolverConfig, TrainingError};
pub use data::{DomainBatch, DomainLoader, EvalBatch, EvalLoader};
pub use discrepancy::{Detached, DiscrepancyMode};
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput};
pub use metrics::EvaluationSummary;
pub use optimizer::{OptimizerConfig, TrainerOptimizer};
pub use solver::{EpochReport, EpochStop, Networks, Solver, StepContext, StepOutcome, TrainerState};
