//! Five-stage maximum classifier discrepancy update and the epoch loop.
//!
//! Each stage clears the gradient store before its backward pass and only the
//! optimizers named by the stage step afterwards. Parameters the stage does
//! not own may receive gradients, but those are discarded at the next clear.

use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device, Tensor, D,
};
use candle_nn::ops;
use networks::{build_modules_with_config, ArchitectureConfig, DomainModule, ModuleSet};

use crate::{
    checkpoint::{restore_modules, save_modules, CheckpointKey, ModuleRole},
    config::{SecondHead, SolverConfig},
    data::{load_datasets, DomainBatch, DomainLoader, EvalLoader},
    discrepancy::{entropy, Detached, DiscrepancyMode},
    logging::{Logger, LoggingSettings, RecordPaths},
    loss::{count_correct, nll_loss_mean, CrossEntropyLoss},
    metrics::{EvaluationMetrics, EvaluationSummary, StepSnapshot, TrainingMetrics},
    optimizer::{accumulator::GradientAccumulator, OptimizerConfig, TrainerOptimizer},
    TrainingError,
};

/// Result alias for solver fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Host-side values produced by one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Source cross entropy of C1 in stage A.
    pub loss_s1: f32,
    /// Source cross entropy of C2 in stage B.
    pub loss_s2: f32,
    /// Stage C objective: source cross entropy minus target discrepancy.
    pub loss_adv: f32,
    /// Target discrepancy measured after the update.
    pub loss_dis: f32,
    /// Source discrepancy measured after the update.
    pub loss_dis_s: f32,
    /// Entropy of C1's target predictions measured after the update.
    pub entropy: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochStop {
    /// The loader ran out of batches.
    Exhausted,
    /// Batch `index` had a sub-batch smaller than the batch size and was skipped.
    ShortBatch { index: usize },
    /// Batch `index` was processed and exceeded the configured index limit.
    BatchLimit { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochReport {
    pub epoch: usize,
    /// Index of the last batch that went through all five stages.
    pub last_batch_index: Option<usize>,
    pub batches_processed: usize,
    pub stop: EpochStop,
}

/// Per-step settings shared by the stage functions.
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    pub batch_size: usize,
    pub mode: DiscrepancyMode,
    pub num_k: usize,
    pub second_head: SecondHead,
}

impl StepContext {
    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            batch_size: config.data.batch_size,
            mode: config.adaptation.discrepancy_mode(),
            num_k: config.adaptation.num_k,
            second_head: config.adaptation.second_head,
        }
    }
}

/// The three networks driven by a solver.
pub struct Networks {
    pub generator: Box<dyn DomainModule>,
    pub c1: Box<dyn DomainModule>,
    pub c2: Box<dyn DomainModule>,
}

impl From<ModuleSet> for Networks {
    fn from(modules: ModuleSet) -> Self {
        Self {
            generator: Box::new(modules.generator),
            c1: Box::new(modules.c1),
            c2: Box::new(modules.c2),
        }
    }
}

impl Networks {
    fn roles(&self) -> [(ModuleRole, &dyn DomainModule); 3] {
        [
            (ModuleRole::Generator, self.generator.as_ref()),
            (ModuleRole::C1, self.c1.as_ref()),
            (ModuleRole::C2, self.c2.as_ref()),
        ]
    }
}

/// Networks, their optimizers and the shared gradient store.
pub struct TrainerState {
    pub networks: Networks,
    opt_g: TrainerOptimizer,
    opt_c1: TrainerOptimizer,
    opt_c2: TrainerOptimizer,
    grads: GradientAccumulator,
}

impl TrainerState {
    /// Binds one optimizer per network, each over that network's parameters only.
    pub fn new(networks: Networks, optimizer: &OptimizerConfig) -> Result<Self> {
        let opt_g = TrainerOptimizer::new(
            "generator",
            networks.generator.parameters(),
            *optimizer,
        )?;
        let opt_c1 = TrainerOptimizer::new("c1", networks.c1.parameters(), *optimizer)?;
        let opt_c2 = TrainerOptimizer::new("c2", networks.c2.parameters(), *optimizer)?;
        Ok(Self {
            networks,
            opt_g,
            opt_c1,
            opt_c2,
            grads: GradientAccumulator::new(),
        })
    }

    /// Drops every gradient currently held for G, C1 and C2.
    pub fn reset_grad(&mut self) {
        self.grads
            .clear(&[&self.opt_g, &self.opt_c1, &self.opt_c2]);
    }

    pub fn set_training(&mut self, training: bool) {
        self.networks.generator.set_training(training);
        self.networks.c1.set_training(training);
        self.networks.c2.set_training(training);
    }

    /// True when no gradients from a previous backward pass are held.
    pub fn gradients_cleared(&self) -> bool {
        self.grads.is_clear()
    }

    pub fn optimizers(&self) -> [&TrainerOptimizer; 3] {
        [&self.opt_g, &self.opt_c1, &self.opt_c2]
    }

    fn second_head(&self, head: SecondHead) -> &dyn DomainModule {
        match head {
            SecondHead::C1 => self.networks.c1.as_ref(),
            SecondHead::C2 => self.networks.c2.as_ref(),
        }
    }
}

/// A full-size batch laid out for the stages. `combined` holds the source rows
/// followed by the target rows.
pub struct StepInputs {
    pub combined: Tensor,
    pub source: Tensor,
    pub target: Tensor,
    pub source_labels: Tensor,
}

impl StepInputs {
    pub fn from_batch(batch: &DomainBatch, batch_size: usize) -> Result<Self> {
        if batch.source_len() != batch_size || batch.target_len() != batch_size {
            return Err(TrainingError::runtime(format!(
                "step expects {batch_size} source and target samples, got {} and {}",
                batch.source_len(),
                batch.target_len()
            )));
        }
        let combined = Tensor::cat(&[&batch.source_images, &batch.target_images], 0)?;
        Ok(Self {
            combined,
            source: batch.source_images.clone(),
            target: batch.target_images.clone(),
            source_labels: batch.source_labels.clone(),
        })
    }
}

fn source_rows(outputs: &Tensor, batch_size: usize) -> Result<Tensor> {
    Ok(outputs.narrow(0, 0, batch_size)?)
}

fn target_rows(outputs: &Tensor, batch_size: usize) -> Result<Tensor> {
    let rows = outputs.dim(0)?;
    Ok(outputs.narrow(0, batch_size, rows - batch_size)?)
}

fn probabilities(logits: &Tensor) -> Result<Tensor> {
    Ok(ops::softmax(logits, D::Minus1)?)
}

fn scalar(loss: &Tensor) -> Result<f32> {
    Ok(Detached::new(loss).to_scalar()?)
}

/// Stage A: fits G and C1 to the source labels.
pub fn fit_source_c1(
    state: &mut TrainerState,
    ctx: &StepContext,
    inputs: &StepInputs,
) -> Result<f32> {
    state.reset_grad();
    let features = state.networks.generator.forward(&inputs.combined)?;
    let outputs = state.networks.c1.forward(&features)?;
    let loss =
        CrossEntropyLoss.loss(&source_rows(&outputs, ctx.batch_size)?, &inputs.source_labels)?;

    let grads = state.grads.backward(&loss)?;
    state.opt_g.step(grads)?;
    state.opt_c1.step(grads)?;
    scalar(&loss)
}

/// Stage B: fits C2 to the source labels on fresh features. G is not updated.
pub fn fit_source_c2(
    state: &mut TrainerState,
    ctx: &StepContext,
    inputs: &StepInputs,
) -> Result<f32> {
    state.reset_grad();
    let features = state.networks.generator.forward(&inputs.combined)?;
    let outputs = state.networks.c2.forward(&features)?;
    let loss =
        CrossEntropyLoss.loss(&source_rows(&outputs, ctx.batch_size)?, &inputs.source_labels)?;

    let grads = state.grads.backward(&loss)?;
    state.opt_c2.step(grads)?;
    scalar(&loss)
}

/// Stage C: keeps the source fit while pushing the two target estimates apart.
/// Only the classifier heads step.
pub fn maximize_discrepancy(
    state: &mut TrainerState,
    ctx: &StepContext,
    inputs: &StepInputs,
) -> Result<f32> {
    state.reset_grad();
    let features = state.networks.generator.forward(&inputs.combined)?;
    let first = state.networks.c1.forward(&features)?;
    let second = state.second_head(ctx.second_head).forward(&features)?;

    let mut source_loss =
        CrossEntropyLoss.loss(&source_rows(&first, ctx.batch_size)?, &inputs.source_labels)?;
    if ctx.second_head == SecondHead::C2 {
        let second_loss =
            CrossEntropyLoss.loss(&source_rows(&second, ctx.batch_size)?, &inputs.source_labels)?;
        source_loss = (source_loss + second_loss)?;
    }
    let t1 = probabilities(&target_rows(&first, ctx.batch_size)?)?;
    let t2 = probabilities(&target_rows(&second, ctx.batch_size)?)?;
    let loss = (source_loss - ctx.mode.compute(&t1, &t2)?)?;

    let grads = state.grads.backward(&loss)?;
    state.opt_c1.step(grads)?;
    if ctx.second_head == SecondHead::C2 {
        state.opt_c2.step(grads)?;
    }
    scalar(&loss)
}

/// Stage D: `num_k` generator updates shrinking the target discrepancy.
/// Returns the discrepancy of the last iteration.
pub fn minimize_discrepancy(
    state: &mut TrainerState,
    ctx: &StepContext,
    inputs: &StepInputs,
) -> Result<Option<f32>> {
    let mut last = None;
    for _ in 0..ctx.num_k {
        state.reset_grad();
        let features = state.networks.generator.forward(&inputs.target)?;
        let t1 = probabilities(&state.networks.c1.forward(&features)?)?;
        let t2 = probabilities(&state.second_head(ctx.second_head).forward(&features)?)?;
        let loss = ctx.mode.compute(&t1, &t2)?;

        let grads = state.grads.backward(&loss)?;
        state.opt_g.step(grads)?;
        last = Some(scalar(&loss)?);
    }
    state.reset_grad();
    Ok(last)
}

/// Host values of stage E.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurements {
    pub loss_dis: f32,
    pub loss_dis_s: f32,
    pub entropy: f32,
}

/// Stage E: reads discrepancy and entropy on separate source and target
/// forwards without touching any gradient.
pub fn measure(state: &TrainerState, ctx: &StepContext, inputs: &StepInputs) -> Result<Measurements> {
    let heads = |images: &Tensor| -> Result<(Detached, Detached)> {
        let features = state.networks.generator.forward(images)?;
        let first = probabilities(&state.networks.c1.forward(&features)?)?;
        let second = probabilities(&state.second_head(ctx.second_head).forward(&features)?)?;
        Ok((Detached::new(&first), Detached::new(&second)))
    };

    let (t1, t2) = heads(&inputs.target)?;
    let loss_dis = ctx.mode.measure(&t1, &t2)?;
    let entropy = Detached::new(&entropy(t1.as_tensor())?).to_scalar()?;
    let (s1, s2) = heads(&inputs.source)?;
    let loss_dis_s = ctx.mode.measure(&s1, &s2)?;

    Ok(Measurements {
        loss_dis,
        loss_dis_s,
        entropy,
    })
}

/// Runs stages A to E on one full-size batch.
pub fn train_step(
    state: &mut TrainerState,
    ctx: &StepContext,
    batch: &DomainBatch,
) -> Result<StepOutcome> {
    let inputs = StepInputs::from_batch(batch, ctx.batch_size)?;
    let loss_s1 = fit_source_c1(state, ctx, &inputs)?;
    let loss_s2 = fit_source_c2(state, ctx, &inputs)?;
    let loss_adv = maximize_discrepancy(state, ctx, &inputs)?;
    minimize_discrepancy(state, ctx, &inputs)?;
    let measured = measure(state, ctx, &inputs)?;

    Ok(StepOutcome {
        loss_s1,
        loss_s2,
        loss_adv,
        loss_dis: measured.loss_dis,
        loss_dis_s: measured.loss_dis_s,
        entropy: measured.entropy,
    })
}

/// Picks Metal, then CUDA, then the CPU unless `force_cpu` is set.
pub fn select_device(force_cpu: bool, logger: &Logger) -> Device {
    if force_cpu {
        logger.info("device: CPU requested");
        return Device::Cpu;
    }
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => {
                logger.info("device: using Metal GPU #0");
                return device;
            }
            Err(err) => logger.warn(format!(
                "failed to initialize metal device, falling back: {err}"
            )),
        }
    }
    if cuda_is_available() {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                logger.info("device: using CUDA GPU #0");
                return device;
            }
            Err(err) => logger.warn(format!(
                "cuda reported available but initialization failed: {err}"
            )),
        }
    }
    logger.info("device: using CPU");
    Device::Cpu
}

/// Seeds the accelerator RNG. The CPU backend has no seedable generator, so
/// it is left alone and `Ok(false)` is returned.
pub fn seed_device(device: &Device, seed: u64) -> Result<bool> {
    if device.is_cpu() {
        return Ok(false);
    }
    device.set_seed(seed)?;
    Ok(true)
}

pub struct Solver {
    config: SolverConfig,
    device: Device,
    state: TrainerState,
    step: StepContext,
    train_loader: Box<dyn DomainLoader>,
    test_loader: Box<dyn EvalLoader>,
    logger: Logger,
}

impl Solver {
    /// Device, networks, optional checkpoint restore, datasets, then optimizers.
    pub fn new(config: SolverConfig) -> Result<Self> {
        config.validate()?;
        let logger = Logger::new(LoggingSettings::from_config(
            config.runtime.logging.enable_stdout,
            None,
        ));
        let device = select_device(config.runtime.cpu, &logger);

        let architecture = ArchitectureConfig::for_domains(&config.data.source, &config.data.target)
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        let modules = build_modules_with_config(&architecture, &device)
            .map_err(|err| TrainingError::initialization(format!("failed to build networks: {err}")))?;
        let networks = Networks::from(modules);

        if config.checkpoint.eval_only {
            let key = CheckpointKey {
                directory: &config.checkpoint.directory,
                source: &config.data.source,
                target: &config.data.target,
                epoch: config.checkpoint.resume_epoch,
            };
            restore_modules(key, networks.roles())?;
            logger.info(format!(
                "restored networks from epoch {}",
                config.checkpoint.resume_epoch
            ));
        }

        let datasets = load_datasets(&config.data, &architecture, config.runtime.seed)?;
        logger.info(format!(
            "datasets ready: {} training batches per epoch",
            datasets.train.batches_per_epoch()
        ));

        Self::from_parts(
            config,
            device,
            networks,
            Box::new(datasets.train),
            Box::new(datasets.test),
        )
    }

    /// Assembles a solver around already-built networks and loaders.
    pub fn from_parts(
        config: SolverConfig,
        device: Device,
        networks: Networks,
        train_loader: Box<dyn DomainLoader>,
        test_loader: Box<dyn EvalLoader>,
    ) -> Result<Self> {
        config.validate()?;
        let optimizer = OptimizerConfig::try_from(&config.optimizer)?;
        let state = TrainerState::new(networks, &optimizer)?;

        let records = match config.runtime.record_dir.as_deref() {
            Some(dir) => Some(RecordPaths::next_available(
                dir,
                &config.data.source,
                &config.data.target,
                config.adaptation.num_k,
                config.data.all_use,
            )?),
            None => None,
        };
        let logger = Logger::new(LoggingSettings::from_config(
            config.runtime.logging.enable_stdout,
            records,
        ));
        if let Some(records) = logger.records() {
            logger.info(format!("recording to {}", records.train.display()));
        }

        Ok(Self {
            step: StepContext::from_config(&config),
            config,
            device,
            state,
            train_loader,
            test_loader,
            logger,
        })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// One pass over the training loader.
    ///
    /// The epoch ends when the loader is exhausted, when a sub-batch is
    /// shorter than the batch size (that batch is skipped), or once a
    /// processed batch index exceeds `runtime.batch_index_limit`.
    pub fn train_epoch(&mut self, epoch: usize) -> Result<EpochReport> {
        if let Err(err) = seed_device(&self.device, self.config.runtime.seed) {
            self.logger
                .warn(format!("failed to seed device RNG: {err}"));
        }
        self.state.set_training(true);
        self.train_loader.start_epoch(epoch)?;
        let total_batches = self.train_loader.batches_per_epoch();
        let batch_size = self.step.batch_size;
        let interval = self.config.runtime.interval;

        let mut metrics = TrainingMetrics::new();
        let mut snapshot: Option<StepSnapshot> = None;
        let mut last_batch_index = None;
        let mut batches_processed = 0;
        let mut batch_idx = 0;

        let stop = loop {
            let Some(batch) = self.train_loader.next_batch()? else {
                break EpochStop::Exhausted;
            };
            if batch.source_len() > batch_size || batch.target_len() > batch_size {
                return Err(TrainingError::runtime(format!(
                    "batch {batch_idx} is larger than the configured batch size {batch_size}"
                )));
            }
            if batch.source_len() < batch_size || batch.target_len() < batch_size {
                break EpochStop::ShortBatch { index: batch_idx };
            }

            let batch = batch.to_device(&self.device)?;
            let outcome = train_step(&mut self.state, &self.step, &batch)?;
            snapshot = Some(metrics.record_step(&outcome));
            last_batch_index = Some(batch_idx);
            batches_processed += 1;

            if let Some(limit) = self.config.runtime.batch_index_limit {
                if batch_idx > limit {
                    break EpochStop::BatchLimit { index: batch_idx };
                }
            }
            if batch_idx % interval == 0 {
                self.logger
                    .log_training_step(epoch, batch_idx, total_batches, &outcome)?;
            }
            batch_idx += 1;
        };

        let report = EpochReport {
            epoch,
            last_batch_index,
            batches_processed,
            stop,
        };
        self.logger.log_epoch(epoch, &report, snapshot.as_ref());
        Ok(report)
    }

    /// Scores both heads on the held-out target split.
    ///
    /// The reported loss adds up the batch-mean negative log-likelihood read
    /// directly from C1's outputs and divides it by the number of samples. Networks are saved
    /// when `save_model` is set and `epoch` is a multiple of
    /// `checkpoint.save_epoch`.
    pub fn evaluate(&mut self, epoch: usize, save_model: bool) -> Result<EvaluationSummary> {
        self.state.set_training(false);
        self.test_loader.rewind();

        let mut metrics = EvaluationMetrics::default();
        while let Some(batch) = self.test_loader.next_batch()? {
            let batch = batch.to_device(&self.device)?;
            let features = self.state.networks.generator.forward(&batch.images)?;
            let out1 = Detached::new(&self.state.networks.c1.forward(&features)?);
            let out2 = Detached::new(&self.state.networks.c2.forward(&features)?);

            let batch_loss = nll_loss_mean(out1.as_tensor(), &batch.labels)?;
            let correct_c1 = count_correct(out1.as_tensor(), &batch.labels)?;
            let correct_c2 = count_correct(out2.as_tensor(), &batch.labels)?;
            metrics.update(
                batch_loss,
                batch.labels.elem_count() as u64,
                correct_c1 as u64,
                correct_c2 as u64,
            );
        }
        let summary = metrics.finalize(epoch)?;

        let save_epoch = self.config.checkpoint.save_epoch;
        if save_model && epoch % save_epoch == 0 {
            self.save_checkpoint(epoch)?;
        }
        self.logger.log_evaluation(&summary)?;
        Ok(summary)
    }

    pub fn save_checkpoint(&self, epoch: usize) -> Result<()> {
        let key = CheckpointKey {
            directory: &self.config.checkpoint.directory,
            source: &self.config.data.source,
            target: &self.config.data.target,
            epoch,
        };
        save_modules(key, self.state.networks.roles())?;
        self.logger.info(format!(
            "saved networks for epoch {epoch} to {}",
            self.config.checkpoint.directory.display()
        ));
        Ok(())
    }

    pub fn run(&mut self) -> Result<Vec<EvaluationSummary>> {
        self.run_with_shutdown(&AtomicBool::new(false))
    }

    /// Alternates training and evaluation for `runtime.max_epoch` epochs, or
    /// evaluates once in eval-only mode. `shutdown` is checked between epochs.
    pub fn run_with_shutdown(&mut self, shutdown: &AtomicBool) -> Result<Vec<EvaluationSummary>> {
        if self.config.checkpoint.eval_only {
            return Ok(vec![self.evaluate(0, false)?]);
        }

        let save_model = self.config.checkpoint.save_model;
        let mut summaries = Vec::with_capacity(self.config.runtime.max_epoch);
        for epoch in 0..self.config.runtime.max_epoch {
            if shutdown.load(Ordering::SeqCst) {
                self.logger
                    .info(format!("shutdown requested; stopping before epoch {epoch}"));
                break;
            }
            self.train_epoch(epoch)?;
            summaries.push(self.evaluate(epoch, save_model)?);
        }
        Ok(summaries)
    }
}
