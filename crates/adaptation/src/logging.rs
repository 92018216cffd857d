use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use crate::{
    metrics::{EvaluationSummary, StepSnapshot},
    solver::{EpochReport, StepOutcome},
    TrainingError,
};

/// Append-only text files receiving one line per logged event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordPaths {
    pub train: PathBuf,
    pub test: PathBuf,
}

impl RecordPaths {
    /// Picks `{source}_{target}_k_{num_k}_alluse_{all_use}_{n}.txt` with the
    /// smallest `n` whose training record does not exist yet, creating `dir`
    /// if needed. The evaluation record shares the stem with a `_test` suffix.
    pub fn next_available(
        dir: &Path,
        source: &str,
        target: &str,
        num_k: usize,
        all_use: bool,
    ) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create record directory {}: {err}",
                dir.display()
            ))
        })?;
        let stem = format!("{source}_{target}_k_{num_k}_alluse_{all_use}");
        let mut index = 0usize;
        loop {
            let train = dir.join(format!("{stem}_{index}.txt"));
            if !train.exists() {
                let test = dir.join(format!("{stem}_{index}_test.txt"));
                return Ok(Self { train, test });
            }
            index += 1;
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub records: Option<RecordPaths>,
}

impl LoggingSettings {
    pub fn from_config(enable_stdout: bool, records: Option<RecordPaths>) -> Self {
        Self {
            enable_stdout,
            records,
        }
    }
}

pub struct Logger {
    settings: LoggingSettings,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Self {
        Self { settings }
    }

    pub fn records(&self) -> Option<&RecordPaths> {
        self.settings.records.as_ref()
    }

    pub fn info(&self, message: impl AsRef<str>) {
        if self.settings.enable_stdout {
            println!("{}", message.as_ref());
        }
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        eprintln!("warning: {}", message.as_ref());
    }

    pub fn log_training_step(
        &mut self,
        epoch: usize,
        batch_idx: usize,
        total_batches: usize,
        outcome: &StepOutcome,
    ) -> Result<(), TrainingError> {
        if self.settings.enable_stdout {
            println!(
                "{}",
                progress_line(epoch, batch_idx, total_batches, outcome)
            );
        }

        if let Some(records) = &self.settings.records {
            append_line(
                &records.train,
                &format!(
                    "{} {} {}",
                    outcome.loss_dis, outcome.loss_dis_s, outcome.entropy
                ),
            )?;
        }
        Ok(())
    }

    pub fn log_epoch(&self, epoch: usize, report: &EpochReport, snapshot: Option<&StepSnapshot>) {
        if !self.settings.enable_stdout {
            return;
        }
        match snapshot {
            Some(snapshot) => println!(
                "epoch {} finished: batches={} stop={:?} loss_ema={:.4} dis_ema={:.6} last_batch={:.1}ms elapsed={:.1}s",
                epoch,
                report.batches_processed,
                report.stop,
                snapshot.source_loss,
                snapshot.discrepancy,
                snapshot.step_duration.as_secs_f64() * 1e3,
                snapshot.wall_time.as_secs_f64()
            ),
            None => println!(
                "epoch {} finished without a full batch (stop={:?})",
                epoch, report.stop
            ),
        }
    }

    pub fn log_evaluation(&mut self, summary: &EvaluationSummary) -> Result<(), TrainingError> {
        if self.settings.enable_stdout {
            println!(
                "\nTest set: Average loss: {:.4}, Accuracy C1: {}/{} ({:.0}%) Accuracy C2: {}/{} ({:.0}%) \n",
                summary.average_loss,
                summary.correct_c1,
                summary.samples,
                100.0 * summary.accuracy_c1,
                summary.correct_c2,
                summary.samples,
                100.0 * summary.accuracy_c2
            );
        }

        if let Some(records) = &self.settings.records {
            append_line(
                &records.test,
                &format!("{} {}", summary.accuracy_c1, summary.accuracy_c2),
            )?;
        }
        Ok(())
    }
}

/// Console progress for one logged step. `Loss` is the stage C objective.
pub fn progress_line(
    epoch: usize,
    batch_idx: usize,
    total_batches: usize,
    outcome: &StepOutcome,
) -> String {
    let percent = if total_batches == 0 {
        0.0
    } else {
        100.0 * batch_idx as f64 / total_batches as f64
    };
    format!(
        "Train Epoch: {} [{}/{} ({:.0}%)]\tLoss: {:.6}\t Dis: {:.6} Dis_s: {:.6}",
        epoch,
        batch_idx,
        total_batches,
        percent,
        outcome.loss_adv,
        outcome.loss_dis,
        outcome.loss_dis_s
    )
}

fn append_line(path: &Path, line: &str) -> Result<(), TrainingError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| {
            TrainingError::runtime(format!("failed to open record {}: {err}", path.display()))
        })?;
    writeln!(file, "{line}").map_err(|err| {
        TrainingError::runtime(format!("failed to write record {}: {err}", path.display()))
    })
}
