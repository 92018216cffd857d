use std::time::{Duration, Instant};

use crate::{solver::StepOutcome, TrainingError};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Running training statistics for one epoch.
#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    batches: usize,
    source_loss_ema: ExponentialMovingAverage,
    discrepancy_ema: ExponentialMovingAverage,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            batches: 0,
            source_loss_ema: ExponentialMovingAverage::new(0.1),
            discrepancy_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, outcome: &StepOutcome) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;
        self.batches += 1;

        StepSnapshot {
            source_loss: self.source_loss_ema.update(f64::from(outcome.loss_s1)),
            discrepancy: self.discrepancy_ema.update(f64::from(outcome.loss_dis)),
            batches: self.batches,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Smoothed view of the epoch so far.
#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub source_loss: f64,
    pub discrepancy: f64,
    pub batches: usize,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

/// Counters for one evaluation pass over the held-out target split.
///
/// The loss accumulates one batch-mean value per batch and is divided by the
/// total sample count at the end, so it is not a per-sample average when
/// batches hold more than one sample.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    batch_loss_total: f64,
    samples: u64,
    correct_c1: u64,
    correct_c2: u64,
}

impl EvaluationMetrics {
    pub fn update(&mut self, batch_loss: f64, samples: u64, correct_c1: u64, correct_c2: u64) {
        self.batch_loss_total += batch_loss;
        self.samples += samples;
        self.correct_c1 += correct_c1;
        self.correct_c2 += correct_c2;
    }

    pub fn finalize(self, epoch: usize) -> Result<EvaluationSummary, TrainingError> {
        if self.samples == 0 {
            return Err(TrainingError::empty_dataset(
                "evaluation split produced no samples",
            ));
        }
        let samples = self.samples as f64;
        Ok(EvaluationSummary {
            epoch,
            average_loss: self.batch_loss_total / samples,
            correct_c1: self.correct_c1,
            correct_c2: self.correct_c2,
            samples: self.samples,
            accuracy_c1: self.correct_c1 as f64 / samples,
            accuracy_c2: self.correct_c2 as f64 / samples,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub epoch: usize,
    pub average_loss: f64,
    pub correct_c1: u64,
    pub correct_c2: u64,
    pub samples: u64,
    pub accuracy_c1: f64,
    pub accuracy_c2: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_starts_at_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.value(), None);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(2.0), 3.0);
    }

    #[test]
    fn empty_evaluation_is_an_error() {
        let err = EvaluationMetrics::default().finalize(0).unwrap_err();
        assert!(matches!(err, TrainingError::EmptyDataset(_)));
    }

    #[test]
    fn evaluation_averages_over_samples() {
        let mut metrics = EvaluationMetrics::default();
        metrics.update(3.0, 4, 4, 1);
        metrics.update(1.0, 4, 2, 1);
        let summary = metrics.finalize(7).unwrap();
        assert_eq!(summary.epoch, 7);
        assert_eq!(summary.average_loss, 0.5);
        assert_eq!(summary.accuracy_c1, 0.75);
        assert_eq!(summary.accuracy_c2, 0.25);
    }
}
