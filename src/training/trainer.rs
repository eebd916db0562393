use anyhow::{anyhow, Result};
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Instant;
use tracing::info;

use super::evaluate::asr_decode;
use crate::checkpoint;
use crate::config::{AsrConfig, Bucket};
use crate::data::batch::{assemble, Utterance};
use crate::data::feeder::BatchFeeder;
use crate::data::vocab::{Vocabulary, PAD_ID};
use crate::model::{SamplingPolicy, Seq2SeqModel};

/// Mutable training-run state, restored from checkpoint metadata on restart.
#[derive(Debug, Clone)]
pub struct TrainingState {
    pub epoch: usize,
    pub global_step: usize,
    pub learning_rate: f64,
    pub best_dev_error: f64,
    /// Loss averaged over the current checkpoint window.
    pub loss_acc: f64,
    /// Per-step wall time averaged over the current checkpoint window.
    pub step_time_acc: f64,
    /// One entry per finished checkpoint window.
    pub previous_losses: Vec<f64>,
}

impl TrainingState {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            learning_rate,
            best_dev_error: 1.0,
            loss_acc: 0.0,
            step_time_acc: 0.0,
            previous_losses: Vec::new(),
        }
    }

    /// Smoothed window perplexity, saturating to infinity on overflow.
    pub fn perplexity(&self) -> f64 {
        if self.loss_acc < 300.0 {
            self.loss_acc.exp()
        } else {
            f64::INFINITY
        }
    }

    pub fn record_step(&mut self, loss: f64, seconds: f64, window: usize) {
        self.loss_acc += loss / window as f64;
        self.step_time_acc += seconds / window as f64;
        self.global_step += 1;
    }

    /// Decay the learning rate when the window loss got strictly worse than
    /// the previous window's and the rate is still above the floor. The loss
    /// is appended to history either way. Returns whether decay happened.
    pub fn maybe_decay(&mut self, factor: f64, floor: f64) -> bool {
        let worse = self
            .previous_losses
            .last()
            .is_some_and(|&prev| self.loss_acc > prev);
        let decay = worse && self.learning_rate > floor;
        if decay {
            self.learning_rate *= factor;
        }
        self.previous_losses.push(self.loss_acc);
        decay
    }

    pub fn improved(&self, dev_error: f64) -> bool {
        dev_error < self.best_dev_error
    }

    pub fn reset_window(&mut self) {
        self.loss_acc = 0.0;
        self.step_time_acc = 0.0;
    }
}

/// Drives the whole training run: the epoch/minibatch loop, periodic dev
/// evaluation, learning-rate decay and best-model checkpointing.
pub struct Trainer<B: AutodiffBackend> {
    model: Seq2SeqModel<B>,
    optimizer: OptimizerAdaptor<Adam, Seq2SeqModel<B>, B>,
    loss_fn: CrossEntropyLoss<B>,
    config: AsrConfig,
    state: TrainingState,
    policy: SamplingPolicy,
    rng: StdRng,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(
        model: Seq2SeqModel<B>,
        config: AsrConfig,
        state: TrainingState,
        device: &B::Device,
    ) -> Self {
        let optimizer = AdamConfig::new()
            .with_grad_clipping(Some(GradientClippingConfig::Norm(
                config.training.max_grad_norm,
            )))
            .init::<B, Seq2SeqModel<B>>();
        let loss_fn = CrossEntropyLossConfig::new()
            .with_pad_tokens(Some(vec![PAD_ID]))
            .init(device);
        let policy = SamplingPolicy::from_config(&config.sampling);
        let rng = match config.training.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            model,
            optimizer,
            loss_fn,
            config,
            state,
            policy,
            rng,
            device: device.clone(),
        }
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn model(&self) -> &Seq2SeqModel<B> {
        &self.model
    }

    /// Run to `max_epochs` or the first error. Either way the feeder workers
    /// are cancelled and joined before this returns.
    pub fn run(
        &mut self,
        vocab: &Vocabulary,
        feeder: &mut BatchFeeder,
        dev_set: &[Vec<Utterance>],
        num_batches: usize,
    ) -> Result<()> {
        let outcome = self.run_epochs(vocab, feeder, dev_set, num_batches);
        feeder.shutdown();
        outcome
    }

    fn run_epochs(
        &mut self,
        vocab: &Vocabulary,
        feeder: &BatchFeeder,
        dev_set: &[Vec<Utterance>],
        num_batches: usize,
    ) -> Result<()> {
        let window = self.config.training.steps_per_checkpoint();
        info!(
            "training for up to {} epochs, {} minibatches each, checkpoint every {} steps",
            self.config.training.max_epochs, num_batches, window
        );

        while self.state.epoch <= self.config.training.max_epochs {
            info!("Epochs done: {}", self.state.epoch);
            for _ in 0..num_batches {
                let (bucket_id, examples) = feeder.next_batch()?;
                let bucket = *self
                    .config
                    .buckets
                    .get(bucket_id)
                    .ok_or_else(|| anyhow!("feeder produced unknown bucket {bucket_id}"))?;

                let started = Instant::now();
                let loss = self.train_minibatch(&examples, bucket)?;
                self.state
                    .record_step(loss, started.elapsed().as_secs_f64(), window);

                if self.state.global_step % window == 0 {
                    self.checkpoint_window(vocab, dev_set)?;
                }
            }
            self.state.epoch += 1;
        }
        Ok(())
    }

    /// One optimizer update; returns the char-task loss for this batch.
    fn train_minibatch(&mut self, examples: &[Utterance], bucket: Bucket) -> Result<f64> {
        let batch = assemble::<B>(examples, bucket, self.config.model.feat_dim, &self.device);
        let output =
            self.model
                .forward_train(&batch, bucket.max_output, self.policy, &mut self.rng);

        let [steps, size, vocab_size] = output.logits.dims();
        let logits = output.logits.reshape([steps * size, vocab_size]);
        // Targets go time-major to line up with the stacked logits.
        let targets = batch.targets.swap_dims(0, 1).reshape([steps * size]);
        let loss = self.loss_fn.forward(logits, targets);

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model =
            self.optimizer
                .step(self.state.learning_rate, self.model.clone(), grads);

        let values = loss
            .into_data()
            .to_vec::<f32>()
            .map_err(|err| anyhow!("failed to read loss value: {err:?}"))?;
        values
            .first()
            .map(|&v| f64::from(v))
            .ok_or_else(|| anyhow!("loss tensor was empty"))
    }

    /// Everything that happens at a checkpoint boundary: stats, dev decode,
    /// decay, best/regular snapshots, accumulator reset.
    fn checkpoint_window(&mut self, vocab: &Vocabulary, dev_set: &[Vec<Utterance>]) -> Result<()> {
        let training = self.config.training.clone();
        let train_dir = self.config.train_dir();

        info!(
            "global step {} learning rate {:.4} step-time {:.2} perplexity {:.2}",
            self.state.global_step,
            self.state.learning_rate,
            self.state.step_time_acc,
            self.state.perplexity()
        );

        // Dropout off: evaluate on the inner (non-autodiff) module.
        let dev_model = self.model.valid();
        let dev_error = asr_decode(
            &dev_model,
            vocab,
            dev_set,
            &self.config,
            &train_dir,
            &self.device,
        )?;
        info!(
            step = self.state.global_step,
            dev_error, "ASR error: {:.4}", dev_error
        );

        if self
            .state
            .maybe_decay(training.lr_decay_factor, training.lr_floor)
        {
            info!("Learning rate decreased to {:.6}", self.state.learning_rate);
        }

        if self.state.improved(dev_error) {
            self.state.best_dev_error = dev_error;
            info!("Best ASR error rate: {:.4}, saving the best model", dev_error);
            checkpoint::write_best_score(&train_dir, dev_error)?;
            checkpoint::save_checkpoint(&self.model, &self.state, &self.config.best_dir())?;
            checkpoint::save_checkpoint(&self.model, &self.state, &train_dir)?;
        } else {
            // Keep the run resumable without touching the best snapshot.
            checkpoint::save_checkpoint(&self.model, &self.state, &train_dir)?;
        }

        self.state.reset_window();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perplexity_saturates() {
        let mut state = TrainingState::new(1e-3);
        state.loss_acc = 2.0;
        assert!((state.perplexity() - 2.0f64.exp()).abs() < 1e-9);
        state.loss_acc = 300.0;
        assert!(state.perplexity().is_infinite());
    }

    #[test]
    fn test_decay_requires_worse_loss_and_room_above_floor() {
        let mut state = TrainingState::new(1e-3);

        // First window: no history yet, never decays.
        state.loss_acc = 1.0;
        assert!(!state.maybe_decay(0.9, 1e-4));
        assert_eq!(state.learning_rate, 1e-3);

        // Worse loss decays.
        state.loss_acc = 1.5;
        assert!(state.maybe_decay(0.9, 1e-4));
        assert!((state.learning_rate - 9e-4).abs() < 1e-12);

        // Better loss leaves the rate alone.
        state.loss_acc = 1.2;
        assert!(!state.maybe_decay(0.9, 1e-4));
        assert!((state.learning_rate - 9e-4).abs() < 1e-12);

        // Worse loss at the floor: unchanged.
        state.learning_rate = 1e-4;
        state.loss_acc = 2.0;
        assert!(!state.maybe_decay(0.9, 1e-4));
        assert_eq!(state.learning_rate, 1e-4);
        assert_eq!(state.previous_losses.len(), 4);
    }

    #[test]
    fn test_improvement_tracks_strict_minimum() {
        let mut state = TrainingState::new(1e-3);
        let mut best_writes = Vec::new();
        for &err in &[0.5, 0.3, 0.4] {
            if state.improved(err) {
                state.best_dev_error = err;
                best_writes.push(err);
            }
        }
        // Best snapshot written at the first two checkpoints only.
        assert_eq!(best_writes, vec![0.5, 0.3]);
        assert_eq!(state.best_dev_error, 0.3);
        // Equal error is not an improvement.
        assert!(!state.improved(0.3));
    }

    #[test]
    fn test_record_step_averages_over_window() {
        let mut state = TrainingState::new(1e-3);
        for _ in 0..10 {
            state.record_step(2.0, 0.5, 10);
        }
        assert_eq!(state.global_step, 10);
        assert!((state.loss_acc - 2.0).abs() < 1e-9);
        assert!((state.step_time_acc - 0.5).abs() < 1e-9);
        state.reset_window();
        assert_eq!(state.loss_acc, 0.0);
    }
}
