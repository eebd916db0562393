use burn::constant;
use burn::module::Module;
use burn::tensor::backend::Backend;
use rand::Rng;

use super::decoder::{AttnDecoder, DecodeOutput};
use super::encoder::{EncoderOutput, ListenEncoder};
use super::sampling::SamplingPolicy;
use crate::config::ModelConfig;
use crate::data::batch::SequenceBatch;

constant!(ModelConfig);

/// Encoder–decoder speech recognizer.
#[derive(Module, Debug)]
pub struct Seq2SeqModel<B: Backend> {
    #[module(skip)]
    config: ModelConfig,
    encoder: ListenEncoder<B>,
    decoder: AttnDecoder<B>,
}

impl<B: Backend> Seq2SeqModel<B> {
    pub fn new(config: ModelConfig, device: &B::Device) -> Self {
        config.validate();
        let encoder = ListenEncoder::new(&config, device);
        let decoder = AttnDecoder::new(&config, device);
        Self {
            config,
            encoder,
            decoder,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn encode(&self, batch: &SequenceBatch<B>) -> EncoderOutput<B> {
        self.encoder
            .forward(batch.features.clone(), &batch.feat_lengths)
    }

    /// Teacher-forced forward pass; logits go to the loss computation.
    pub fn forward_train<R: Rng>(
        &self,
        batch: &SequenceBatch<B>,
        max_output: usize,
        policy: SamplingPolicy,
        rng: &mut R,
    ) -> DecodeOutput<B> {
        let encoded = self.encode(batch);
        self.decoder.forward_train(
            &encoded,
            &batch.inputs,
            &batch.target_lengths,
            max_output,
            policy,
            rng,
        )
    }

    /// Greedy inference decode for dev/test scoring.
    pub fn forward_infer(
        &self,
        batch: &SequenceBatch<B>,
        go_id: usize,
        max_output: usize,
    ) -> DecodeOutput<B> {
        let encoded = self.encode(batch);
        self.decoder.forward_infer(&encoded, go_id, max_output)
    }
}
