use burn::module::Module;
use burn::nn::{Embedding, EmbeddingConfig, Linear, LinearConfig};
use burn::tensor::{backend::Backend, Int, Tensor};
use rand::rngs::StdRng;
use rand::Rng;

use super::attention::ContentAttention;
use super::cell::RecurrentStack;
use super::encoder::EncoderOutput;
use super::sampling::SamplingPolicy;
use crate::config::ModelConfig;

/// Step-wise decode result: logits and attention weights stacked time-major.
#[derive(Clone, Debug)]
pub struct DecodeOutput<B: Backend> {
    /// `[max_output, batch, vocab]`
    pub logits: Tensor<B, 3>,
    /// `[max_output, batch, encoder_span]`
    pub attentions: Tensor<B, 3>,
}

/// Ground-truth side of the decode loop, present only during training.
struct TeacherSignal<'a, B: Backend, R: Rng> {
    /// Embedded GO-shifted inputs `[batch, max_output, emb]`.
    embedded: Tensor<B, 3>,
    /// Per step, `[batch, 1]` flags that zero the raw input of any sequence
    /// whose step index has reached its target length.
    unfinished: Vec<Tensor<B, 2>>,
    policy: SamplingPolicy,
    rng: &'a mut R,
}

/// Attention decoder unrolled step by step over a fixed number of steps.
///
/// Output logits come from a single projection over `[query ‖ context]`
/// straight to vocabulary size; every input after the first is the raw token
/// embedding fused with the current context vector.
#[derive(Module, Debug)]
pub struct AttnDecoder<B: Backend> {
    embedding: Embedding<B>,
    stack: RecurrentStack<B>,
    attention: ContentAttention<B>,
    output_proj: Linear<B>,
    input_merge: Linear<B>,
}

impl<B: Backend> AttnDecoder<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Self {
        let embedding =
            EmbeddingConfig::new(config.vocab_size, config.embedding_size).init(device);
        let stack = RecurrentStack::new(
            config.embedding_size,
            config.hidden_size_decoder,
            config.num_layers_decoder,
            config.use_memory_cell,
            config.dropout,
            config.apply_dropout,
            device,
        );
        let attention = ContentAttention::new(
            config.hidden_size,
            config.hidden_size_decoder,
            config.attention_vec_size,
            device,
        );
        let output_proj = LinearConfig::new(
            config.hidden_size_decoder + config.hidden_size,
            config.vocab_size,
        )
        .init(device);
        let input_merge = LinearConfig::new(
            config.embedding_size + config.hidden_size,
            config.embedding_size,
        )
        .init(device);

        Self {
            embedding,
            stack,
            attention,
            output_proj,
            input_merge,
        }
    }

    /// Teacher-forced decode with optional scheduled sampling.
    pub fn forward_train<R: Rng>(
        &self,
        encoder: &EncoderOutput<B>,
        inputs: &Tensor<B, 2, Int>,
        target_lengths: &[usize],
        max_output: usize,
        policy: SamplingPolicy,
        rng: &mut R,
    ) -> DecodeOutput<B> {
        let device = encoder.states.device();
        let embedded = self.embedding.forward(inputs.clone());
        let dims = embedded.dims();
        let first = embedded
            .clone()
            .slice([0..dims[0], 0..1, 0..dims[2]])
            .reshape([dims[0], dims[2]]);
        let unfinished = unfinished_masks::<B>(target_lengths, max_output, &device);

        self.run(
            encoder,
            max_output,
            first,
            Some(TeacherSignal {
                embedded,
                unfinished,
                policy,
                rng,
            }),
        )
    }

    /// Greedy inference decode: after the GO token every input comes from the
    /// previous step's arg-max. Fully deterministic.
    pub fn forward_infer(
        &self,
        encoder: &EncoderOutput<B>,
        go_id: usize,
        max_output: usize,
    ) -> DecodeOutput<B> {
        let device = encoder.states.device();
        let batch = encoder.states.dims()[0];
        let go = Tensor::<B, 1, Int>::from_ints(vec![go_id as i64; batch].as_slice(), &device)
            .reshape([batch, 1]);
        let first = self.embed_step(go);
        self.run(
            encoder,
            max_output,
            first,
            Option::<TeacherSignal<B, StdRng>>::None,
        )
    }

    fn run<R: Rng>(
        &self,
        encoder: &EncoderOutput<B>,
        max_output: usize,
        first_input: Tensor<B, 2>,
        mut teacher: Option<TeacherSignal<'_, B, R>>,
    ) -> DecodeOutput<B> {
        assert!(max_output > 0, "max_output must be > 0");
        let device = encoder.states.device();
        let batch = encoder.states.dims()[0];

        let keys = self.attention.prepare(&encoder.states, &encoder.mask);
        // Recurrent and attention state both start from zero at t = 0; the
        // first input skips the context fusion below.
        let mut state = self.stack.init_state(batch, &device);
        let mut input = first_input;

        let mut logit_steps = Vec::with_capacity(max_output);
        let mut weight_steps = Vec::with_capacity(max_output);

        // The loop always runs exactly `max_output` steps; finished sequences
        // are handled by input masking, never by early exit.
        for step in 0..max_output {
            state = self.stack.forward(input, &state);
            let query = state.query();
            let attn = self.attention.step(&keys, query.clone());

            let logits = self
                .output_proj
                .forward(Tensor::cat(vec![query, attn.context.clone()], 1));
            logit_steps.push(logits.clone());
            weight_steps.push(attn.weights.clone());

            if step + 1 == max_output {
                break;
            }

            let raw = match teacher.as_mut() {
                Some(signal) => {
                    let next = step + 1;
                    let chosen = if signal.policy.use_teacher(&mut *signal.rng) {
                        let dims = signal.embedded.dims();
                        signal
                            .embedded
                            .clone()
                            .slice([0..batch, next..next + 1, 0..dims[2]])
                            .reshape([batch, dims[2]])
                    } else {
                        self.embed_argmax(&logits)
                    };
                    chosen * signal.unfinished[next].clone()
                }
                None => self.embed_argmax(&logits),
            };
            input = self
                .input_merge
                .forward(Tensor::cat(vec![raw, attn.context.clone()], 1));
        }

        DecodeOutput {
            logits: Tensor::stack::<3>(logit_steps, 0),
            attentions: Tensor::stack::<3>(weight_steps, 0),
        }
    }

    /// Map logits to the arg-max token's embedding (the self-feeding path).
    fn embed_argmax(&self, logits: &Tensor<B, 2>) -> Tensor<B, 2> {
        self.embed_step(logits.clone().argmax(1))
    }

    fn embed_step(&self, ids: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let embedded = self.embedding.forward(ids);
        let dims = embedded.dims();
        embedded.reshape([dims[0], dims[2]])
    }
}

/// Per-step `[batch, 1]` flags: 1.0 while `step < target_length`, else 0.0.
pub(crate) fn unfinished_masks<B: Backend>(
    lengths: &[usize],
    max_output: usize,
    device: &B::Device,
) -> Vec<Tensor<B, 2>> {
    (0..max_output)
        .map(|step| {
            let flags: Vec<f32> = lengths
                .iter()
                .map(|&len| if step < len { 1.0 } else { 0.0 })
                .collect();
            Tensor::<B, 1>::from_floats(flags.as_slice(), device).reshape([lengths.len(), 1])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::encoder::ListenEncoder;
    use rand::SeedableRng;

    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config() -> ModelConfig {
        ModelConfig {
            feat_dim: 3,
            hidden_size: 4,
            hidden_size_decoder: 5,
            embedding_size: 4,
            attention_vec_size: 3,
            num_layers_encoder: 1,
            num_layers_decoder: 2,
            use_memory_cell: true,
            vocab_size: 7,
            dropout: 0.0,
            apply_dropout: false,
        }
    }

    fn fixture() -> (
        AttnDecoder<TestBackend>,
        EncoderOutput<TestBackend>,
        Tensor<TestBackend, 2, Int>,
    ) {
        let device = Default::default();
        let config = small_config();
        let encoder = ListenEncoder::<TestBackend>::new(&config, &device);
        let decoder = AttnDecoder::<TestBackend>::new(&config, &device);

        let features: Vec<f32> = (0..2 * 6 * 3).map(|v| (v as f32) * 0.01 - 0.15).collect();
        let features =
            Tensor::<TestBackend, 1>::from_floats(features.as_slice(), &device).reshape([2, 6, 3]);
        let encoded = encoder.forward(features, &[6, 4]);

        // GO-shifted inputs for two sequences of target length 3 and 2.
        let inputs = Tensor::<TestBackend, 1, Int>::from_ints(
            [1i64, 4, 5, 0, 0, 1, 6, 0, 0, 0].as_slice(),
            &device,
        )
        .reshape([2, 5]);
        (decoder, encoded, inputs)
    }

    fn logits_vec(out: &DecodeOutput<TestBackend>) -> Vec<f32> {
        out.logits.clone().into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_decode_runs_exactly_max_output_steps() {
        let (decoder, encoded, inputs) = fixture();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let out = decoder.forward_train(
            &encoded,
            &inputs,
            &[3, 2],
            5,
            SamplingPolicy::disabled(),
            &mut rng,
        );
        assert_eq!(out.logits.dims(), [5, 2, 7]);
        assert_eq!(out.attentions.dims(), [5, 2, 6]);
    }

    #[test]
    fn test_teacher_forcing_is_deterministic() {
        let (decoder, encoded, inputs) = fixture();
        let mut rng_a = rand::rngs::StdRng::seed_from_u64(11);
        let mut rng_b = rand::rngs::StdRng::seed_from_u64(99);
        let a = decoder.forward_train(
            &encoded,
            &inputs,
            &[3, 2],
            5,
            SamplingPolicy::disabled(),
            &mut rng_a,
        );
        let b = decoder.forward_train(
            &encoded,
            &inputs,
            &[3, 2],
            5,
            SamplingPolicy::disabled(),
            &mut rng_b,
        );
        assert_eq!(logits_vec(&a), logits_vec(&b));
    }

    #[test]
    fn test_probability_one_matches_disabled_sampling() {
        let (decoder, encoded, inputs) = fixture();
        let mut rng_a = rand::rngs::StdRng::seed_from_u64(5);
        let mut rng_b = rand::rngs::StdRng::seed_from_u64(6);
        let forced = decoder.forward_train(
            &encoded,
            &inputs,
            &[3, 2],
            5,
            SamplingPolicy::scheduled(1.0),
            &mut rng_a,
        );
        let disabled = decoder.forward_train(
            &encoded,
            &inputs,
            &[3, 2],
            5,
            SamplingPolicy::disabled(),
            &mut rng_b,
        );
        assert_eq!(logits_vec(&forced), logits_vec(&disabled));
    }

    #[test]
    fn test_probability_zero_is_deterministic_self_feeding() {
        let (decoder, encoded, inputs) = fixture();
        let mut rng_a = rand::rngs::StdRng::seed_from_u64(21);
        let mut rng_b = rand::rngs::StdRng::seed_from_u64(22);
        let a = decoder.forward_train(
            &encoded,
            &inputs,
            &[3, 2],
            5,
            SamplingPolicy::scheduled(0.0),
            &mut rng_a,
        );
        let b = decoder.forward_train(
            &encoded,
            &inputs,
            &[3, 2],
            5,
            SamplingPolicy::scheduled(0.0),
            &mut rng_b,
        );
        // The draw no longer matters: every step takes the self-feeding path.
        assert_eq!(logits_vec(&a), logits_vec(&b));
    }

    #[test]
    fn test_inference_decode_is_repeatable() {
        let (decoder, encoded, _inputs) = fixture();
        let a = decoder.forward_infer(&encoded, 1, 5);
        let b = decoder.forward_infer(&encoded, 1, 5);
        assert_eq!(logits_vec(&a), logits_vec(&b));
        assert_eq!(
            a.attentions.into_data().to_vec::<f32>().unwrap(),
            b.attentions.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_unfinished_masks_zero_from_target_length() {
        let device = Default::default();
        let masks = unfinished_masks::<TestBackend>(&[3, 1], 4, &device);
        assert_eq!(masks.len(), 4);
        let at = |step: usize| {
            masks[step]
                .clone()
                .into_data()
                .to_vec::<f32>()
                .unwrap()
        };
        assert_eq!(at(0), vec![1.0, 1.0]);
        assert_eq!(at(1), vec![1.0, 0.0]);
        assert_eq!(at(2), vec![1.0, 0.0]);
        assert_eq!(at(3), vec![0.0, 0.0]);
    }
}
