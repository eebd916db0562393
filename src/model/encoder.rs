use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::{backend::Backend, Tensor};

use super::attention::length_mask;
use super::cell::RecurrentStack;
use crate::config::ModelConfig;

/// Encoder hidden states plus the valid-span mask the decoder attends over.
#[derive(Clone, Debug)]
pub struct EncoderOutput<B: Backend> {
    pub states: Tensor<B, 3>,
    pub mask: Tensor<B, 2>,
    pub lengths: Vec<usize>,
}

/// Acoustic listener: a frame projection followed by a stacked recurrent
/// pass over time. Deliberately minimal; the decoder only depends on the
/// `EncoderOutput` interface.
#[derive(Module, Debug)]
pub struct ListenEncoder<B: Backend> {
    input_proj: Linear<B>,
    stack: RecurrentStack<B>,
}

impl<B: Backend> ListenEncoder<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Self {
        let input_proj = LinearConfig::new(config.feat_dim, config.hidden_size).init(device);
        let stack = RecurrentStack::new(
            config.hidden_size,
            config.hidden_size,
            config.num_layers_encoder,
            config.use_memory_cell,
            config.dropout,
            config.apply_dropout,
            device,
        );
        Self { input_proj, stack }
    }

    pub fn forward(&self, features: Tensor<B, 3>, lengths: &[usize]) -> EncoderOutput<B> {
        let device = features.device();
        let [batch, steps, _feat] = features.dims();

        let projected = self.input_proj.forward(features);
        let hidden = projected.dims()[2];

        let mut state = self.stack.init_state(batch, &device);
        let mut outputs = Vec::with_capacity(steps);
        for step in 0..steps {
            let frame = projected
                .clone()
                .slice([0..batch, step..step + 1, 0..hidden])
                .reshape([batch, hidden]);
            state = self.stack.forward(frame, &state);
            outputs.push(state.output());
        }

        EncoderOutput {
            states: Tensor::stack::<3>(outputs, 1),
            mask: length_mask(lengths, steps, &device),
            lengths: lengths.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config() -> ModelConfig {
        ModelConfig {
            feat_dim: 3,
            hidden_size: 4,
            hidden_size_decoder: 4,
            embedding_size: 4,
            attention_vec_size: 2,
            num_layers_encoder: 2,
            num_layers_decoder: 1,
            use_memory_cell: true,
            vocab_size: 6,
            dropout: 0.0,
            apply_dropout: false,
        }
    }

    #[test]
    fn test_encoder_output_shapes() {
        let device = Default::default();
        let config = small_config();
        let encoder = ListenEncoder::<TestBackend>::new(&config, &device);

        let features = Tensor::<TestBackend, 1>::from_floats(
            vec![0.25f32; 2 * 5 * 3].as_slice(),
            &device,
        )
        .reshape([2, 5, 3]);
        let out = encoder.forward(features, &[5, 3]);

        assert_eq!(out.states.dims(), [2, 5, 4]);
        assert_eq!(out.mask.dims(), [2, 5]);
        assert_eq!(out.lengths, vec![5, 3]);

        let mask = out.mask.into_data().to_vec::<f32>().unwrap();
        assert_eq!(&mask[5..10], &[1.0, 1.0, 1.0, 0.0, 0.0]);
    }
}
