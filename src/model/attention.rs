use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::{activation, backend::Backend, Tensor};

/// Attention output carried between decode steps: the context vector and the
/// normalized weights over encoder positions (kept for diagnostics).
#[derive(Clone, Debug)]
pub struct AttentionState<B: Backend> {
    pub context: Tensor<B, 2>,
    pub weights: Tensor<B, 2>,
}

impl<B: Backend> AttentionState<B> {
    pub fn zeros(batch: usize, value_size: usize, span: usize, device: &B::Device) -> Self {
        Self {
            context: Tensor::zeros([batch, value_size], device),
            weights: Tensor::zeros([batch, span], device),
        }
    }
}

/// Encoder-side projections, computed once per batch and reused every step.
#[derive(Clone, Debug)]
pub struct AttentionKeys<B: Backend> {
    /// Raw encoder states `[batch, span, value_size]`; the context vector is a
    /// weighted sum over these, not over the projected keys.
    pub values: Tensor<B, 3>,
    pub keys: Tensor<B, 3>,
    pub mask: Tensor<B, 2>,
}

/// Additive content attention over encoder states.
#[derive(Module, Debug)]
pub struct ContentAttention<B: Backend> {
    key_proj: Linear<B>,
    query_proj: Linear<B>,
    score_proj: Linear<B>,
}

impl<B: Backend> ContentAttention<B> {
    pub fn new(
        value_size: usize,
        query_size: usize,
        attention_size: usize,
        device: &B::Device,
    ) -> Self {
        let key_proj = LinearConfig::new(value_size, attention_size).init(device);
        let query_proj = LinearConfig::new(query_size, attention_size).init(device);
        let score_proj = LinearConfig::new(attention_size, 1)
            .with_bias(false)
            .init(device);
        Self {
            key_proj,
            query_proj,
            score_proj,
        }
    }

    /// Project encoder states into attention space once per batch.
    pub fn prepare(&self, states: &Tensor<B, 3>, mask: &Tensor<B, 2>) -> AttentionKeys<B> {
        AttentionKeys {
            values: states.clone(),
            keys: self.key_proj.forward(states.clone()),
            mask: mask.clone(),
        }
    }

    /// One attention step for the given decoder query.
    ///
    /// Scores are softmaxed, masked to the valid span and renormalized so the
    /// weights over valid positions sum to 1; positions past a sequence's
    /// valid length get weight 0. The divisor is floored so a sequence with an
    /// all-zero mask yields zero weights instead of dividing by zero.
    pub fn step(&self, keys: &AttentionKeys<B>, query: Tensor<B, 2>) -> AttentionState<B> {
        let [batch, span, value_size] = keys.values.dims();

        let projected = self.query_proj.forward(query);
        let attention_size = projected.dims()[1];
        let combined = (keys.keys.clone() + projected.reshape([batch, 1, attention_size])).tanh();
        let scores = self.score_proj.forward(combined).reshape([batch, span]);

        let masked = activation::softmax(scores, 1) * keys.mask.clone();
        let norm = masked.clone().sum_dim(1).clamp_min(1e-12);
        let weights = masked / norm;

        let context = (keys.values.clone() * weights.clone().reshape([batch, span, 1]))
            .sum_dim(1)
            .reshape([batch, value_size]);

        AttentionState { context, weights }
    }
}

/// `[batch, max_len]` mask with 1.0 inside each sequence's valid length.
pub fn length_mask<B: Backend>(
    lengths: &[usize],
    max_len: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let mut buf = vec![0.0f32; lengths.len() * max_len];
    for (row, &len) in lengths.iter().enumerate() {
        for step in 0..len.min(max_len) {
            buf[row * max_len + step] = 1.0;
        }
    }
    Tensor::<B, 1>::from_floats(buf.as_slice(), device).reshape([lengths.len(), max_len])
}
