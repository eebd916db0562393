use burn::tensor::{backend::Backend, Int, Tensor};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::vocab::{EOS_ID, GO_ID, PAD_ID};
use crate::config::Bucket;

/// One spoken sentence: acoustic frames plus the gold character ids
/// (no GO/EOS framing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub id: String,
    pub features: Vec<Vec<f32>>,
    pub targets: Vec<usize>,
}

impl Utterance {
    pub fn input_len(&self) -> usize {
        self.features.len()
    }

    /// Decoder-side length including the closing EOS.
    pub fn target_len(&self) -> usize {
        self.targets.len() + 1
    }
}

/// One padded minibatch on the device.
#[derive(Debug, Clone)]
pub struct SequenceBatch<B: Backend> {
    /// `[batch, bucket.max_input, feat_dim]`
    pub features: Tensor<B, 3>,
    pub feat_lengths: Vec<usize>,
    /// GO-shifted decoder inputs `[batch, bucket.max_output]`.
    pub inputs: Tensor<B, 2, Int>,
    /// Loss targets `[batch, bucket.max_output]`, EOS-terminated, PAD beyond.
    pub targets: Tensor<B, 2, Int>,
    /// Valid target lengths including EOS.
    pub target_lengths: Vec<usize>,
    pub ids: Vec<String>,
    pub size: usize,
}

/// First bucket the utterance fits into, if any.
pub fn bucket_for(buckets: &[Bucket], utterance: &Utterance) -> Option<usize> {
    buckets.iter().position(|bucket| {
        utterance.input_len() <= bucket.max_input && utterance.target_len() <= bucket.max_output
    })
}

/// Group utterances by bucket, dropping any too long for every bucket.
pub fn bucketize(buckets: &[Bucket], utterances: Vec<Utterance>) -> Vec<Vec<Utterance>> {
    let mut grouped = vec![Vec::new(); buckets.len()];
    for utterance in utterances {
        match bucket_for(buckets, &utterance) {
            Some(index) => grouped[index].push(utterance),
            None => warn!("utterance {} exceeds every bucket, dropped", utterance.id),
        }
    }
    grouped
}

/// Pad a group of same-bucket utterances into device tensors.
pub fn assemble<B: Backend>(
    examples: &[Utterance],
    bucket: Bucket,
    feat_dim: usize,
    device: &B::Device,
) -> SequenceBatch<B> {
    let size = examples.len();
    let t_in = bucket.max_input;
    let t_out = bucket.max_output;

    let mut feat_buf = vec![0.0f32; size * t_in * feat_dim];
    let mut input_buf = vec![PAD_ID as i64; size * t_out];
    let mut target_buf = vec![PAD_ID as i64; size * t_out];
    let mut feat_lengths = Vec::with_capacity(size);
    let mut target_lengths = Vec::with_capacity(size);
    let mut ids = Vec::with_capacity(size);

    for (row, utterance) in examples.iter().enumerate() {
        let frames = utterance.features.len().min(t_in);
        for (step, frame) in utterance.features.iter().take(frames).enumerate() {
            let offset = (row * t_in + step) * feat_dim;
            let width = frame.len().min(feat_dim);
            feat_buf[offset..offset + width].copy_from_slice(&frame[..width]);
        }
        feat_lengths.push(frames);

        input_buf[row * t_out] = GO_ID as i64;
        let chars = utterance.targets.len().min(t_out - 1);
        for (k, &id) in utterance.targets.iter().take(chars).enumerate() {
            input_buf[row * t_out + 1 + k] = id as i64;
            target_buf[row * t_out + k] = id as i64;
        }
        target_buf[row * t_out + chars] = EOS_ID as i64;
        target_lengths.push(chars + 1);
        ids.push(utterance.id.clone());
    }

    let features =
        Tensor::<B, 1>::from_floats(feat_buf.as_slice(), device).reshape([size, t_in, feat_dim]);
    let inputs =
        Tensor::<B, 1, Int>::from_ints(input_buf.as_slice(), device).reshape([size, t_out]);
    let targets =
        Tensor::<B, 1, Int>::from_ints(target_buf.as_slice(), device).reshape([size, t_out]);

    SequenceBatch {
        features,
        feat_lengths,
        inputs,
        targets,
        target_lengths,
        ids,
        size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn utterance(frames: usize, targets: Vec<usize>) -> Utterance {
        Utterance {
            id: format!("utt-{frames}"),
            features: vec![vec![1.0, 2.0]; frames],
            targets,
        }
    }

    #[test]
    fn test_bucket_for_picks_first_fitting() {
        let buckets = vec![Bucket::new(4, 3), Bucket::new(8, 6)];
        assert_eq!(bucket_for(&buckets, &utterance(3, vec![5, 6])), Some(0));
        assert_eq!(bucket_for(&buckets, &utterance(6, vec![5])), Some(1));
        assert_eq!(bucket_for(&buckets, &utterance(9, vec![5])), None);
        // Target length counts the closing EOS.
        assert_eq!(bucket_for(&buckets, &utterance(3, vec![5, 6, 7])), Some(1));
    }

    #[test]
    fn test_bucketize_drops_oversized() {
        let buckets = vec![Bucket::new(4, 3)];
        let grouped = bucketize(
            &buckets,
            vec![utterance(3, vec![5]), utterance(9, vec![5])],
        );
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].len(), 1);
    }

    #[test]
    fn test_assemble_places_go_and_eos() {
        let device = Default::default();
        let batch = assemble::<TestBackend>(
            &[utterance(2, vec![5, 6]), utterance(3, vec![7])],
            Bucket::new(4, 5),
            2,
            &device,
        );

        assert_eq!(batch.size, 2);
        assert_eq!(batch.features.dims(), [2, 4, 2]);
        assert_eq!(batch.feat_lengths, vec![2, 3]);
        assert_eq!(batch.target_lengths, vec![3, 2]);

        let inputs = batch.inputs.into_data().to_vec::<i64>().unwrap();
        assert_eq!(inputs, vec![1, 5, 6, 0, 0, 1, 7, 0, 0, 0]);
        let targets = batch.targets.into_data().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![5, 6, 2, 0, 0, 7, 2, 0, 0, 0]);
    }
}
