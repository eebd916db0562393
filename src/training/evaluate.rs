use anyhow::{anyhow, Context, Result};
use burn::tensor::{backend::Backend, Tensor};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

use crate::config::AsrConfig;
use crate::data::batch::{assemble, Utterance};
use crate::data::vocab::{Vocabulary, EOS_ID, GO_ID};
use crate::model::Seq2SeqModel;

/// Levenshtein distance between two token sequences.
pub fn edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, x) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let cost = usize::from(x != y);
            cur[j + 1] = (prev[j] + cost)
                .min(prev[j + 1] + 1)
                .min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Corpus-level word error accumulator.
#[derive(Debug, Default)]
pub struct Scorer {
    total_errors: usize,
    total_words: usize,
}

impl Scorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, gold: &[String], decoded: &[String]) {
        self.total_errors += edit_distance(gold, decoded);
        self.total_words += gold.len();
    }

    /// Total edit distance over total gold words; 0.0 for an empty dev set.
    pub fn score(&self) -> f64 {
        if self.total_words == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_words as f64
        }
    }
}

/// The three decode artifacts written per dev evaluation, one line per
/// sentence. Raw and segmented lines are tagged with the sentence id.
struct DecodeArtifacts {
    gold: BufWriter<File>,
    raw: BufWriter<File>,
    decoded: BufWriter<File>,
}

impl DecodeArtifacts {
    fn create(dir: &Path) -> Result<Self> {
        let open = |name: &str| -> Result<BufWriter<File>> {
            let path = dir.join(name);
            let file = File::create(&path)
                .with_context(|| format!("Failed to create decode artifact: {:?}", path))?;
            Ok(BufWriter::new(file))
        };
        Ok(Self {
            gold: open("gold_asr.txt")?,
            raw: open("raw_asr.txt")?,
            decoded: open("decoded_asr.txt")?,
        })
    }

    fn write_sentence(
        &mut self,
        id: &str,
        gold: &[String],
        raw: &[String],
        decoded: &[String],
    ) -> Result<()> {
        writeln!(self.gold, "{}", gold.join(" "))?;
        writeln!(self.raw, "{}\t{}", id, raw.join(" "))?;
        writeln!(self.decoded, "{}\t{}", id, decoded.join(" "))?;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.gold.flush()?;
        self.raw.flush()?;
        self.decoded.flush()?;
        Ok(())
    }
}

/// Greedy-decode the whole dev set and return the word error rate.
pub fn asr_decode<B: Backend>(
    model: &Seq2SeqModel<B>,
    vocab: &Vocabulary,
    dev_set: &[Vec<Utterance>],
    config: &AsrConfig,
    out_dir: &Path,
    device: &B::Device,
) -> Result<f64> {
    let mut scorer = Scorer::new();
    let mut artifacts = DecodeArtifacts::create(out_dir)?;
    let batch_size = config.training.batch_size;
    let mut sentences = 0usize;

    for (bucket_id, bucket_utterances) in dev_set.iter().enumerate() {
        let bucket = config.buckets[bucket_id];
        for chunk in bucket_utterances.chunks(batch_size) {
            let batch = assemble::<B>(chunk, bucket, config.model.feat_dim, device);
            let output = model.forward_infer(&batch, GO_ID, bucket.max_output);
            let rows = greedy_ids(&output.logits)?;

            for (row, utterance) in chunk.iter().enumerate() {
                let mut hypothesis = rows[row].clone();
                if let Some(eos) = hypothesis.iter().position(|&id| id == EOS_ID) {
                    hypothesis.truncate(eos);
                }
                let decoded_text = vocab.detokenize(&hypothesis);
                let gold_text = vocab.detokenize(&utterance.targets);

                let (raw_words, decoded_words) = vocab.segment_words(&decoded_text);
                let (_, gold_words) = vocab.segment_words(&gold_text);

                scorer.accumulate(&gold_words, &decoded_words);
                artifacts.write_sentence(&utterance.id, &gold_words, &raw_words, &decoded_words)?;
                sentences += 1;
            }
        }
    }

    artifacts.finish()?;
    info!("decoded {} dev sentences", sentences);
    Ok(scorer.score())
}

/// Arg-max each position of time-major logits, then transpose to
/// sequence-major rows.
fn greedy_ids<B: Backend>(logits: &Tensor<B, 3>) -> Result<Vec<Vec<usize>>> {
    let [steps, batch, _vocab] = logits.dims();
    let flat = logits.clone().argmax(2).reshape([steps, batch]);
    let data = flat
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| anyhow!("failed to read decoded ids: {err:?}"))?;

    let mut rows = vec![Vec::with_capacity(steps); batch];
    for step in 0..steps {
        for row in 0..batch {
            rows[row].push(data[step * batch + row] as usize);
        }
    }
    Ok(rows)
}
