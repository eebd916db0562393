use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use las_asr::data::batch::Utterance;
use las_asr::data::shard::write_shard;
use las_asr::data::vocab::Vocabulary;

/// Raw corpus entry: acoustic frames plus the plain-text transcription.
#[derive(Debug, Deserialize)]
struct RawUtterance {
    id: String,
    features: Vec<Vec<f32>>,
    text: String,
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Convert a JSON corpus into training shards")]
struct Args {
    /// Input JSON file: an array of {id, features, text} records
    #[arg(short, long)]
    input: PathBuf,

    /// Character vocabulary file
    #[arg(long)]
    vocab: PathBuf,

    /// Output directory for `train*.bin` and `dev.bin`
    #[arg(short, long)]
    output: PathBuf,

    /// Utterances per train shard
    #[arg(long, default_value = "1024")]
    shard_size: usize,

    /// Utterances held out into dev.bin
    #[arg(long, default_value = "500")]
    dev_count: usize,

    /// Shuffle seed
    #[arg(long, default_value = "13")]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.shard_size == 0 {
        bail!("shard_size must be > 0");
    }

    let vocab = Vocabulary::load(&args.vocab)?;
    let contents = fs::read_to_string(&args.input)
        .with_context(|| format!("Failed to read corpus: {:?}", args.input))?;
    let raw: Vec<RawUtterance> =
        serde_json::from_str(&contents).with_context(|| "Failed to parse corpus JSON")?;
    info!("Loaded {} raw utterances", raw.len());

    let mut utterances: Vec<Utterance> = Vec::with_capacity(raw.len());
    for entry in raw {
        if entry.features.is_empty() || entry.text.is_empty() {
            warn!("skipping empty utterance {}", entry.id);
            continue;
        }
        utterances.push(Utterance {
            id: entry.id,
            targets: vocab.encode(&entry.text),
            features: entry.features,
        });
    }
    if utterances.len() <= args.dev_count {
        bail!(
            "corpus has {} usable utterances, need more than dev_count ({})",
            utterances.len(),
            args.dev_count
        );
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    utterances.shuffle(&mut rng);

    fs::create_dir_all(&args.output)
        .with_context(|| format!("Failed to create output directory: {:?}", args.output))?;

    let dev: Vec<Utterance> = utterances.split_off(utterances.len() - args.dev_count);
    write_shard(&args.output.join("dev.bin"), &dev)?;
    info!("Wrote dev.bin with {} utterances", dev.len());

    for (index, chunk) in utterances.chunks(args.shard_size).enumerate() {
        let path = args.output.join(format!("train{index}.bin"));
        write_shard(&path, chunk)?;
        info!("Wrote {:?} with {} utterances", path, chunk.len());
    }

    info!(
        "Done: {} train utterances across {} shards",
        utterances.len(),
        utterances.len().div_ceil(args.shard_size)
    );
    Ok(())
}
