use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

use las_asr::checkpoint;
use las_asr::config::AsrConfig;
use las_asr::data::batch::bucketize;
use las_asr::data::feeder::BatchFeeder;
use las_asr::data::shard::{load_dev_set, scan_train_shards};
use las_asr::data::vocab::Vocabulary;
use las_asr::model::Seq2SeqModel;
use las_asr::training::{asr_decode, Trainer, TrainingState};

type TrainBackend = Autodiff<NdArray<f32>>;
type EvalBackend = NdArray<f32>;

#[derive(Debug, Parser)]
#[command(author, version, about = "Attention seq2seq ASR training CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train the speech recognizer
    Train(RunArgs),
    /// Decode the dev set with the best saved model
    EvalDev(RunArgs),
    /// Decode the test set with the best saved model
    Test(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Path to configuration JSON file
    #[arg(long)]
    config: PathBuf,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => train_command(args),
        Commands::EvalDev(args) => decode_command(args, false),
        Commands::Test(args) => decode_command(args, true),
    }
}

fn load_config(path: &PathBuf) -> Result<(AsrConfig, Vocabulary)> {
    info!("Loading configuration from: {:?}", path);
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    let mut config: AsrConfig =
        serde_json::from_str(&contents).with_context(|| "Failed to parse config JSON")?;

    let vocab = Vocabulary::load(&config.paths.vocab_file)?;
    config.model.vocab_size = vocab.size();
    config.validate();

    info!(
        "Configuration loaded: feat_dim={}, hidden_size={}, vocab_size={}",
        config.model.feat_dim, config.model.hidden_size, config.model.vocab_size
    );
    Ok((config, vocab))
}

fn train_command(args: RunArgs) -> Result<()> {
    let (config, vocab) = load_config(&args.config)?;
    let train_dir = config.train_dir();
    let best_dir = config.best_dir();
    fs::create_dir_all(&train_dir)
        .with_context(|| format!("Failed to create train directory: {:?}", train_dir))?;
    fs::create_dir_all(&best_dir)
        .with_context(|| format!("Failed to create best-model directory: {:?}", best_dir))?;
    config.dump_parameters(&train_dir.join("parameters.txt"))?;

    info!("Loading train data from {:?}", config.paths.data_dir);
    let (shards, num_batches) =
        scan_train_shards(&config.paths.data_dir, config.training.batch_size)?;
    info!("Number of minibatches: {}", num_batches);

    let dev_set = bucketize(
        &config.buckets,
        load_dev_set(&config.paths.data_dir, &config.paths.dev_prefix, false)?,
    );

    let device = Default::default();
    let model = Seq2SeqModel::<TrainBackend>::new(config.model.clone(), &device);
    let (model, meta) = checkpoint::restore_model(model, &train_dir, &best_dir, false, &device)?;

    let state = match meta {
        Some(meta) => {
            let mut state = meta.restore_state();
            state.best_dev_error = checkpoint::read_best_score(&train_dir);
            info!(
                "Resuming from step {} (best dev error {:.4})",
                state.global_step, state.best_dev_error
            );
            state
        }
        None => TrainingState::new(config.training.learning_rate),
    };

    let mut feeder = BatchFeeder::spawn(
        shards,
        config.buckets.clone(),
        config.training.batch_size,
        config.training.feeder_workers,
        config.training.queue_capacity,
        config.training.seed,
    );
    let mut trainer = Trainer::new(model, config, state, &device);
    trainer.run(&vocab, &mut feeder, &dev_set, num_batches)?;

    info!("Training completed");
    Ok(())
}

fn decode_command(args: RunArgs, test: bool) -> Result<()> {
    let (config, vocab) = load_config(&args.config)?;
    let device = Default::default();

    let model = Seq2SeqModel::<EvalBackend>::new(config.model.clone(), &device);
    let (model, meta) =
        checkpoint::restore_model(model, &config.train_dir(), &config.best_dir(), true, &device)?;
    match meta {
        Some(meta) => info!("Epochs done: {}", meta.epoch),
        None => info!("No checkpoint found, decoding with fresh parameters"),
    }

    let dev_set = bucketize(
        &config.buckets,
        load_dev_set(&config.paths.data_dir, &config.paths.dev_prefix, test)?,
    );

    let train_dir = config.train_dir();
    fs::create_dir_all(&train_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", train_dir))?;

    let started = Instant::now();
    let score = asr_decode(&model, &vocab, &dev_set, &config, &train_dir, &device)?;
    info!(
        "ASR error: {:.4} (decoded in {:.1}s)",
        score,
        started.elapsed().as_secs_f64()
    );
    Ok(())
}
