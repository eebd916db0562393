use anyhow::{Context, Result};
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::model::Seq2SeqModel;
use crate::training::TrainingState;

pub const BEST_SCORE_FILE: &str = "best.txt";

/// Sidecar metadata stored next to each parameter snapshot; restoring it
/// rebuilds the `TrainingState` the run had at save time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: usize,
    pub epoch: usize,
    pub learning_rate: f64,
    pub best_dev_error: f64,
    pub model_file: String,
    pub timestamp: u64,
}

impl CheckpointMeta {
    pub fn restore_state(&self) -> TrainingState {
        let mut state = TrainingState::new(self.learning_rate);
        state.epoch = self.epoch;
        state.global_step = self.step;
        state.best_dev_error = self.best_dev_error;
        state
    }
}

/// Save model weights plus metadata under `dir`. A later save at the same
/// step overwrites the earlier one.
pub fn save_checkpoint<B: Backend>(
    model: &Seq2SeqModel<B>,
    state: &TrainingState,
    dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create checkpoint directory: {:?}", dir))?;

    let name = format!("asr_step_{}", state.global_step);
    let model_file = format!("{name}_model");

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    recorder
        .record(model.clone().into_record(), dir.join(&model_file))
        .with_context(|| "Failed to save model weights")?;

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let meta = CheckpointMeta {
        step: state.global_step,
        epoch: state.epoch,
        learning_rate: state.learning_rate,
        best_dev_error: state.best_dev_error,
        model_file,
        timestamp,
    };

    let meta_path = dir.join(name).with_extension("json");
    let meta_json = serde_json::to_string_pretty(&meta)
        .with_context(|| "Failed to serialize checkpoint metadata")?;
    fs::write(&meta_path, meta_json)
        .with_context(|| format!("Failed to write checkpoint metadata: {:?}", meta_path))?;

    info!("Checkpoint saved at step {}: {:?}", state.global_step, meta_path);
    Ok(meta_path)
}

/// Newest checkpoint (by step) in a directory, if any.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<(PathBuf, CheckpointMeta)>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut newest: Option<(PathBuf, CheckpointMeta)> = None;
    for entry in WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let Ok(contents) = fs::read_to_string(path) else {
            continue;
        };
        let Ok(meta) = serde_json::from_str::<CheckpointMeta>(&contents) else {
            continue;
        };
        if newest
            .as_ref()
            .is_none_or(|(_, best)| meta.step > best.step)
        {
            newest = Some((path.to_path_buf(), meta));
        }
    }
    Ok(newest)
}

/// Restore the newest snapshot across the regular and best locations.
///
/// The regular directory drives resumption; the best snapshot is taken when
/// it is newer, or always under `prefer_best` (the eval/test modes). A
/// missing checkpoint is a fresh start, not an error.
pub fn restore_model<B: Backend>(
    model: Seq2SeqModel<B>,
    train_dir: &Path,
    best_dir: &Path,
    prefer_best: bool,
    device: &B::Device,
) -> Result<(Seq2SeqModel<B>, Option<CheckpointMeta>)> {
    let regular = latest_checkpoint(train_dir)?;
    let best = latest_checkpoint(best_dir)?;

    let chosen = match (regular, best) {
        (Some(regular), Some(best)) => {
            if prefer_best || best.1.step > regular.1.step {
                Some(best)
            } else {
                Some(regular)
            }
        }
        (Some(regular), None) => Some(regular),
        (None, Some(best)) if prefer_best => Some(best),
        _ => None,
    };

    match chosen {
        Some((meta_path, meta)) => {
            let dir = meta_path
                .parent()
                .ok_or_else(|| anyhow::anyhow!("invalid checkpoint path: {:?}", meta_path))?;
            let model_path = dir.join(&meta.model_file);
            let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
            let record = recorder
                .load(model_path.clone(), device)
                .with_context(|| format!("Failed to load model weights from: {:?}", model_path))?;
            info!(
                "Reading model parameters from {:?} ({} done steps)",
                meta_path, meta.step
            );
            Ok((model.load_record(record), Some(meta)))
        }
        None => {
            info!("Created model with fresh parameters");
            Ok((model, None))
        }
    }
}

/// Best dev error recorded so far; unreadable or missing files fall back to
/// the 1.0 starting point.
pub fn read_best_score(train_dir: &Path) -> f64 {
    let path = train_dir.join(BEST_SCORE_FILE);
    match fs::read_to_string(&path) {
        Ok(contents) => contents.trim().parse().unwrap_or_else(|_| {
            warn!("unparseable best score in {:?}, starting from 1.0", path);
            1.0
        }),
        Err(_) => 1.0,
    }
}

pub fn write_best_score(train_dir: &Path, score: f64) -> Result<()> {
    fs::create_dir_all(train_dir)
        .with_context(|| format!("Failed to create train directory: {:?}", train_dir))?;
    fs::write(train_dir.join(BEST_SCORE_FILE), format!("{score}\n"))
        .with_context(|| format!("Failed to write best score under {:?}", train_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_meta(dir: &Path, step: usize) {
        let meta = CheckpointMeta {
            step,
            epoch: 1,
            learning_rate: 1e-3,
            best_dev_error: 0.5,
            model_file: format!("asr_step_{step}_model"),
            timestamp: 0,
        };
        fs::write(
            dir.join(format!("asr_step_{step}.json")),
            serde_json::to_string(&meta).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_latest_checkpoint_empty_dir() {
        let dir = TempDir::new().unwrap();
        assert!(latest_checkpoint(dir.path()).unwrap().is_none());
        assert!(latest_checkpoint(&dir.path().join("missing")).unwrap().is_none());
    }

    #[test]
    fn test_latest_checkpoint_picks_highest_step() {
        let dir = TempDir::new().unwrap();
        fake_meta(dir.path(), 500);
        fake_meta(dir.path(), 1500);
        fake_meta(dir.path(), 1000);

        let (_, meta) = latest_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(meta.step, 1500);
    }

    #[test]
    fn test_best_score_round_trip_and_fallback() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_best_score(dir.path()), 1.0);

        write_best_score(dir.path(), 0.3).unwrap();
        assert!((read_best_score(dir.path()) - 0.3).abs() < 1e-12);

        fs::write(dir.path().join(BEST_SCORE_FILE), "not-a-number").unwrap();
        assert_eq!(read_best_score(dir.path()), 1.0);
    }

    #[test]
    fn test_restore_state_from_meta() {
        let meta = CheckpointMeta {
            step: 2500,
            epoch: 3,
            learning_rate: 8.1e-4,
            best_dev_error: 0.42,
            model_file: "asr_step_2500_model".into(),
            timestamp: 0,
        };
        let state = meta.restore_state();
        assert_eq!(state.global_step, 2500);
        assert_eq!(state.epoch, 3);
        assert_eq!(state.learning_rate, 8.1e-4);
        assert_eq!(state.best_dev_error, 0.42);
        assert!(state.previous_losses.is_empty());
    }
}
