use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

use super::batch::Utterance;

pub const SHARD_EXTENSION: &str = "bin";

pub fn read_shard(path: &Path) -> Result<Vec<Utterance>> {
    let file = File::open(path).with_context(|| format!("Failed to open shard: {:?}", path))?;
    let utterances = bincode::deserialize_from(BufReader::new(file))
        .with_context(|| format!("Failed to decode shard: {:?}", path))?;
    Ok(utterances)
}

pub fn write_shard(path: &Path, utterances: &[Utterance]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create shard: {:?}", path))?;
    bincode::serialize_into(BufWriter::new(file), utterances)
        .with_context(|| format!("Failed to encode shard: {:?}", path))
}

/// Enumerate `train*.bin` shards and precompute the minibatch count by
/// scanning every shard once (a smaller final batch is allowed per shard).
pub fn scan_train_shards(data_dir: &Path, batch_size: usize) -> Result<(Vec<PathBuf>, usize)> {
    let mut shards = Vec::new();
    for entry in WalkDir::new(data_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if path.is_file()
            && name.starts_with("train")
            && path.extension().and_then(|e| e.to_str()) == Some(SHARD_EXTENSION)
        {
            shards.push(path.to_path_buf());
        }
    }
    shards.sort();
    if shards.is_empty() {
        bail!("no train shards found under {:?}", data_dir);
    }

    let mut num_batches = 0usize;
    let mut instances = 0usize;
    for shard in &shards {
        let count = read_shard(shard)?.len();
        instances += count;
        num_batches += count.div_ceil(batch_size);
        info!("counted shard {:?}: {} utterances", shard, count);
    }
    info!(
        "{} train shards, {} utterances, {} minibatches per epoch",
        shards.len(),
        instances,
        num_batches
    );
    Ok((shards, num_batches))
}

/// Load the held-out set: `dev<prefix>.bin`, or `eval.bin` for the test set.
pub fn load_dev_set(data_dir: &Path, prefix: &str, test: bool) -> Result<Vec<Utterance>> {
    let name = if test {
        "eval.bin".to_string()
    } else {
        format!("dev{prefix}.bin")
    };
    let utterances = read_shard(&data_dir.join(name))?;
    info!("Number of dev samples: {}", utterances.len());
    Ok(utterances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn utterances(count: usize) -> Vec<Utterance> {
        (0..count)
            .map(|i| Utterance {
                id: format!("utt-{i}"),
                features: vec![vec![0.5; 2]; 3],
                targets: vec![4, 5],
            })
            .collect()
    }

    #[test]
    fn test_shard_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train0.bin");
        write_shard(&path, &utterances(3)).unwrap();
        let loaded = read_shard(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[1].id, "utt-1");
        assert_eq!(loaded[1].targets, vec![4, 5]);
    }

    #[test]
    fn test_scan_counts_minibatches() {
        let dir = TempDir::new().unwrap();
        write_shard(&dir.path().join("train0.bin"), &utterances(5)).unwrap();
        write_shard(&dir.path().join("train1.bin"), &utterances(4)).unwrap();
        // Unrelated files are ignored.
        write_shard(&dir.path().join("dev.bin"), &utterances(2)).unwrap();

        let (shards, num_batches) = scan_train_shards(dir.path(), 2).unwrap();
        assert_eq!(shards.len(), 2);
        // ceil(5/2) + ceil(4/2)
        assert_eq!(num_batches, 5);
    }

    #[test]
    fn test_scan_fails_without_shards() {
        let dir = TempDir::new().unwrap();
        assert!(scan_train_shards(dir.path(), 2).is_err());
    }
}
