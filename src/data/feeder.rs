use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{info, warn};

use super::batch::{bucket_for, Utterance};
use super::shard::read_shard;
use crate::config::Bucket;

#[derive(Debug, Error)]
pub enum FeederError {
    #[error("data feeder was cancelled")]
    Cancelled,
    #[error("data feeder channel closed: all workers exited")]
    Disconnected,
}

/// Background producer/consumer feeder.
///
/// Workers read shuffled shards, group utterances into per-bucket batches and
/// push them through a bounded channel. The stream is endless (shards are
/// reshuffled each pass); the cancellation token is checked between sends, and
/// `shutdown` joins every worker before returning.
pub struct BatchFeeder {
    receiver: Option<Receiver<(usize, Vec<Utterance>)>>,
    cancel: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl BatchFeeder {
    pub fn spawn(
        shards: Vec<PathBuf>,
        buckets: Vec<Bucket>,
        batch_size: usize,
        workers: usize,
        capacity: usize,
        seed: Option<u64>,
    ) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = sync_channel(capacity);
        let cancel = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let subset: Vec<PathBuf> = shards
                .iter()
                .enumerate()
                .filter(|(index, _)| index % workers == worker_id)
                .map(|(_, path)| path.clone())
                .collect();
            let sender = sender.clone();
            let cancel = Arc::clone(&cancel);
            let buckets = buckets.clone();
            let rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(worker_id as u64)),
                None => StdRng::from_entropy(),
            };
            handles.push(std::thread::spawn(move || {
                feed_loop(subset, buckets, batch_size, sender, cancel, rng);
            }));
        }
        drop(sender);

        Self {
            receiver: Some(receiver),
            cancel,
            workers: handles,
        }
    }

    /// Blocking receive of the next `(bucket_id, utterances)` batch.
    pub fn next_batch(&self) -> Result<(usize, Vec<Utterance>), FeederError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(FeederError::Cancelled);
        }
        match &self.receiver {
            Some(receiver) => receiver.recv().map_err(|_| FeederError::Disconnected),
            None => Err(FeederError::Cancelled),
        }
    }

    /// Cooperative teardown: raise the cancellation flag, unblock any worker
    /// parked on the full channel by dropping the receiver, then join all of
    /// them. Idempotent.
    pub fn shutdown(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.receiver.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("data feeder worker panicked during shutdown");
            }
        }
    }
}

impl Drop for BatchFeeder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn feed_loop(
    shards: Vec<PathBuf>,
    buckets: Vec<Bucket>,
    batch_size: usize,
    sender: SyncSender<(usize, Vec<Utterance>)>,
    cancel: Arc<AtomicBool>,
    mut rng: StdRng,
) {
    if shards.is_empty() {
        return;
    }
    let mut order: Vec<usize> = (0..shards.len()).collect();
    loop {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        order.shuffle(&mut rng);
        for &index in &order {
            if cancel.load(Ordering::SeqCst) {
                return;
            }
            let mut utterances = match read_shard(&shards[index]) {
                Ok(utterances) => utterances,
                Err(err) => {
                    // Fail fast: the worker exits, the channel drains and the
                    // orchestrator sees a disconnect.
                    warn!("feeder worker stopping, unreadable shard {:?}: {err:#}", shards[index]);
                    return;
                }
            };
            utterances.shuffle(&mut rng);

            let mut pending: Vec<Vec<Utterance>> = vec![Vec::new(); buckets.len()];
            for utterance in utterances {
                let Some(bucket) = bucket_for(&buckets, &utterance) else {
                    continue;
                };
                pending[bucket].push(utterance);
                if pending[bucket].len() == batch_size {
                    let batch = std::mem::take(&mut pending[bucket]);
                    if sender.send((bucket, batch)).is_err() {
                        return;
                    }
                    if cancel.load(Ordering::SeqCst) {
                        return;
                    }
                }
            }
            // Smaller final batches per bucket are allowed.
            for (bucket, rest) in pending.into_iter().enumerate() {
                if !rest.is_empty() && sender.send((bucket, rest)).is_err() {
                    return;
                }
            }
        }
        info!("feeder pass over {} shards complete, reshuffling", shards.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::shard::write_shard;
    use tempfile::TempDir;

    fn shard_with(count: usize, dir: &std::path::Path) -> PathBuf {
        let utterances: Vec<Utterance> = (0..count)
            .map(|i| Utterance {
                id: format!("utt-{i}"),
                features: vec![vec![0.1; 2]; 3],
                targets: vec![4],
            })
            .collect();
        let path = dir.join("train0.bin");
        write_shard(&path, &utterances).unwrap();
        path
    }

    #[test]
    fn test_feeder_produces_bucketed_batches() {
        let dir = TempDir::new().unwrap();
        let shard = shard_with(5, dir.path());
        let buckets = vec![Bucket::new(4, 4)];

        let mut feeder = BatchFeeder::spawn(vec![shard], buckets, 2, 1, 4, Some(7));
        let (bucket, batch) = feeder.next_batch().unwrap();
        assert_eq!(bucket, 0);
        assert_eq!(batch.len(), 2);
        feeder.shutdown();
    }

    #[test]
    fn test_shutdown_joins_without_hanging() {
        let dir = TempDir::new().unwrap();
        let shard = shard_with(64, dir.path());
        let buckets = vec![Bucket::new(4, 4)];

        // Tiny capacity so workers are parked on a full channel at shutdown.
        let mut feeder = BatchFeeder::spawn(vec![shard], buckets, 2, 2, 1, Some(1));
        feeder.shutdown();
        assert!(matches!(feeder.next_batch(), Err(FeederError::Cancelled)));
    }

    #[test]
    fn test_missing_shard_disconnects() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("train-missing.bin");
        let buckets = vec![Bucket::new(4, 4)];

        let feeder = BatchFeeder::spawn(vec![missing], buckets, 2, 1, 4, Some(1));
        assert!(matches!(
            feeder.next_batch(),
            Err(FeederError::Disconnected)
        ));
    }
}
