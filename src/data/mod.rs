pub mod batch;
pub mod feeder;
pub mod shard;
pub mod vocab;

pub use batch::{assemble, bucket_for, bucketize, SequenceBatch, Utterance};
pub use feeder::{BatchFeeder, FeederError};
pub use shard::{load_dev_set, read_shard, scan_train_shards, write_shard};
pub use vocab::Vocabulary;
