mod record;

pub use record::{
    latest_checkpoint, read_best_score, restore_model, save_checkpoint, write_best_score,
    CheckpointMeta, BEST_SCORE_FILE,
};
