pub mod evaluate;
pub mod trainer;

pub use evaluate::{asr_decode, edit_distance, Scorer};
pub use trainer::{Trainer, TrainingState};
