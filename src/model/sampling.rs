use rand::Rng;

use crate::config::SamplingConfig;

/// Per-step choice between the ground-truth token and the model's own
/// previous prediction during training.
///
/// One Bernoulli draw is shared by the whole batch at each step; finished
/// sequences are forced to a zero input by the decoder regardless of the
/// draw.
#[derive(Clone, Copy, Debug)]
pub struct SamplingPolicy {
    enabled: bool,
    teacher_prob: f64,
}

impl SamplingPolicy {
    /// Always feed ground truth.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            teacher_prob: 1.0,
        }
    }

    pub fn scheduled(teacher_prob: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&teacher_prob),
            "teacher_prob must be within [0,1]"
        );
        Self {
            enabled: true,
            teacher_prob,
        }
    }

    pub fn from_config(config: &SamplingConfig) -> Self {
        if config.enabled {
            Self::scheduled(config.teacher_prob)
        } else {
            Self::disabled()
        }
    }

    pub fn use_teacher<R: Rng>(&self, rng: &mut R) -> bool {
        !self.enabled || rng.gen::<f64>() < self.teacher_prob
    }
}
