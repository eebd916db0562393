pub mod attention;
pub mod cell;
pub mod decoder;
pub mod encoder;
pub mod sampling;
pub mod seq2seq;

pub use attention::{AttentionKeys, AttentionState, ContentAttention};
pub use cell::{LayerState, RecurrentStack, StackState};
pub use decoder::{AttnDecoder, DecodeOutput};
pub use encoder::{EncoderOutput, ListenEncoder};
pub use sampling::SamplingPolicy;
pub use seq2seq::Seq2SeqModel;
