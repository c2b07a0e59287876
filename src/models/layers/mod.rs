//! Building blocks shared by the encoders, flows and decoder

mod conv;
mod norm;
mod wavenet;

pub use conv::{get_padding, Conv1d, ConvSpec, ConvTranspose1d};
pub use norm::ChannelLayerNorm;
pub use wavenet::WaveNet;
