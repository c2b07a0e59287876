//! Text (prior) and spectrogram (posterior) encoders

mod posterior;
mod text;

pub use posterior::PosteriorEncoder;
pub use text::{TextEncoder, TextEncoderConfig};
