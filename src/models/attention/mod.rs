//! Relative-position self-attention and the transformer encoder built on it

mod encoder;
mod relative;

pub use encoder::{Encoder, FeedForward};
pub use relative::{
    absolute_to_relative, attention_bias_proximal, get_relative_embeddings, masked_fill,
    relative_to_absolute, AttentionOptions, MultiHeadAttention, MASK_FILL,
};
