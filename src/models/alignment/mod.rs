//! Text-to-frame alignment

mod monotonic;

pub use monotonic::{attention_mask, log_likelihood_matrix, maximum_path, maximum_path_single};
