//! Core framework-level components
//!
//! - `error`: structured error type shared by the facade and the CLI

pub mod error;

pub use error::{InferenceStage, Result, ResultExt, VitsError};
