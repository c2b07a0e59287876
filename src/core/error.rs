//! Structured error handling for SDKWork-VITS
//!
//! Model code works with `anyhow::Result` internally; the public facade
//! converts failures into [`VitsError`] so callers can match on the stage
//! that failed.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias with VitsError
pub type Result<T> = std::result::Result<T, VitsError>;

/// Main error type for SDKWork-VITS
#[derive(Error, Debug, Clone)]
pub enum VitsError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Model loading errors
    #[error("Model loading error in {component}: {message}")]
    ModelLoad {
        message: String,
        component: String,
        path: Option<PathBuf>,
    },

    /// Inference errors
    #[error("Inference error in {stage}: {message}")]
    Inference {
        stage: InferenceStage,
        message: String,
    },

    /// Audio processing errors
    #[error("Audio processing error: {message}")]
    Audio {
        message: String,
        path: Option<PathBuf>,
    },

    /// Text processing errors
    #[error("Text processing error: {message}")]
    Text { message: String },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// Internal/bug errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl VitsError {
    /// Shorthand for an inference failure at `stage`
    pub fn inference(stage: InferenceStage, message: impl Into<String>) -> Self {
        VitsError::Inference {
            stage,
            message: message.into(),
        }
    }

    /// Inference failure attributed to the stage recorded on `err`, or `fallback`
    pub fn staged(err: anyhow::Error, fallback: InferenceStage) -> Self {
        match err.downcast_ref::<InferenceStage>().copied() {
            Some(stage) => VitsError::inference(stage, err.root_cause().to_string()),
            None => VitsError::inference(fallback, format!("{:#}", err)),
        }
    }

    /// Shorthand for a validation failure on `field`
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        VitsError::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

/// Stages of the VITS generator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceStage {
    TextProcessing,
    TextEncoding,
    PosteriorEncoding,
    DurationPrediction,
    Alignment,
    Flow,
    Decoding,
    AudioOutput,
}

impl fmt::Display for InferenceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceStage::TextProcessing => write!(f, "text processing"),
            InferenceStage::TextEncoding => write!(f, "text encoding"),
            InferenceStage::PosteriorEncoding => write!(f, "posterior encoding"),
            InferenceStage::DurationPrediction => write!(f, "duration prediction"),
            InferenceStage::Alignment => write!(f, "monotonic alignment"),
            InferenceStage::Flow => write!(f, "normalizing flow"),
            InferenceStage::Decoding => write!(f, "waveform decoding"),
            InferenceStage::AudioOutput => write!(f, "audio output"),
        }
    }
}

/// Extension trait for adding context to foreign errors
pub trait ResultExt<T> {
    /// Add a simple message context
    fn context(self, msg: impl Into<String>) -> Result<T>;

    /// Attribute the error to an inference stage
    fn at_stage(self, stage: InferenceStage) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| VitsError::Internal {
            message: format!("{}: {}", msg.into(), e),
        })
    }

    fn at_stage(self, stage: InferenceStage) -> Result<T> {
        self.map_err(|e| VitsError::inference(stage, format!("{:#}", e)))
    }
}

/// Convert from anyhow::Error
impl From<anyhow::Error> for VitsError {
    fn from(err: anyhow::Error) -> Self {
        VitsError::Internal {
            message: format!("{:#}", err),
        }
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for VitsError {
    fn from(err: std::io::Error) -> Self {
        VitsError::Io {
            message: err.to_string(),
            path: None,
        }
    }
}

/// Convert from candle_core::Error
impl From<candle_core::Error> for VitsError {
    fn from(err: candle_core::Error) -> Self {
        VitsError::Internal {
            message: format!("Tensor operation failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VitsError::Config {
            message: "n_heads must divide hidden_channels".to_string(),
            path: Some(PathBuf::from("config.json")),
        };
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("n_heads"));
    }

    #[test]
    fn test_inference_stage_display() {
        assert_eq!(InferenceStage::Alignment.to_string(), "monotonic alignment");
        let err = VitsError::inference(InferenceStage::Flow, "shape mismatch");
        assert_eq!(err.to_string(), "Inference error in normalizing flow: shape mismatch");
    }

    #[test]
    fn test_staged_prefers_recorded_stage() {
        use anyhow::Context;

        let res: anyhow::Result<()> = Err(anyhow::anyhow!("shape mismatch"));
        let err = VitsError::staged(Context::context(res, InferenceStage::DurationPrediction).unwrap_err(), InferenceStage::Decoding);
        match err {
            VitsError::Inference { stage, message } => {
                assert_eq!(stage, InferenceStage::DurationPrediction);
                assert_eq!(message, "shape mismatch");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = VitsError::staged(anyhow::anyhow!("no speakers"), InferenceStage::Flow);
        assert!(matches!(err, VitsError::Inference { stage: InferenceStage::Flow, .. }));
    }

    #[test]
    fn test_at_stage_wraps_anyhow() {
        let res: anyhow::Result<()> = Err(anyhow::anyhow!("no path"));
        let err = res.at_stage(InferenceStage::Alignment).unwrap_err();
        match err {
            VitsError::Inference { stage, message } => {
                assert_eq!(stage, InferenceStage::Alignment);
                assert!(message.contains("no path"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
