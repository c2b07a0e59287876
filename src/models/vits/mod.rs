//! End-to-end VITS generator and its training objectives

mod generator;
mod losses;

pub use generator::{
    SamplingParams, VitsGenerator, VitsInferOutput, VitsTrainOutput, VoiceConversionOutput,
};
pub use losses::{duration_loss, kl_loss, GeneratorLosses};
