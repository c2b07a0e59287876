//! SDKWork-VITS CLI - Command-line interface for VITS synthesis
//!
//! - `infer`: text to speech
//! - `convert`: speaker conversion of a WAV recording
//! - `info`: model configuration summary

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use sdkwork_vits::{InferenceConfig, Vits, VitsConfig, VERSION};

/// SDKWork-VITS - end-to-end VITS text-to-speech
#[derive(Parser, Debug)]
#[command(name = "sdkwork-vits")]
#[command(author, version, about, long_about = None)]
#[command(about = "End-to-end VITS text-to-speech and voice conversion")]
#[command(long_about = "
SDKWork-VITS runs VITS generator checkpoints (safetensors) on CPU or GPU.

Examples:
  # Single-speaker synthesis
  sdkwork-vits infer --config ljs_base.json --checkpoint G.safetensors --text \"Hello world\"

  # Multi-speaker synthesis
  sdkwork-vits infer --config vctk_base.json --checkpoint G.safetensors --text \"Hello\" --speaker-id 4

  # Convert a recording from speaker 4 to speaker 12
  sdkwork-vits convert --config vctk_base.json --checkpoint G.safetensors \\
      --input in.wav --source-speaker 4 --target-speaker 12
")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use CPU instead of GPU
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synthesize speech from text
    Infer {
        /// Text to synthesize
        #[arg(short, long)]
        text: String,

        /// Speaker ID for multi-speaker models
        #[arg(long)]
        speaker_id: Option<u32>,

        /// Path to model config file (JSON or YAML)
        #[arg(short, long, default_value = "checkpoints/config.json")]
        config: PathBuf,

        /// Path to generator weights
        #[arg(long, default_value = "checkpoints/G.safetensors")]
        checkpoint: PathBuf,

        /// Output audio file path
        #[arg(short, long, default_value = "output.wav")]
        output: PathBuf,

        /// Prior sampling temperature
        #[arg(long)]
        noise_scale: Option<f64>,

        /// Stochastic duration noise
        #[arg(long)]
        noise_scale_w: Option<f64>,

        /// Speaking-rate multiplier (>1 is slower)
        #[arg(long)]
        length_scale: Option<f64>,

        /// Maximum decoded frames
        #[arg(long)]
        max_len: Option<usize>,
    },

    /// Convert a recording to another speaker's voice
    Convert {
        /// Input WAV file
        #[arg(short, long)]
        input: PathBuf,

        /// Speaker ID of the input recording
        #[arg(long)]
        source_speaker: u32,

        /// Speaker ID to convert to
        #[arg(long)]
        target_speaker: u32,

        /// Path to model config file (JSON or YAML)
        #[arg(short, long, default_value = "checkpoints/config.json")]
        config: PathBuf,

        /// Path to generator weights
        #[arg(long, default_value = "checkpoints/G.safetensors")]
        checkpoint: PathBuf,

        /// Output audio file path
        #[arg(short, long, default_value = "converted.wav")]
        output: PathBuf,
    },

    /// Show model information
    Info {
        /// Path to model config file (JSON or YAML)
        #[arg(short, long, default_value = "checkpoints/config.json")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match &cli.command {
        Commands::Infer {
            text,
            speaker_id,
            config,
            checkpoint,
            output,
            noise_scale,
            noise_scale_w,
            length_scale,
            max_len,
        } => {
            let defaults = VitsConfig::load(config)?.inference;
            let mut inference_config = InferenceConfig::from_defaults(&defaults);
            inference_config.use_gpu = !cli.cpu;
            inference_config.max_len = *max_len;
            if let Some(v) = noise_scale_w {
                inference_config.noise_scale_w = *v;
            }

            let mut vits = load_model(config, checkpoint, inference_config)?;
            if let Some(v) = noise_scale {
                vits.set_noise_scale(*v);
            }
            if let Some(v) = length_scale {
                vits.set_length_scale(*v);
            }
            run_inference(&vits, text, *speaker_id, output)
        }
        Commands::Convert {
            input,
            source_speaker,
            target_speaker,
            config,
            checkpoint,
            output,
        } => {
            let inference_config = InferenceConfig {
                use_gpu: !cli.cpu,
                ..Default::default()
            };
            run_conversion(
                input,
                *source_speaker,
                *target_speaker,
                config,
                checkpoint,
                output,
                inference_config,
            )
        }
        Commands::Info { config } => print_info(config),
    }
}

fn load_model(config: &Path, checkpoint: &Path, inference_config: InferenceConfig) -> Result<Vits> {
    let pb = create_progress_bar("Loading VITS model...")?;
    let start = Instant::now();

    let mut vits = Vits::new(config, inference_config).context("Failed to build model")?;
    vits.load_weights(checkpoint).context("Failed to load weights")?;

    pb.finish_with_message(format!("Model loaded in {:.1}s", start.elapsed().as_secs_f32()));
    Ok(vits)
}

fn run_inference(vits: &Vits, text: &str, speaker_id: Option<u32>, output: &Path) -> Result<()> {
    let text_preview: String = text.chars().take(50).collect();
    info!("Text: {} ({} chars)", text_preview, text.chars().count());
    if let Some(id) = speaker_id {
        info!("Speaker ID: {}", id);
    }
    info!(
        "Output: {:?} (noise_scale {}, length_scale {})",
        output,
        vits.inference_config().noise_scale,
        vits.inference_config().length_scale
    );

    let pb = create_progress_bar("Generating speech...")?;
    let start = Instant::now();
    let result = vits.synthesize(text, speaker_id).context("Synthesis failed")?;

    let duration = result.duration();
    let elapsed = start.elapsed().as_secs_f32();
    pb.finish_with_message(format!(
        "Generated {:.1}s of audio in {:.1}s (RTF: {:.2}x)",
        duration,
        elapsed,
        elapsed / duration.max(f32::EPSILON)
    ));

    result.save(output).context("Failed to save audio")?;
    info!("Saved to {:?}", output);
    info!("Sample rate: {} Hz", result.sample_rate);
    Ok(())
}

fn run_conversion(
    input: &Path,
    source_speaker: u32,
    target_speaker: u32,
    config: &Path,
    checkpoint: &Path,
    output: &Path,
    inference_config: InferenceConfig,
) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Input audio file not found: {:?}", input);
    }
    let vits = load_model(config, checkpoint, inference_config)?;

    info!("Input: {:?}", input);
    info!("Speakers: {} -> {}", source_speaker, target_speaker);

    let pb = create_progress_bar("Converting voice...")?;
    let start = Instant::now();
    let result = vits
        .convert_voice(input, source_speaker, target_speaker)
        .context("Voice conversion failed")?;
    pb.finish_with_message(format!(
        "Converted {:.1}s of audio in {:.1}s",
        result.duration(),
        start.elapsed().as_secs_f32()
    ));

    result.save(output).context("Failed to save audio")?;
    info!("Saved to {:?}", output);
    Ok(())
}

fn print_info(config_path: &Path) -> Result<()> {
    let config = VitsConfig::load(config_path)?;
    let m = &config.model;

    println!("SDKWork-VITS v{}", VERSION);
    println!("Config: {:?}", config_path);
    println!();
    println!("Audio");
    println!("  sampling_rate:   {} Hz", config.data.sampling_rate);
    println!(
        "  n_fft/hop/win:   {}/{}/{}",
        config.data.filter_length, config.data.hop_length, config.data.win_length
    );
    println!("  spec_channels:   {}", config.spec_channels());
    println!("  add_blank:       {}", config.data.add_blank);
    println!("  cleaners:        {}", config.data.text_cleaners.join(", "));
    println!();
    println!("Model");
    println!("  speakers:        {}", config.n_speakers());
    println!("  inter/hidden:    {}/{}", m.inter_channels, m.hidden_channels);
    println!("  text encoder:    {} layers, {} heads, window {:?}", m.n_layers, m.n_heads, m.window_size);
    println!("  duration model:  {}", if m.use_sdp { "stochastic" } else { "deterministic" });
    println!("  flows:           {}", m.n_flows);
    println!("  upsample rates:  {:?}", m.upsample_rates);
    println!("  resblock:        {}", m.resblock);
    Ok(())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

fn create_progress_bar(msg: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(msg.to_string());
    Ok(pb)
}
