pub mod config;
pub mod diffusion;
pub mod model;
pub mod pipeline;
pub mod provider;
pub mod request;
pub mod upscale;
pub mod utils;

use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
use tracing_subscriber::{prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt};

pub use config::Settings;
pub use model::ModelChoice;
pub use pipeline::{CancelToken, GenerationTask, ImageBatch, Pipeline};
pub use request::GenerationRequest;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown model label {0:?}")]
    UnknownModel(String),
    #[error("{name} {value} is not a multiple of {multiple}")]
    InvalidDimension {
        name: &'static str,
        value: usize,
        multiple: usize,
    },
    #[error("{name} should be between {min} and {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("no cuda or metal accelerator is available")]
    AcceleratorUnavailable,
    #[error("upscaler weights not found at {}", .0.display())]
    MissingUpscalerWeights(PathBuf),
    #[error("generation was cancelled")]
    Cancelled,
    #[error("tokenizer: {0}")]
    Tokenizer(String),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Hub(#[from] hf_hub::api::sync::ApiError),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] serde_json::Error),
    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON file with default settings.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Display label of the model to use (see --list-models).
    #[arg(long)]
    pub model: Option<String>,

    /// The prompt to be used for image generation.
    #[arg(long)]
    pub prompt: Option<String>,

    /// What the generated image should steer away from.
    #[arg(long)]
    pub negative_prompt: Option<String>,

    /// The number of steps to run the diffusion for.
    #[arg(long)]
    pub n_steps: Option<usize>,

    #[arg(long)]
    pub guidance_scale: Option<f64>,

    /// The height in pixels of the generated image.
    #[arg(long)]
    pub height: Option<usize>,

    /// The width in pixels of the generated image.
    #[arg(long)]
    pub width: Option<usize>,

    /// The number of samples to generate.
    #[arg(long)]
    pub num_samples: Option<usize>,

    /// Upscale the generated images with Real-ESRGAN.
    #[arg(long)]
    pub upscale: bool,

    /// Skip upscaling even when the settings file enables it.
    #[arg(long, conflicts_with = "upscale")]
    pub no_upscale: bool,

    /// Resize factor applied by the upscaler.
    #[arg(long)]
    pub scale_factor: Option<f64>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    pub cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    pub tracing: bool,

    /// The name of the final image to generate.
    #[arg(long, value_name = "FILE", default_value = "sd_final.png")]
    pub final_image: String,

    /// Print the available model labels and exit.
    #[arg(long)]
    pub list_models: bool,
}

impl Args {
    /// Loads the settings file (or defaults) and applies the command line overrides.
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };
        if self.cpu {
            settings.device = utils::DevicePolicy::Cpu;
        }
        Ok(settings)
    }

    pub fn request(&self, settings: &Settings) -> GenerationRequest {
        let mut request = GenerationRequest::from_settings(settings);
        if let Some(model) = &self.model {
            request.model = model.clone();
        }
        if let Some(prompt) = &self.prompt {
            request.prompt = prompt.clone();
        }
        if let Some(negative_prompt) = &self.negative_prompt {
            request.negative_prompt = negative_prompt.clone();
        }
        if let Some(n_steps) = self.n_steps {
            request.steps = n_steps;
        }
        if let Some(guidance_scale) = self.guidance_scale {
            request.guidance_scale = guidance_scale;
        }
        if let Some(height) = self.height {
            request.height = height;
        }
        if let Some(width) = self.width {
            request.width = width;
        }
        if let Some(num_samples) = self.num_samples {
            request.batch_size = num_samples;
        }
        if self.upscale {
            request.upscale = true;
        }
        if self.no_upscale {
            request.upscale = false;
        }
        if let Some(scale_factor) = self.scale_factor {
            request.scale_factor = scale_factor;
        }
        if self.seed.is_some() {
            request.seed = self.seed;
        }
        request
    }

    /// Installs the fmt subscriber, plus the chrome layer when `--tracing` is set.
    /// The returned guard must be kept alive until the trace should be flushed.
    pub fn init_tracing(&self) -> Option<FlushGuard> {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("anidiff=info"));
        let fmt = tracing_subscriber::fmt::layer().with_target(false);

        if self.tracing {
            let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt)
                .with(chrome_layer)
                .init();
            Some(guard)
        } else {
            tracing_subscriber::registry().with(filter).with(fmt).init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_settings() {
        let args = Args::parse_from([
            "anidiff",
            "--model",
            "Waifu Diffusion (Not very good)",
            "--height",
            "768",
            "--num-samples",
            "3",
            "--upscale",
            "--scale-factor",
            "2.5",
            "--cpu",
        ]);
        let settings = args.settings().unwrap();
        assert_eq!(settings.device, utils::DevicePolicy::Cpu);

        let request = args.request(&settings);
        assert_eq!(request.model, "Waifu Diffusion (Not very good)");
        assert_eq!(request.height, 768);
        assert_eq!(request.width, 512);
        assert_eq!(request.batch_size, 3);
        assert!(request.upscale);
        assert_eq!(request.scale_factor, 2.5);
        assert_eq!(request.prompt, settings.prompt);
    }

    #[test]
    fn no_flags_yield_configured_defaults() {
        let args = Args::parse_from(["anidiff"]);
        let settings = args.settings().unwrap();
        let request = args.request(&settings);
        assert_eq!(request, GenerationRequest::from_settings(&settings));
        assert_eq!(args.final_image, "sd_final.png");
    }

    #[test]
    fn upscaling_can_be_turned_off_over_the_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("settings.json");
        std::fs::write(&config, r#"{ "upscale": true }"#).unwrap();
        let config = config.to_str().unwrap();

        let args = Args::parse_from(["anidiff", "--config", config]);
        assert!(args.request(&args.settings().unwrap()).upscale);

        let args = Args::parse_from(["anidiff", "--config", config, "--no-upscale"]);
        assert!(!args.request(&args.settings().unwrap()).upscale);

        assert!(Args::try_parse_from(["anidiff", "--upscale", "--no-upscale"]).is_err());
    }

    #[test]
    fn errors_render_their_context() {
        let err = Error::InvalidDimension {
            name: "height",
            value: 500,
            multiple: 8,
        };
        assert_eq!(err.to_string(), "height 500 is not a multiple of 8");
        let err = Error::UnknownModel("nonexistent".to_string());
        assert_eq!(err.to_string(), "unknown model label \"nonexistent\"");
    }
}
