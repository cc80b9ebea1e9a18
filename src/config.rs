use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{model::ModelChoice, utils::DevicePolicy, Result};

pub const DEFAULT_PROMPT: &str = "1 girl, masterpiece, best quality, absurdres, newest, ruby eyes, \
fox ears, brown hair, smile, cute, kawaii, looking at viewer, sitting on a bed, long black gloves";

pub const DEFAULT_NEGATIVE_PROMPT: &str = "(hands:1.5), (fingers), bad anatomy, extra limbs, \
extra feet, bad proportions, extra crus, fused crus, three legs, amputation, blurred, texts, \
extra belly button";

pub const DEFAULT_UPSCALER_WEIGHTS: &str = "weights/RealESRGAN_x4plus.pth";

/// Defaults for every form control plus how models get loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: usize,
    pub guidance_scale: f64,
    pub height: usize,
    pub width: usize,
    pub batch_size: usize,
    pub upscale: bool,
    pub scale_factor: f64,

    pub device: DevicePolicy,
    /// Load the diffusion model and the upscaler in half precision on accelerators.
    pub use_f16: bool,
    pub use_flash_attn: bool,
    /// The size of the sliced attention or 0 for automatic slicing (disabled when unset).
    pub sliced_attention_size: Option<usize>,
    pub upscaler_weights: PathBuf,
    pub weights: WeightOverrides,
    pub cache: CacheSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: ModelChoice::default().label().to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            steps: 20,
            guidance_scale: 7.5,
            height: 512,
            width: 512,
            batch_size: 2,
            upscale: false,
            scale_factor: 4.0,
            device: DevicePolicy::default(),
            use_f16: true,
            use_flash_attn: false,
            sliced_attention_size: None,
            upscaler_weights: PathBuf::from(DEFAULT_UPSCALER_WEIGHTS),
            weights: WeightOverrides::default(),
            cache: CacheSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Local files used instead of downloading from the hub.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightOverrides {
    pub tokenizer: Option<PathBuf>,
    pub clip: Option<PathBuf>,
    pub unet: Option<PathBuf>,
    pub vae: Option<PathBuf>,
}

/// Keep loaded models between requests. When disabled every request reloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl_secs: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 1,
            ttl_secs: None,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_files_keep_the_remaining_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "prompt": "a fox in the snow",
                "batch_size": 4,
                "device": "cpu",
                "weights": {{ "unet": "local/unet.safetensors" }},
                "cache": {{ "enabled": true, "ttl_secs": 600 }}
            }}"#
        )
        .unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.prompt, "a fox in the snow");
        assert_eq!(settings.batch_size, 4);
        assert_eq!(settings.device, DevicePolicy::Cpu);
        assert_eq!(
            settings.weights.unet,
            Some(PathBuf::from("local/unet.safetensors"))
        );
        assert_eq!(settings.weights.vae, None);
        assert!(settings.cache.enabled);
        assert_eq!(settings.cache.capacity, 1);
        assert_eq!(settings.cache.ttl(), Some(Duration::from_secs(600)));

        assert_eq!(settings.model, "Anything v3.0 (Best)");
        assert_eq!(settings.negative_prompt, DEFAULT_NEGATIVE_PROMPT);
        assert_eq!(settings.steps, 20);
        assert_eq!(
            settings.upscaler_weights,
            PathBuf::from("weights/RealESRGAN_x4plus.pth")
        );
    }

    #[test]
    fn malformed_files_are_config_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ \"steps\": \"many\" }}").unwrap();
        assert!(matches!(
            Settings::from_file(file.path()),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn missing_files_are_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Settings::from_file(dir.path().join("nope.json")),
            Err(crate::Error::Io(_))
        ));
    }
}
