use std::fmt;
use std::path::PathBuf;

use hf_hub::api::sync::Api;
use tracing::debug;

use crate::{Error, Result};

/// The fixed set of text-to-image checkpoints offered to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ModelChoice {
    #[default]
    AnythingV3,
    AnimeKawaii,
    WaifuDiffusion,
}

impl ModelChoice {
    pub const ALL: [ModelChoice; 3] = [Self::AnythingV3, Self::AnimeKawaii, Self::WaifuDiffusion];

    pub fn label(&self) -> &'static str {
        match self {
            Self::AnythingV3 => "Anything v3.0 (Best)",
            Self::AnimeKawaii => "Anime Kawaii Diffusion (Good)",
            Self::WaifuDiffusion => "Waifu Diffusion (Not very good)",
        }
    }

    pub fn repo(&self) -> &'static str {
        match self {
            Self::AnythingV3 => "Linaqruf/anything-v3.0",
            Self::AnimeKawaii => "Ojimi/anime-kawai-diffusion",
            Self::WaifuDiffusion => "hakurei/waifu-diffusion",
        }
    }

    pub fn from_label(label: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|choice| choice.label() == label)
            .ok_or_else(|| Error::UnknownModel(label.to_string()))
    }

    /// All three checkpoints are fine-tunes of Stable Diffusion v1, so they share the
    /// v1 tokenizer and file layout.
    pub fn tokenizer_repo(&self) -> &'static str {
        "openai/clip-vit-base-patch32"
    }
}

impl fmt::Display for ModelChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFile {
    Tokenizer,
    Clip,
    Unet,
    Vae,
}

impl ModelFile {
    fn path(&self, use_f16: bool) -> &'static str {
        match (self, use_f16) {
            (Self::Tokenizer, _) => "tokenizer.json",
            (Self::Clip, true) => "text_encoder/model.fp16.safetensors",
            (Self::Clip, false) => "text_encoder/model.safetensors",
            (Self::Unet, true) => "unet/diffusion_pytorch_model.fp16.safetensors",
            (Self::Unet, false) => "unet/diffusion_pytorch_model.safetensors",
            (Self::Vae, true) => "vae/diffusion_pytorch_model.fp16.safetensors",
            (Self::Vae, false) => "vae/diffusion_pytorch_model.safetensors",
        }
    }

    fn repo(&self, model: ModelChoice) -> &'static str {
        match self {
            Self::Tokenizer => model.tokenizer_repo(),
            Self::Clip | Self::Unet | Self::Vae => model.repo(),
        }
    }

    /// Resolves the file locally, downloading it from the hub when no override is given.
    /// Half precision files are not published for every checkpoint, in which case the
    /// full precision file is fetched and converted at load time.
    pub fn get(
        &self,
        filename: Option<PathBuf>,
        model: ModelChoice,
        use_f16: bool,
    ) -> Result<PathBuf> {
        if let Some(filename) = filename {
            return Ok(filename);
        }
        let repo = Api::new()?.model(self.repo(model).to_string());
        if use_f16 {
            match repo.get(self.path(true)) {
                Ok(filename) => return Ok(filename),
                Err(err) => debug!(
                    "no half precision {:?} in {}, falling back: {err}",
                    self,
                    model.repo()
                ),
            }
        }
        Ok(repo.get(self.path(false))?)
    }
}
