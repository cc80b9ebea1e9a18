use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    build_clip_transformer, clip::ClipTextTransformer, schedulers::Scheduler,
    unet_2d::UNet2DConditionModel, vae::AutoEncoderKL, StableDiffusionConfig,
};
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    model::{ModelChoice, ModelFile},
    pipeline::CancelToken,
    provider::TextToImage,
    request::SynthesisParams,
    utils::{device, dtype, tensor_to_image},
    Error, Result,
};

/// Latents are scaled by this factor before being handed to the VAE decoder.
const VAE_SCALE: f64 = 0.18215;

const END_OF_TEXT: &str = "<|endoftext|>";

/// Pads `tokens` to exactly `max_len`. Over-long prompts are cut so that the sequence
/// still ends with the end-of-text token CLIP pools on.
fn fit_tokens(mut tokens: Vec<u32>, max_len: usize, eos_id: u32, pad_id: u32) -> Vec<u32> {
    if tokens.len() > max_len {
        tokens.truncate(max_len - 1);
        tokens.push(eos_id);
    }
    tokens.resize(max_len, pad_id);
    tokens
}

/// A Stable Diffusion v1 checkpoint loaded onto a device.
pub struct StableDiffusion {
    model: ModelChoice,
    device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    eos_id: u32,
    clip: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl StableDiffusion {
    pub fn load(model: ModelChoice, settings: &Settings) -> Result<Self> {
        let device = device(settings.device)?;
        let dtype = dtype(&device, settings.use_f16);
        let use_f16 = dtype == DType::F16;
        let sd_config = StableDiffusionConfig::v1_5(settings.sliced_attention_size, None, None);
        let weights = &settings.weights;

        info!("Loading {model} from {} ({dtype:?} on {device:?}).", model.repo());

        let tokenizer = ModelFile::Tokenizer.get(weights.tokenizer.clone(), model, use_f16)?;
        let tokenizer = Tokenizer::from_file(tokenizer).map_err(|e| Error::Tokenizer(e.to_string()))?;
        let vocab = tokenizer.get_vocab(true);
        let token_id = |token: &str| {
            vocab
                .get(token)
                .copied()
                .ok_or_else(|| Error::Tokenizer(format!("no {token} token in the vocabulary")))
        };
        let pad_id = token_id(sd_config.clip.pad_with.as_deref().unwrap_or(END_OF_TEXT))?;
        let eos_id = token_id(END_OF_TEXT)?;

        debug!("Building the Clip transformer.");
        let clip_weights = ModelFile::Clip.get(weights.clip.clone(), model, false)?;
        let clip = build_clip_transformer(&sd_config.clip, clip_weights, &device, DType::F32)?;

        debug!("Building the autoencoder.");
        let vae_weights = ModelFile::Vae.get(weights.vae.clone(), model, use_f16)?;
        let vae = sd_config.build_vae(vae_weights, &device, dtype)?;

        debug!("Building the unet.");
        let unet_weights = ModelFile::Unet.get(weights.unet.clone(), model, use_f16)?;
        let unet = sd_config.build_unet(unet_weights, &device, 4, settings.use_flash_attn, dtype)?;

        Ok(Self {
            model,
            device,
            dtype,
            sd_config,
            tokenizer,
            pad_id,
            eos_id,
            clip,
            vae,
            unet,
        })
    }

    pub fn model(&self) -> ModelChoice {
        self.model
    }

    fn tokens(&self, prompt: &str) -> Result<Tensor> {
        let max_len = self.sd_config.clip.max_position_embeddings;
        let tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            warn!(
                "Prompt is {} tokens long, only the first {max_len} are used.",
                tokens.len()
            );
        }
        let tokens = fit_tokens(tokens, max_len, self.eos_id, self.pad_id);
        Ok(Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?)
    }

    /// Prompt embeddings, preceded by the negative prompt embeddings when guidance is on.
    fn text_embeddings(&self, prompt: &str, negative_prompt: &str, guided: bool) -> Result<Tensor> {
        let text_embeddings = self.clip.forward(&self.tokens(prompt)?)?;
        let text_embeddings = if guided {
            let uncond_embeddings = self.clip.forward(&self.tokens(negative_prompt)?)?;
            Tensor::cat(&[uncond_embeddings, text_embeddings], 0)?
        } else {
            text_embeddings
        };
        Ok(text_embeddings.to_dtype(self.dtype)?)
    }

    fn step_process(
        &self,
        scheduler: &mut dyn Scheduler,
        timestep: usize,
        latents: &Tensor,
        text_embeddings: &Tensor,
        guidance_scale: Option<f64>,
    ) -> Result<Tensor> {
        let latent_model_input = match guidance_scale {
            Some(_) => Tensor::cat(&[latents, latents], 0)?,
            None => latents.clone(),
        };
        let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
        let noise_pred = self
            .unet
            .forward(&latent_model_input, timestep as f64, text_embeddings)?;
        let noise_pred = match guidance_scale {
            Some(guidance_scale) => {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
                (noise_pred_uncond + ((noise_pred_text - noise_pred_uncond)? * guidance_scale)?)?
            }
            None => noise_pred,
        };
        Ok(scheduler.step(&noise_pred, timestep, latents)?)
    }

    fn sample(
        &self,
        params: &SynthesisParams,
        text_embeddings: &Tensor,
        guidance_scale: Option<f64>,
        cancel: &CancelToken,
    ) -> Result<DynamicImage> {
        let mut scheduler = self.sd_config.build_scheduler(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, params.height / 8, params.width / 8),
            &self.device,
        )?;
        // scale the initial noise by the standard deviation required by the scheduler
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        for (timestep_index, &timestep) in timesteps.iter().enumerate() {
            cancel.check()?;
            let start_time = std::time::Instant::now();
            latents = self.step_process(
                scheduler.as_mut(),
                timestep,
                &latents,
                text_embeddings,
                guidance_scale,
            )?;
            let dt = start_time.elapsed().as_secs_f32();
            debug!("step {}/{} done, {:.2}s", timestep_index + 1, timesteps.len(), dt);
        }

        let image = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let image = ((image / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&image)
    }
}

impl TextToImage for StableDiffusion {
    fn generate(
        &mut self,
        params: &SynthesisParams,
        cancel: &CancelToken,
    ) -> Result<Vec<DynamicImage>> {
        if let Some(seed) = params.seed {
            if let Err(err) = self.device.set_seed(seed) {
                warn!("Could not seed {:?}: {err}", self.device);
            }
        }
        // A scale of 1 reduces classifier-free guidance to the conditional prediction.
        let guidance_scale = (params.guidance_scale > 1.0).then_some(params.guidance_scale);
        let text_embeddings = self.text_embeddings(
            &params.prompt,
            &params.negative_prompt,
            guidance_scale.is_some(),
        )?;

        let mut images = Vec::with_capacity(params.batch_size);
        for idx in 0..params.batch_size {
            info!("Sampling image {}/{}.", idx + 1, params.batch_size);
            images.push(self.sample(params, &text_embeddings, guidance_scale, cancel)?);
        }
        Ok(images)
    }
}
