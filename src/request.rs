use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::{config::Settings, Error, Result};

pub const STEPS: RangeInclusive<usize> = 1..=100;
pub const GUIDANCE_SCALE: RangeInclusive<f64> = 1.0..=20.0;
pub const DIMENSION: RangeInclusive<usize> = 256..=1024;
pub const BATCH_SIZE: RangeInclusive<usize> = 1..=20;
pub const SCALE_FACTOR: RangeInclusive<f64> = 1.0..=4.0;

/// Height and width must be divisible by the VAE downsampling factor.
pub const DIMENSION_MULTIPLE: usize = 8;

/// One user action: everything needed to synthesize and optionally upscale a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
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
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl GenerationRequest {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            model: settings.model.clone(),
            prompt: settings.prompt.clone(),
            negative_prompt: settings.negative_prompt.clone(),
            steps: settings.steps,
            guidance_scale: settings.guidance_scale,
            height: settings.height,
            width: settings.width,
            batch_size: settings.batch_size,
            upscale: settings.upscale,
            scale_factor: settings.scale_factor,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("height", self.height), ("width", self.width)] {
            if value % DIMENSION_MULTIPLE != 0 {
                return Err(Error::InvalidDimension {
                    name,
                    value,
                    multiple: DIMENSION_MULTIPLE,
                });
            }
            check_range(name, value as f64, &to_f64(&DIMENSION))?;
        }
        check_range("steps", self.steps as f64, &to_f64(&STEPS))?;
        check_range("batch size", self.batch_size as f64, &to_f64(&BATCH_SIZE))?;
        check_range("guidance scale", self.guidance_scale, &GUIDANCE_SCALE)?;
        if self.upscale {
            check_range("scale factor", self.scale_factor, &SCALE_FACTOR)?;
        }
        Ok(())
    }

    /// The part of the request the synthesis stage consumes.
    pub fn synthesis(&self) -> SynthesisParams {
        SynthesisParams {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            height: self.height,
            width: self.width,
            batch_size: self.batch_size,
            seed: self.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: usize,
    pub guidance_scale: f64,
    pub height: usize,
    pub width: usize,
    pub batch_size: usize,
    pub seed: Option<u64>,
}

fn to_f64(range: &RangeInclusive<usize>) -> RangeInclusive<f64> {
    *range.start() as f64..=*range.end() as f64
}

fn check_range(name: &'static str, value: f64, range: &RangeInclusive<f64>) -> Result<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(Error::OutOfRange {
            name,
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}
