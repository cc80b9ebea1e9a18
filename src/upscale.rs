//! Real-ESRGAN super-resolution.
//!
//! The generator is the RRDBNet from ESRGAN: a stack of residual-in-residual dense
//! blocks followed by two nearest-neighbour 2x upsampling convolutions, so the
//! network itself always upscales by 4. Other factors are reached by resizing the
//! network output, the same way `outscale` works for the reference Real-ESRGAN tools.

use std::path::Path;

use candle_core::{pickle::PthTensors, DType, Device, Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use image::{imageops::FilterType, DynamicImage};
use tracing::{debug, info};

use crate::{
    config::Settings,
    provider::Upscale,
    utils::{device, dtype, image_to_tensor, tensor_to_image},
    Error, Result,
};

/// Upscaling factor baked into the x4plus weights.
pub const NATIVE_SCALE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RrdbConfig {
    pub num_in_ch: usize,
    pub num_out_ch: usize,
    pub num_feat: usize,
    pub num_block: usize,
    pub num_grow_ch: usize,
}

impl RrdbConfig {
    /// RealESRGAN_x4plus.
    pub fn x4plus() -> Self {
        Self {
            num_in_ch: 3,
            num_out_ch: 3,
            num_feat: 64,
            num_block: 23,
            num_grow_ch: 32,
        }
    }
}

fn conv3x3(in_c: usize, out_c: usize, vb: VarBuilder) -> candle_core::Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    conv2d(in_c, out_c, 3, cfg, vb)
}

fn lrelu(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.maximum(&(xs * 0.2)?)
}

#[derive(Debug)]
struct ResidualDenseBlock {
    convs: [Conv2d; 5],
}

impl ResidualDenseBlock {
    fn new(num_feat: usize, num_grow_ch: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let convs = [
            conv3x3(num_feat, num_grow_ch, vb.pp("conv1"))?,
            conv3x3(num_feat + num_grow_ch, num_grow_ch, vb.pp("conv2"))?,
            conv3x3(num_feat + 2 * num_grow_ch, num_grow_ch, vb.pp("conv3"))?,
            conv3x3(num_feat + 3 * num_grow_ch, num_grow_ch, vb.pp("conv4"))?,
            conv3x3(num_feat + 4 * num_grow_ch, num_feat, vb.pp("conv5"))?,
        ];
        Ok(Self { convs })
    }
}

impl Module for ResidualDenseBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut features = vec![xs.clone()];
        for conv in &self.convs[..4] {
            let x = lrelu(&conv.forward(&Tensor::cat(&features, 1)?)?)?;
            features.push(x);
        }
        let x5 = self.convs[4].forward(&Tensor::cat(&features, 1)?)?;
        (x5 * 0.2)? + xs
    }
}

#[derive(Debug)]
struct Rrdb {
    rdbs: [ResidualDenseBlock; 3],
}

impl Rrdb {
    fn new(num_feat: usize, num_grow_ch: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let rdbs = [
            ResidualDenseBlock::new(num_feat, num_grow_ch, vb.pp("rdb1"))?,
            ResidualDenseBlock::new(num_feat, num_grow_ch, vb.pp("rdb2"))?,
            ResidualDenseBlock::new(num_feat, num_grow_ch, vb.pp("rdb3"))?,
        ];
        Ok(Self { rdbs })
    }
}

impl Module for Rrdb {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut out = xs.clone();
        for rdb in &self.rdbs {
            out = rdb.forward(&out)?;
        }
        (out * 0.2)? + xs
    }
}

#[derive(Debug)]
pub struct RrdbNet {
    conv_first: Conv2d,
    body: Vec<Rrdb>,
    conv_body: Conv2d,
    conv_up1: Conv2d,
    conv_up2: Conv2d,
    conv_hr: Conv2d,
    conv_last: Conv2d,
}

impl RrdbNet {
    pub fn new(cfg: &RrdbConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let nf = cfg.num_feat;
        let conv_first = conv3x3(cfg.num_in_ch, nf, vb.pp("conv_first"))?;
        let body = (0..cfg.num_block)
            .map(|i| Rrdb::new(nf, cfg.num_grow_ch, vb.pp("body").pp(i)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            conv_first,
            body,
            conv_body: conv3x3(nf, nf, vb.pp("conv_body"))?,
            conv_up1: conv3x3(nf, nf, vb.pp("conv_up1"))?,
            conv_up2: conv3x3(nf, nf, vb.pp("conv_up2"))?,
            conv_hr: conv3x3(nf, nf, vb.pp("conv_hr"))?,
            conv_last: conv3x3(nf, cfg.num_out_ch, vb.pp("conv_last"))?,
        })
    }
}

impl Module for RrdbNet {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let feat = self.conv_first.forward(xs)?;
        let mut body = feat.clone();
        for block in &self.body {
            body = block.forward(&body)?;
        }
        let feat = (feat + self.conv_body.forward(&body)?)?;

        let (_, _, h, w) = feat.dims4()?;
        let feat = lrelu(&self.conv_up1.forward(&feat.upsample_nearest2d(h * 2, w * 2)?)?)?;
        let feat = lrelu(&self.conv_up2.forward(&feat.upsample_nearest2d(h * 4, w * 4)?)?)?;
        self.conv_last.forward(&lrelu(&self.conv_hr.forward(&feat)?)?)
    }
}

/// Target size after scaling both sides by `outscale`, never below one pixel.
pub fn scaled_size(width: u32, height: u32, outscale: f64) -> (u32, u32) {
    let scale = |side: u32| ((side as f64 * outscale).round() as u32).max(1);
    (scale(width), scale(height))
}

/// The RRDBNet generator with the device it runs on. The whole image goes through
/// the network in one pass, no tiling.
pub struct RealEsrgan {
    net: RrdbNet,
    device: Device,
    dtype: DType,
}

impl RealEsrgan {
    pub fn new(net: RrdbNet, device: Device, dtype: DType) -> Self {
        Self { net, device, dtype }
    }

    pub fn load(settings: &Settings) -> Result<Self> {
        let path = &settings.upscaler_weights;
        if !path.is_file() {
            return Err(Error::MissingUpscalerWeights(path.clone()));
        }
        let device = device(settings.device)?;
        let dtype = dtype(&device, settings.use_f16);
        Self::from_pth(path, &RrdbConfig::x4plus(), device, dtype)
    }

    /// Loads a basicsr checkpoint, reading the `params_ema` table when it has one.
    pub fn from_pth<P: AsRef<Path>>(
        path: P,
        cfg: &RrdbConfig,
        device: Device,
        dtype: DType,
    ) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading Real-ESRGAN from {} ({dtype:?}).", path.display());
        let tensors = match PthTensors::new(path, Some("params_ema")) {
            Ok(tensors) => tensors,
            Err(err) => {
                debug!("no params_ema table in {}: {err}", path.display());
                PthTensors::new(path, None)?
            }
        };
        let vb = VarBuilder::from_backend(Box::new(tensors), dtype, device.clone());
        let net = RrdbNet::new(cfg, vb)?;
        Ok(Self::new(net, device, dtype))
    }
}

impl Upscale for RealEsrgan {
    fn enhance(&mut self, image: &DynamicImage, outscale: f64) -> Result<DynamicImage> {
        let (width, height) = (image.width(), image.height());
        let input = image_to_tensor(image, &self.device)?.to_dtype(self.dtype)?;
        let output = self.net.forward(&input)?;
        let output = output
            .squeeze(0)?
            .to_dtype(DType::F32)?
            .clamp(0f32, 1f32)?
            .affine(255., 0.)?
            .round()?
            .to_dtype(DType::U8)?;
        let output = tensor_to_image(&output)?;

        let (target_w, target_h) = scaled_size(width, height, outscale);
        if (target_w, target_h) == (output.width(), output.height()) {
            return Ok(output);
        }
        debug!(
            "Resizing {}x{} network output to {target_w}x{target_h}.",
            output.width(),
            output.height()
        );
        Ok(output.resize_exact(target_w, target_h, FilterType::Lanczos3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use std::path::PathBuf;

    fn tiny() -> RealEsrgan {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = RrdbConfig {
            num_in_ch: 3,
            num_out_ch: 3,
            num_feat: 4,
            num_block: 1,
            num_grow_ch: 2,
        };
        RealEsrgan::new(RrdbNet::new(&cfg, vb).unwrap(), Device::Cpu, DType::F32)
    }

    #[test]
    fn network_upscales_by_four() {
        let net = tiny();
        let input = Tensor::rand(0f32, 1f32, (1, 3, 6, 10), &Device::Cpu).unwrap();
        let output = net.net.forward(&input).unwrap();
        assert_eq!(output.dims(), &[1, 3, 24, 40]);
    }

    #[test]
    fn enhance_scales_by_the_requested_factor() {
        let mut upscaler = tiny();
        let image = DynamicImage::new_rgb8(16, 8);
        for (outscale, expected) in [(4.0, (64, 32)), (2.0, (32, 16)), (2.5, (40, 20)), (1.0, (16, 8))] {
            let out = upscaler.enhance(&image, outscale).unwrap();
            assert_eq!((out.width(), out.height()), expected, "outscale {outscale}");
        }
    }

    #[test]
    fn scaled_size_rounds() {
        assert_eq!(scaled_size(512, 512, 4.0), (2048, 2048));
        assert_eq!(scaled_size(512, 264, 1.5), (768, 396));
        assert_eq!(scaled_size(3, 3, 1.1), (3, 3));
        assert_eq!(scaled_size(1, 1, 0.1), (1, 1));
    }

    #[test]
    fn missing_weights_are_reported_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            upscaler_weights: dir.path().join("weights/RealESRGAN_x4plus.pth"),
            ..Default::default()
        };
        match RealEsrgan::load(&settings) {
            Err(Error::MissingUpscalerWeights(path)) => {
                assert_eq!(path, settings.upscaler_weights)
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("loading should fail"),
        }
    }

    #[test]
    fn x4plus_layout() {
        let cfg = RrdbConfig::x4plus();
        assert_eq!(cfg.num_block, 23);
        assert_eq!(cfg.num_feat, 64);
        assert_eq!(cfg.num_grow_ch, 32);
        assert_eq!(
            Settings::default().upscaler_weights,
            PathBuf::from("weights/RealESRGAN_x4plus.pth")
        );
    }
}
