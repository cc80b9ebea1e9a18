use std::path::Path;

use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, ImageBuffer};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Where models are placed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePolicy {
    Cpu,
    /// Use an accelerator when one is present, otherwise fall back to the CPU.
    #[default]
    Auto,
    /// Fail when no accelerator is present.
    Accelerator,
}

pub fn device(policy: DevicePolicy) -> Result<Device> {
    match policy {
        DevicePolicy::Cpu => Ok(Device::Cpu),
        _ if cuda_is_available() => Ok(Device::new_cuda(0)?),
        _ if metal_is_available() => Ok(Device::new_metal(0)?),
        DevicePolicy::Accelerator => Err(Error::AcceleratorUnavailable),
        DevicePolicy::Auto => {
            warn!("Running on CPU, to run on GPU, build with `--features cuda` or `--features metal`");
            Ok(Device::Cpu)
        }
    }
}

/// Half precision is only worth it (and only supported for convolutions) on accelerators.
pub fn dtype(device: &Device, use_f16: bool) -> DType {
    if use_f16 && !device.is_cpu() {
        DType::F16
    } else {
        DType::F32
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channel, height, width) = img.dims3()?;
    if channel != 3 {
        return Err(Error::Msg(
            "tensor_to_image expects an input of shape (3, height, width)".to_string(),
        ));
    }
    let img = img.to_device(&Device::Cpu)?.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let image: ImageBuffer<image::Rgb<u8>, Vec<u8>> =
        match ImageBuffer::from_raw(width as u32, height as u32, pixels) {
            Some(image) => image,
            None => return Err(Error::Msg("error converting tensor to image".to_string())),
        };
    Ok(DynamicImage::ImageRgb8(image))
}

/// Converts an image into a f32 tensor with shape (1, 3, height, width) and values in [0, 1].
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = img.to_rgb8();
    let (width, height) = img.dimensions();
    let img = Tensor::from_vec(img.into_raw(), (height as usize, width as usize, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1. / 255., 0.)?
        .unsqueeze(0)?
        .to_device(device)?;
    Ok(img)
}

/// Saves an image to disk, the format is picked from the extension.
pub fn save_image<P: AsRef<Path>>(img: &DynamicImage, p: P) -> Result<()> {
    img.save(p)?;
    Ok(())
}

pub fn output_filename(basename: &str, sample_idx: usize, num_samples: usize) -> String {
    if num_samples <= 1 {
        return basename.to_string();
    }
    match basename.rsplit_once('.') {
        None => format!("{basename}.{sample_idx}.png"),
        Some((filename_no_extension, extension)) => {
            format!("{filename_no_extension}.{sample_idx}.{extension}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_filenames() {
        assert_eq!(output_filename("sd_final.png", 1, 1), "sd_final.png");
        assert_eq!(output_filename("sd_final.png", 2, 3), "sd_final.2.png");
        assert_eq!(output_filename("out/run.v2.jpg", 1, 2), "out/run.v2.1.jpg");
        assert_eq!(output_filename("sd_final", 3, 4), "sd_final.3.png");
    }

    #[test]
    fn cpu_policy_never_touches_accelerators() {
        let device = device(DevicePolicy::Cpu).unwrap();
        assert!(device.is_cpu());
        assert_eq!(dtype(&device, true), DType::F32);
    }

    #[test]
    fn tensors_and_images_agree_on_layout() {
        let mut img = image::RgbImage::new(4, 2);
        img.put_pixel(3, 1, image::Rgb([255, 0, 51]));
        let img = DynamicImage::ImageRgb8(img);

        let tensor = image_to_tensor(&img, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 2, 4]);

        let back = ((tensor.squeeze(0).unwrap() * 255.).unwrap())
            .round()
            .unwrap()
            .to_dtype(DType::U8)
            .unwrap();
        let back = tensor_to_image(&back).unwrap();
        assert_eq!((back.width(), back.height()), (4, 2));
        assert_eq!(back.to_rgb8().get_pixel(3, 1), &image::Rgb([255, 0, 51]));
        assert_eq!(back.to_rgb8().get_pixel(0, 0), &image::Rgb([0, 0, 0]));
    }

    #[test]
    fn non_rgb_tensors_are_rejected() {
        let tensor = Tensor::zeros((1, 2, 2), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }
}
