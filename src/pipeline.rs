use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use tokio::sync::oneshot;
use tracing::info;

use crate::{
    model::ModelChoice,
    provider::{lock, ModelProvider},
    request::GenerationRequest,
    utils::{output_filename, save_image},
    Error, Result,
};

/// Cooperative cancellation flag shared between a running request and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fails with [`Error::Cancelled`] once the token has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The images produced by one request, in generation order.
#[derive(Debug, Clone, Default)]
pub struct ImageBatch(Vec<DynamicImage>);

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DynamicImage> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<DynamicImage> {
        self.0
    }

    /// Writes every image next to `basename`, numbering them when there is more than one.
    pub fn save<P: AsRef<Path>>(&self, basename: P) -> Result<Vec<String>> {
        let basename = basename.as_ref().to_string_lossy();
        let mut written = Vec::with_capacity(self.len());
        for (idx, image) in self.0.iter().enumerate() {
            let filename = output_filename(&basename, idx + 1, self.len());
            save_image(image, &filename)?;
            written.push(filename);
        }
        Ok(written)
    }
}

impl From<Vec<DynamicImage>> for ImageBatch {
    fn from(images: Vec<DynamicImage>) -> Self {
        Self(images)
    }
}

impl IntoIterator for ImageBatch {
    type Item = DynamicImage;
    type IntoIter = std::vec::IntoIter<DynamicImage>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Model selection, synthesis and optional upscaling for one request at a time.
#[derive(Clone)]
pub struct Pipeline {
    provider: Arc<dyn ModelProvider>,
}

impl Pipeline {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }

    pub fn generate(&self, request: &GenerationRequest) -> Result<ImageBatch> {
        self.generate_with(request, &CancelToken::default())
    }

    /// Runs the request to completion. Any failure aborts the whole request, there are
    /// no partial batches.
    pub fn generate_with(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<ImageBatch> {
        let model = ModelChoice::from_label(&request.model)?;
        request.validate()?;
        let start = Instant::now();

        // Loading can mean a multi-gigabyte download, so the token is checked around it.
        // The upscaler comes first so a missing weights file fails before any sampling.
        cancel.check()?;
        let upscaler = if request.upscale {
            Some(self.provider.upscaler()?)
        } else {
            None
        };

        cancel.check()?;
        let synthesizer = self.provider.text_to_image(model)?;
        cancel.check()?;
        let images = lock(&*synthesizer)?.generate(&request.synthesis(), cancel)?;
        info!(
            "Generated {} image(s) with {model} in {:.2}s.",
            images.len(),
            start.elapsed().as_secs_f32()
        );

        let Some(upscaler) = upscaler else {
            return Ok(ImageBatch(images));
        };
        let mut upscaler = lock(&*upscaler)?;
        let mut upscaled = Vec::with_capacity(images.len());
        for (idx, image) in images.iter().enumerate() {
            cancel.check()?;
            info!("Upscaling image {}/{} by {}.", idx + 1, images.len(), request.scale_factor);
            upscaled.push(upscaler.enhance(image, request.scale_factor)?);
        }
        Ok(ImageBatch(upscaled))
    }

    /// Runs the request on the blocking pool so the caller's thread stays responsive.
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, request: GenerationRequest) -> GenerationTask {
        let cancel = CancelToken::default();
        let (tx, rx) = oneshot::channel();
        let pipeline = self.clone();
        let token = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let result = pipeline.generate_with(&request, &token);
            // The receiver is gone when the caller stopped waiting.
            let _ = tx.send(result);
        });
        GenerationTask { cancel, result: rx }
    }
}

/// Handle to a request running in the background.
pub struct GenerationTask {
    cancel: CancelToken,
    result: oneshot::Receiver<Result<ImageBatch>>,
}

impl GenerationTask {
    /// Asks the request to stop at the next denoising step or image.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<ImageBatch> {
        self.result
            .await
            .map_err(|_| Error::Msg("generation task ended without a result".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_tokens_are_shared() {
        let token = CancelToken::default();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        assert!(clone.check().is_ok());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn saving_numbers_multiple_images() {
        let dir = tempfile::tempdir().unwrap();
        let batch = ImageBatch::from(vec![DynamicImage::new_rgb8(8, 8); 2]);
        let written = batch.save(dir.path().join("out.png")).unwrap();
        assert_eq!(written.len(), 2);
        assert!(written[0].ends_with("out.1.png"));
        assert!(written[1].ends_with("out.2.png"));
        for filename in written {
            let image = image::open(filename).unwrap();
            assert_eq!((image.width(), image.height()), (8, 8));
        }
    }

    #[test]
    fn saving_a_single_image_keeps_the_name() {
        let dir = tempfile::tempdir().unwrap();
        let batch = ImageBatch::from(vec![DynamicImage::new_rgb8(8, 8)]);
        let written = batch.save(dir.path().join("out.png")).unwrap();
        assert!(written[0].ends_with("out.png"));
        assert!(dir.path().join("out.png").is_file());
    }
}
