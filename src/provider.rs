//! Acquiring loaded models for the pipeline stages.
//!
//! A [`Loader`] knows how to build models from weights. A [`ModelProvider`] decides
//! when to call it: [`FreshProvider`] reloads on every request, [`CachedProvider`]
//! keeps models around with capacity and time based eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use image::DynamicImage;
use tracing::{debug, info};

use crate::{
    config::{CacheSettings, Settings},
    diffusion::StableDiffusion,
    model::ModelChoice,
    pipeline::CancelToken,
    request::SynthesisParams,
    upscale::RealEsrgan,
    Error, Result,
};

pub trait TextToImage: Send {
    /// Produces `params.batch_size` images of `params.height` x `params.width`.
    fn generate(&mut self, params: &SynthesisParams, cancel: &CancelToken)
        -> Result<Vec<DynamicImage>>;
}

pub trait Upscale: Send {
    /// Produces a copy of `image` with both sides multiplied by `outscale`.
    fn enhance(&mut self, image: &DynamicImage, outscale: f64) -> Result<DynamicImage>;
}

pub type SharedTextToImage = Arc<Mutex<dyn TextToImage>>;
pub type SharedUpscale = Arc<Mutex<dyn Upscale>>;

pub trait Loader: Send + Sync {
    type Diffusion: TextToImage + 'static;
    type Upscaler: Upscale + 'static;

    fn load_diffusion(&self, model: ModelChoice) -> Result<Self::Diffusion>;

    fn load_upscaler(&self) -> Result<Self::Upscaler>;
}

pub trait ModelProvider: Send + Sync {
    fn text_to_image(&self, model: ModelChoice) -> Result<SharedTextToImage>;

    fn upscaler(&self) -> Result<SharedUpscale>;
}

/// Locks a shared model, turning poisoning into an error.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Msg("a model was poisoned by a panicking request".to_string()))
}

/// Loads Stable Diffusion checkpoints from the hub and Real-ESRGAN from local weights.
#[derive(Debug, Clone)]
pub struct HubLoader {
    settings: Settings,
}

impl HubLoader {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

impl Loader for HubLoader {
    type Diffusion = StableDiffusion;
    type Upscaler = RealEsrgan;

    fn load_diffusion(&self, model: ModelChoice) -> Result<StableDiffusion> {
        StableDiffusion::load(model, &self.settings)
    }

    fn load_upscaler(&self) -> Result<RealEsrgan> {
        RealEsrgan::load(&self.settings)
    }
}

/// Loads every model anew for every request.
pub struct FreshProvider<L> {
    loader: L,
}

impl<L: Loader> FreshProvider<L> {
    pub fn new(loader: L) -> Self {
        Self { loader }
    }
}

impl<L: Loader> ModelProvider for FreshProvider<L> {
    fn text_to_image(&self, model: ModelChoice) -> Result<SharedTextToImage> {
        Ok(Arc::new(Mutex::new(self.loader.load_diffusion(model)?)))
    }

    fn upscaler(&self) -> Result<SharedUpscale> {
        Ok(Arc::new(Mutex::new(self.loader.load_upscaler()?)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Maximum number of diffusion models kept loaded at once.
    pub capacity: usize,
    /// Entries unused for longer than this are dropped.
    pub ttl: Option<Duration>,
}

impl From<&CacheSettings> for CachePolicy {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            capacity: settings.capacity.max(1),
            ttl: settings.ttl(),
        }
    }
}

struct Entry<T: ?Sized> {
    model: Arc<Mutex<T>>,
    last_used: Instant,
}

impl<T: ?Sized> Entry<T> {
    fn new(model: Arc<Mutex<T>>) -> Self {
        Self {
            model,
            last_used: Instant::now(),
        }
    }

    fn expired(&self, ttl: Option<Duration>, now: Instant) -> bool {
        ttl.is_some_and(|ttl| now.duration_since(self.last_used) > ttl)
    }

    fn touch(&mut self, now: Instant) -> Arc<Mutex<T>> {
        self.last_used = now;
        self.model.clone()
    }
}

#[derive(Default)]
struct Cache {
    diffusion: HashMap<ModelChoice, Entry<dyn TextToImage>>,
    upscaler: Option<Entry<dyn Upscale>>,
}

/// Keeps loaded models between requests.
///
/// Loading happens while the cache lock is held, so two requests for the same model
/// never load it twice. Evicted models stay alive until the requests using them finish.
pub struct CachedProvider<L> {
    loader: L,
    policy: CachePolicy,
    cache: Mutex<Cache>,
}

impl<L: Loader> CachedProvider<L> {
    pub fn new(loader: L, policy: CachePolicy) -> Self {
        Self {
            loader,
            policy,
            cache: Mutex::new(Cache::default()),
        }
    }

    fn evict_expired(&self, cache: &mut Cache, now: Instant) {
        let ttl = self.policy.ttl;
        cache.diffusion.retain(|model, entry| {
            let keep = !entry.expired(ttl, now);
            if !keep {
                debug!("Evicting {model} after {ttl:?} unused.");
            }
            keep
        });
        if cache.upscaler.as_ref().is_some_and(|e| e.expired(ttl, now)) {
            debug!("Evicting the upscaler after {ttl:?} unused.");
            cache.upscaler = None;
        }
    }

    /// Number of diffusion models currently loaded.
    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.diffusion.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: Loader> ModelProvider for CachedProvider<L> {
    fn text_to_image(&self, model: ModelChoice) -> Result<SharedTextToImage> {
        let mut cache = lock(&self.cache)?;
        let now = Instant::now();
        self.evict_expired(&mut cache, now);

        if let Some(entry) = cache.diffusion.get_mut(&model) {
            debug!("Reusing loaded {model}.");
            return Ok(entry.touch(now));
        }

        while cache.diffusion.len() >= self.policy.capacity {
            let oldest = cache
                .diffusion
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(model, _)| *model);
            match oldest {
                Some(oldest) => {
                    info!("Evicting {oldest} to make room for {model}.");
                    cache.diffusion.remove(&oldest);
                }
                None => break,
            }
        }

        let loaded: SharedTextToImage = Arc::new(Mutex::new(self.loader.load_diffusion(model)?));
        cache.diffusion.insert(model, Entry::new(loaded.clone()));
        Ok(loaded)
    }

    fn upscaler(&self) -> Result<SharedUpscale> {
        let mut cache = lock(&self.cache)?;
        let now = Instant::now();
        self.evict_expired(&mut cache, now);

        if let Some(entry) = cache.upscaler.as_mut() {
            return Ok(entry.touch(now));
        }
        let loaded: SharedUpscale = Arc::new(Mutex::new(self.loader.load_upscaler()?));
        cache.upscaler = Some(Entry::new(loaded.clone()));
        Ok(loaded)
    }
}

/// Builds the provider described by the settings.
pub fn from_settings(settings: &Settings) -> Arc<dyn ModelProvider> {
    let loader = HubLoader::new(settings.clone());
    if settings.cache.enabled {
        Arc::new(CachedProvider::new(loader, CachePolicy::from(&settings.cache)))
    } else {
        Arc::new(FreshProvider::new(loader))
    }
}
