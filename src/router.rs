//! Delivery routing: decide how the engine will reach each binary asset.
//!
//! Both binary assets go through the delivery cache under URLs namespaced by
//! voice, or both become ephemeral in-process handles. The pair is never
//! split across the two modes.

use reqwest::Url;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::{voice_asset_url, DeliveryCache};
use crate::error::CacheError;
use crate::unpack::{AssetBundle, ENGINE_DATA, ENGINE_MODULE};

/// Binary assets resolved per activation, with their MIME types.
pub const BINARY_ASSETS: [(&str, &str); 2] = [
    (ENGINE_MODULE, "application/wasm"),
    (ENGINE_DATA, "application/octet-stream"),
];

static NEXT_EPHEMERAL_ID: AtomicU64 = AtomicU64::new(1);

/// In-process bytes that were never registered anywhere. Valid only for the
/// current session; the engine consumes it by value.
#[derive(Clone)]
pub struct EphemeralHandle {
    id: u64,
    bytes: Arc<[u8]>,
}

impl EphemeralHandle {
    pub fn new(bytes: Arc<[u8]>) -> Self {
        Self {
            id: NEXT_EPHEMERAL_ID.fetch_add(1, Ordering::Relaxed),
            bytes,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Arc<[u8]> {
        self.bytes
    }
}

impl fmt::Debug for EphemeralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EphemeralHandle(ephemeral:{}, {} bytes)", self.id, self.bytes.len())
    }
}

#[derive(Debug, Clone)]
pub enum DeliveryHandle {
    CachedUrl(Url),
    Ephemeral(EphemeralHandle),
}

impl DeliveryHandle {
    pub fn is_cached(&self) -> bool {
        matches!(self, DeliveryHandle::CachedUrl(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Cached,
    Ephemeral,
}

/// One handle per binary asset, all in the same mode.
#[derive(Debug, Clone)]
pub struct ResolvedAssets {
    mode: DeliveryMode,
    handles: HashMap<String, DeliveryHandle>,
}

impl ResolvedAssets {
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn get(&self, filename: &str) -> Option<&DeliveryHandle> {
        self.handles.get(filename)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn into_handles(self) -> HashMap<String, DeliveryHandle> {
        self.handles
    }
}

#[derive(Clone)]
pub struct DeliveryRouter {
    cache: Option<DeliveryCache>,
}

impl DeliveryRouter {
    pub fn new(cache: Option<DeliveryCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> Option<&DeliveryCache> {
        self.cache.as_ref()
    }

    pub async fn resolve(&self, bundle: &AssetBundle, voice: &str) -> ResolvedAssets {
        let binaries: Vec<(&str, &str, Arc<[u8]>)> = BINARY_ASSETS
            .iter()
            .filter_map(|(name, mime)| bundle.binary(name).map(|bytes| (*name, *mime, bytes)))
            .collect();

        if let Some(cache) = &self.cache {
            match register_all(cache, voice, &binaries).await {
                Ok(handles) => {
                    log::info!("Voice '{}' assets delivered through the cache", voice);
                    return ResolvedAssets {
                        mode: DeliveryMode::Cached,
                        handles,
                    };
                }
                Err(e) => {
                    log::warn!(
                        "Delivery degraded for voice '{}', using ephemeral handles: {}",
                        voice,
                        e
                    );
                }
            }
        } else {
            log::info!("No delivery cache, using ephemeral handles for '{}'", voice);
        }

        let handles = binaries
            .into_iter()
            .map(|(name, _, bytes)| {
                (name.to_string(), DeliveryHandle::Ephemeral(EphemeralHandle::new(bytes)))
            })
            .collect();
        ResolvedAssets {
            mode: DeliveryMode::Ephemeral,
            handles,
        }
    }
}

/// Register every binary or none: on the first failure, registrations already
/// made for this activation are evicted again.
async fn register_all(
    cache: &DeliveryCache,
    voice: &str,
    binaries: &[(&str, &str, Arc<[u8]>)],
) -> Result<HashMap<String, DeliveryHandle>, CacheError> {
    if !cache.is_active() {
        return Err(CacheError::Unavailable);
    }

    let mut registered: Vec<Url> = Vec::with_capacity(binaries.len());
    for (name, mime, bytes) in binaries {
        let url = voice_asset_url(cache.origin(), voice, name);
        if let Err(e) = cache.register(url.clone(), bytes.clone(), mime).await {
            for url in &registered {
                let _ = cache.evict(url).await;
            }
            return Err(e);
        }
        registered.push(url);
    }

    Ok(binaries
        .iter()
        .zip(registered)
        .map(|((name, _, _), url)| (name.to_string(), DeliveryHandle::CachedUrl(url)))
        .collect())
}
