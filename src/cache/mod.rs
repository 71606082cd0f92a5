//! Delivery cache: a long-lived background task that serves registered byte
//! payloads by URL.
//!
//! URLs under `<origin>/voice/` are answered only from registrations. Other
//! same-origin URLs, and URLs on the one allow-listed script host, use a
//! cache-then-network policy. Everything else passes through untouched.

pub mod server;

use async_trait::async_trait;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task;

use crate::error::CacheError;

const VOICE_NAMESPACE: &str = "voice";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub origin: Url,
    pub allowed_script_host: Option<String>,
    /// Byte budget for voice registrations. `None` means unlimited.
    pub quota_bytes: Option<usize>,
}

impl CacheConfig {
    pub fn new(origin: &str) -> Result<Self, CacheError> {
        let origin = Url::parse(origin)
            .map_err(|e| CacheError::InvalidUrl(format!("{origin}: {e}")))?;
        if origin.cannot_be_a_base() {
            return Err(CacheError::InvalidUrl(format!("{origin} cannot hold paths")));
        }
        Ok(Self {
            origin,
            allowed_script_host: None,
            quota_bytes: None,
        })
    }

    pub fn with_allowed_script_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_script_host = Some(host.into());
        self
    }

    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAsset {
    pub bytes: Arc<[u8]>,
    pub mime: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Hit(CachedAsset),
    NotFound,
    /// Not handled by this cache; the caller goes to the network itself.
    PassThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestRoute {
    Voice,
    Static,
    PassThrough,
}

/// URL under which a voice's binary asset is registered:
/// `<origin>/voice/<voice>/<filename>`. Each part is percent-encoded as one
/// path segment, so voice names cannot escape their namespace.
pub fn voice_asset_url(origin: &Url, voice: &str, filename: &str) -> Url {
    let mut url = origin.clone();
    url.set_query(None);
    url.set_fragment(None);
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().extend([VOICE_NAMESPACE, voice, filename]);
    }
    url
}

pub fn classify(config: &CacheConfig, url: &Url) -> RequestRoute {
    let same_origin = url.origin() == config.origin.origin();
    if same_origin && url.path().contains("/voice/") {
        RequestRoute::Voice
    } else if same_origin {
        RequestRoute::Static
    } else if url.host_str().is_some() && url.host_str() == config.allowed_script_host.as_deref()
    {
        RequestRoute::Static
    } else {
        RequestRoute::PassThrough
    }
}

/// Network side of the cache-then-network policy.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn get(&self, url: &Url) -> Result<CachedAsset, CacheError>;
}

pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn get(&self, url: &Url) -> Result<CachedAsset, CacheError> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CacheError::Network(e.to_string()))?;

        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| CacheError::Network(e.to_string()))?;

        Ok(CachedAsset {
            bytes: Arc::from(bytes.as_ref()),
            mime,
        })
    }
}

enum CacheMessage {
    Register {
        url: Url,
        asset: CachedAsset,
        reply: oneshot::Sender<Result<(), CacheError>>,
    },
    Lookup {
        url: Url,
        route: RequestRoute,
        reply: oneshot::Sender<Option<CachedAsset>>,
    },
    StoreStatic {
        url: Url,
        asset: CachedAsset,
    },
    Evict {
        url: Url,
        reply: oneshot::Sender<bool>,
    },
    EvictPrefix {
        prefix: String,
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

#[derive(Default)]
struct Entries {
    voice: HashMap<String, CachedAsset>,
    statics: HashMap<String, CachedAsset>,
    voice_bytes: usize,
}

impl Entries {
    fn register(
        &mut self,
        url: Url,
        asset: CachedAsset,
        quota: Option<usize>,
    ) -> Result<(), CacheError> {
        let key = url.to_string();
        let replaced = self.voice.get(&key).map(|a| a.bytes.len()).unwrap_or(0);
        let in_use = self.voice_bytes - replaced;
        if let Some(quota) = quota {
            let available = quota.saturating_sub(in_use);
            if asset.bytes.len() > available {
                return Err(CacheError::QuotaExceeded {
                    needed: asset.bytes.len(),
                    available,
                });
            }
        }
        self.voice_bytes = in_use + asset.bytes.len();
        self.voice.insert(key, asset);
        Ok(())
    }

    fn remove_voice(&mut self, key: &str) -> bool {
        match self.voice.remove(key) {
            Some(asset) => {
                self.voice_bytes -= asset.bytes.len();
                true
            }
            None => false,
        }
    }
}

/// Handle to the background delivery cache. Cheap to clone.
#[derive(Clone)]
pub struct DeliveryCache {
    tx: mpsc::Sender<CacheMessage>,
    active: Arc<AtomicBool>,
    config: Arc<CacheConfig>,
    upstream: Arc<dyn Upstream>,
}

impl DeliveryCache {
    pub fn spawn(config: CacheConfig) -> Self {
        Self::spawn_with_upstream(config, Arc::new(HttpUpstream::new()))
    }

    pub fn spawn_with_upstream(config: CacheConfig, upstream: Arc<dyn Upstream>) -> Self {
        let (tx, mut rx) = mpsc::channel::<CacheMessage>(64);
        let active = Arc::new(AtomicBool::new(true));
        let quota = config.quota_bytes;

        let worker_active = active.clone();
        task::spawn(async move {
            let mut entries = Entries::default();
            while let Some(msg) = rx.recv().await {
                match msg {
                    CacheMessage::Register { url, asset, reply } => {
                        let size = asset.bytes.len();
                        let result = entries.register(url.clone(), asset, quota);
                        match &result {
                            Ok(()) => {
                                log::debug!("Delivery cache registered {} ({} bytes)", url, size)
                            }
                            Err(e) => log::warn!("Delivery cache refused {}: {}", url, e),
                        }
                        let _ = reply.send(result);
                    }
                    CacheMessage::Lookup { url, route, reply } => {
                        let map = match route {
                            RequestRoute::Voice => &entries.voice,
                            _ => &entries.statics,
                        };
                        let _ = reply.send(map.get(url.as_str()).cloned());
                    }
                    CacheMessage::StoreStatic { url, asset } => {
                        entries.statics.insert(url.to_string(), asset);
                    }
                    CacheMessage::Evict { url, reply } => {
                        let removed = entries.remove_voice(url.as_str())
                            | entries.statics.remove(url.as_str()).is_some();
                        let _ = reply.send(removed);
                    }
                    CacheMessage::EvictPrefix { prefix, reply } => {
                        let keys: Vec<String> = entries
                            .voice
                            .keys()
                            .filter(|k| k.starts_with(&prefix))
                            .cloned()
                            .collect();
                        for key in &keys {
                            entries.remove_voice(key);
                        }
                        let _ = reply.send(keys.len());
                    }
                    CacheMessage::Shutdown => break,
                }
            }
            worker_active.store(false, Ordering::SeqCst);
            log::info!("Delivery cache stopped");
        });

        Self {
            tx,
            active,
            config: Arc::new(config),
            upstream,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    pub fn origin(&self) -> &Url {
        &self.config.origin
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> CacheMessage,
    ) -> Result<T, CacheError> {
        if !self.is_active() {
            return Err(CacheError::Unavailable);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CacheError::Closed)?;
        rx.await.map_err(|_| CacheError::Closed)
    }

    /// Make `bytes` servable at `url` until evicted or the cache stops.
    pub async fn register(&self, url: Url, bytes: Arc<[u8]>, mime: &str) -> Result<(), CacheError> {
        let asset = CachedAsset {
            bytes,
            mime: mime.to_string(),
        };
        self.request(|reply| CacheMessage::Register { url, asset, reply })
            .await?
    }

    pub async fn fetch(&self, url: &Url) -> Result<FetchOutcome, CacheError> {
        let route = classify(&self.config, url);
        if route == RequestRoute::PassThrough {
            return Ok(FetchOutcome::PassThrough);
        }

        let cached = self
            .request(|reply| CacheMessage::Lookup {
                url: url.clone(),
                route,
                reply,
            })
            .await?;

        match (route, cached) {
            (_, Some(asset)) => Ok(FetchOutcome::Hit(asset)),
            (RequestRoute::Voice, None) => Ok(FetchOutcome::NotFound),
            (_, None) => {
                let asset = self.upstream.get(url).await?;
                let _ = self
                    .tx
                    .send(CacheMessage::StoreStatic {
                        url: url.clone(),
                        asset: asset.clone(),
                    })
                    .await;
                Ok(FetchOutcome::Hit(asset))
            }
        }
    }

    pub async fn evict(&self, url: &Url) -> Result<bool, CacheError> {
        self.request(|reply| CacheMessage::Evict {
            url: url.clone(),
            reply,
        })
        .await
    }

    /// Drop every registration made for `voice`. Returns how many were removed.
    pub async fn evict_voice(&self, voice: &str) -> Result<usize, CacheError> {
        let prefix = voice_asset_url(&self.config.origin, voice, "").to_string();
        self.request(|reply| CacheMessage::EvictPrefix { prefix, reply })
            .await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(CacheMessage::Shutdown).await;
    }
}
