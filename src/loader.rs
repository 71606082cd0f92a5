//! Engine loading.
//!
//! The synthesis engine is an external component driven through
//! [`EngineRuntime`]. Loading is strictly ordered:
//!
//! 1. install a [`ResourceLocator`] for the resolved binary assets,
//! 2. inject the engine API script,
//! 3. inject the bootstrap script, which starts initialization and later
//!    fires the readiness signal,
//! 4. once ready, build the synthesizer.
//!
//! Bootstrap code written for a single global runtime finds the current
//! [`EngineContext`] through [`installed_context`]. Only one load may hold that
//! slot at a time.

use async_trait::async_trait;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::cache::{DeliveryCache, FetchOutcome};
use crate::error::EngineError;
use crate::router::{DeliveryHandle, DeliveryMode, ResolvedAssets};
use crate::unpack::{EngineScripts, ENGINE_API_SCRIPT, ENGINE_BOOTSTRAP_SCRIPT};

lazy_static! {
    static ref INSTALL_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::new(());
    static ref INSTALLED: Mutex<Option<EngineContext>> = Mutex::new(None);
}

/// The context of the load currently holding the installation slot.
pub fn installed_context() -> Option<EngineContext> {
    INSTALLED.lock().ok().and_then(|slot| slot.clone())
}

/// Audio produced by one `generate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl GeneratedAudio {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Write the audio to a 32-bit float WAV file.
    pub fn write_wav(&self, path: &Path) -> Result<(), hound::Error> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptRole {
    Api,
    Bootstrap,
}

#[derive(Debug, Clone)]
pub struct ScriptAsset {
    pub name: String,
    pub role: ScriptRole,
    pub source: String,
}

/// Built once the engine runtime is ready; turns text into audio.
#[async_trait]
pub trait Synthesizer: Send {
    async fn generate(&mut self, text: &str) -> Result<GeneratedAudio, EngineError>;
}

/// The external engine, seen through the calls the loader makes on it.
#[async_trait]
pub trait EngineRuntime: Send + Sync {
    /// Evaluate one script. Injecting the bootstrap script must eventually
    /// lead to `ctx.ready().signal(..)`, possibly from another task.
    async fn inject_script(&self, ctx: &EngineContext, script: ScriptAsset)
        -> Result<(), EngineError>;

    /// Build the synthesis handle after readiness was signalled.
    async fn create_synthesizer(&self, ctx: &EngineContext)
        -> Result<Box<dyn Synthesizer>, EngineError>;
}

/// Resolves engine asset filenames to their delivery handles.
///
/// Ephemeral handles are handed out once; a second fetch of the same asset
/// reports [`EngineError::AssetUnavailable`].
#[derive(Clone)]
pub struct ResourceLocator {
    handles: Arc<Mutex<HashMap<String, DeliveryHandle>>>,
    cache: Option<DeliveryCache>,
}

impl ResourceLocator {
    pub fn new(resolved: ResolvedAssets, cache: Option<DeliveryCache>) -> Self {
        Self {
            handles: Arc::new(Mutex::new(resolved.into_handles())),
            cache,
        }
    }

    /// The handle registered for `filename`, if any.
    pub fn locate(&self, filename: &str) -> Option<DeliveryHandle> {
        self.handles
            .lock()
            .ok()
            .and_then(|handles| handles.get(filename).cloned())
    }

    pub async fn fetch(&self, filename: &str) -> Result<Arc<[u8]>, EngineError> {
        let handle = {
            let mut handles = self
                .handles
                .lock()
                .map_err(|_| EngineError::AssetUnavailable(filename.to_string()))?;
            match handles.get(filename) {
                Some(DeliveryHandle::Ephemeral(_)) => handles.remove(filename),
                Some(handle) => Some(handle.clone()),
                None => None,
            }
        };

        match handle {
            Some(DeliveryHandle::Ephemeral(handle)) => Ok(handle.into_bytes()),
            Some(DeliveryHandle::CachedUrl(url)) => {
                let cache = self.cache.as_ref().ok_or_else(|| {
                    EngineError::AssetUnavailable(format!("{url}: no delivery cache"))
                })?;
                match cache.fetch(&url).await {
                    Ok(FetchOutcome::Hit(asset)) => Ok(asset.bytes),
                    Ok(_) => Err(EngineError::AssetUnavailable(format!("{url}: not found"))),
                    Err(e) => Err(EngineError::AssetUnavailable(format!("{url}: {e}"))),
                }
            }
            None => Err(EngineError::AssetUnavailable(filename.to_string())),
        }
    }
}

/// Resolves exactly once; later signals are ignored.
#[derive(Clone)]
pub struct ReadySignal {
    tx: Arc<Mutex<Option<oneshot::Sender<Result<(), String>>>>>,
}

impl ReadySignal {
    fn new() -> (Self, oneshot::Receiver<Result<(), String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Returns false if readiness was already signalled.
    pub fn signal(&self, outcome: Result<(), String>) -> bool {
        let sender = self.tx.lock().ok().and_then(|mut tx| tx.take());
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

/// Everything one engine load shares with the runtime.
#[derive(Clone)]
pub struct EngineContext {
    voice: String,
    locator: ResourceLocator,
    ready: ReadySignal,
}

impl EngineContext {
    pub fn voice(&self) -> &str {
        &self.voice
    }

    pub fn locator(&self) -> &ResourceLocator {
        &self.locator
    }

    pub fn ready(&self) -> &ReadySignal {
        &self.ready
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Loading,
    Ready,
    Failed(String),
}

/// A ready engine. `generate` calls never overlap; a call made while another
/// is running is rejected with [`EngineError::Busy`].
pub struct EngineSession {
    voice: String,
    mode: DeliveryMode,
    synthesizer: tokio::sync::Mutex<Box<dyn Synthesizer>>,
}

impl EngineSession {
    pub fn voice(&self) -> &str {
        &self.voice
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.mode
    }

    pub async fn generate(&self, text: &str) -> Result<GeneratedAudio, EngineError> {
        let mut synthesizer = self.synthesizer.try_lock().map_err(|_| EngineError::Busy)?;
        synthesizer.generate(text).await
    }
}

/// Held while a load owns the installation slot. Clears the slot on drop;
/// a load that never settled is marked `Failed`.
struct Installation<'a> {
    state: &'a Mutex<EngineState>,
    settled: bool,
}

impl Drop for Installation<'_> {
    fn drop(&mut self) {
        if let Ok(mut installed) = INSTALLED.lock() {
            *installed = None;
        }
        if !self.settled {
            log::warn!("Engine load was cancelled before it finished");
            if let Ok(mut state) = self.state.lock() {
                *state = EngineState::Failed("engine load cancelled".to_string());
            }
        }
    }
}

/// Anything going wrong before the session exists is an initialization failure.
fn init_failed(e: EngineError) -> EngineError {
    match e {
        EngineError::InitFailed(_) => e,
        other => EngineError::InitFailed(other.to_string()),
    }
}

pub struct EngineLoader {
    runtime: Arc<dyn EngineRuntime>,
    cache: Option<DeliveryCache>,
    state: Mutex<EngineState>,
}

impl EngineLoader {
    pub fn new(runtime: Arc<dyn EngineRuntime>, cache: Option<DeliveryCache>) -> Self {
        Self {
            runtime,
            cache,
            state: Mutex::new(EngineState::Uninitialized),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or(EngineState::Uninitialized)
    }

    fn set_state(&self, state: EngineState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    /// Load and initialize the engine. Waits for as long as the engine takes
    /// to become ready; callers wanting a bound wrap this in a timeout.
    /// Dropping the returned future releases the installation slot and
    /// leaves the loader `Failed`.
    pub async fn load(
        &self,
        voice: &str,
        scripts: EngineScripts,
        resolved: ResolvedAssets,
    ) -> Result<EngineSession, EngineError> {
        let _slot = INSTALL_LOCK.lock().await;
        self.set_state(EngineState::Loading);
        let mut installation = Installation {
            state: &self.state,
            settled: false,
        };

        let result = self.load_installed(voice, scripts, resolved).await;

        match &result {
            Ok(_) => self.set_state(EngineState::Ready),
            Err(e) => self.set_state(EngineState::Failed(e.to_string())),
        }
        installation.settled = true;
        result
    }

    async fn load_installed(
        &self,
        voice: &str,
        scripts: EngineScripts,
        resolved: ResolvedAssets,
    ) -> Result<EngineSession, EngineError> {
        let mode = resolved.mode();
        let (ready, ready_rx) = ReadySignal::new();
        let ctx = EngineContext {
            voice: voice.to_string(),
            locator: ResourceLocator::new(resolved, self.cache.clone()),
            ready,
        };

        // 1. locator
        if let Ok(mut installed) = INSTALLED.lock() {
            *installed = Some(ctx.clone());
        }

        // 2. + 3. scripts, in order
        self.runtime
            .inject_script(
                &ctx,
                ScriptAsset {
                    name: ENGINE_API_SCRIPT.to_string(),
                    role: ScriptRole::Api,
                    source: scripts.api,
                },
            )
            .await
            .map_err(init_failed)?;
        self.runtime
            .inject_script(
                &ctx,
                ScriptAsset {
                    name: ENGINE_BOOTSTRAP_SCRIPT.to_string(),
                    role: ScriptRole::Bootstrap,
                    source: scripts.bootstrap,
                },
            )
            .await
            .map_err(init_failed)?;

        // The context still holds a sender, so this only resolves when the
        // runtime signals.
        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(EngineError::InitFailed(reason)),
            Err(_) => {
                return Err(EngineError::InitFailed(
                    "engine dropped its readiness signal".to_string(),
                ))
            }
        }

        // 4. synthesizer
        let synthesizer = self
            .runtime
            .create_synthesizer(&ctx)
            .await
            .map_err(init_failed)?;
        log::info!("Engine ready for voice '{}' ({:?} delivery)", voice, mode);

        Ok(EngineSession {
            voice: voice.to_string(),
            mode,
            synthesizer: tokio::sync::Mutex::new(synthesizer),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::DeliveryRouter;
    use crate::unpack::{test_support::*, unpack, ENGINE_DATA, ENGINE_MODULE};
    use serial_test::serial;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct EchoSynth;

    #[async_trait]
    impl Synthesizer for EchoSynth {
        async fn generate(&mut self, text: &str) -> Result<GeneratedAudio, EngineError> {
            tokio::task::yield_now().await;
            Ok(GeneratedAudio {
                samples: vec![0.1; text.len() * 10],
                sample_rate: 16000,
            })
        }
    }

    /// Records script order and signals readiness from a spawned task once
    /// both binary assets could be fetched.
    #[derive(Default)]
    struct RecordingRuntime {
        injected: Mutex<Vec<ScriptRole>>,
        fail_create: bool,
        fail_inject: bool,
        never_ready: bool,
        saw_slot: AtomicBool,
    }

    #[async_trait]
    impl EngineRuntime for RecordingRuntime {
        async fn inject_script(
            &self,
            ctx: &EngineContext,
            script: ScriptAsset,
        ) -> Result<(), EngineError> {
            self.injected.lock().unwrap().push(script.role);
            if self.fail_inject {
                return Err(EngineError::Busy);
            }
            if installed_context().map(|c| c.voice().to_string()) == Some(ctx.voice().to_string()) {
                self.saw_slot.store(true, Ordering::SeqCst);
            }
            if script.role == ScriptRole::Bootstrap && !self.never_ready {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let module = ctx.locator().fetch(ENGINE_MODULE).await;
                    let data = ctx.locator().fetch(ENGINE_DATA).await;
                    let outcome = match (module, data) {
                        (Ok(_), Ok(_)) => Ok(()),
                        (Err(e), _) | (_, Err(e)) => Err(e.to_string()),
                    };
                    ctx.ready().signal(outcome);
                });
            }
            Ok(())
        }

        async fn create_synthesizer(
            &self,
            _ctx: &EngineContext,
        ) -> Result<Box<dyn Synthesizer>, EngineError> {
            if self.fail_create {
                return Err(EngineError::SynthesisFailed("runtime missing".to_string()));
            }
            Ok(Box::new(EchoSynth))
        }
    }

    fn scripts_and_bundle() -> (EngineScripts, crate::unpack::AssetBundle) {
        let bundle = unpack(&build_archive(&complete_entries())).unwrap();
        (bundle.scripts(), bundle)
    }

    #[tokio::test]
    #[serial]
    async fn test_load_reaches_ready_in_order() {
        let runtime = Arc::new(RecordingRuntime::default());
        let loader = EngineLoader::new(runtime.clone(), None);
        let (scripts, bundle) = scripts_and_bundle();
        let resolved = DeliveryRouter::new(None).resolve(&bundle, "Emma").await;

        assert_eq!(loader.state(), EngineState::Uninitialized);
        let session = loader.load("Emma", scripts, resolved).await.unwrap();

        assert_eq!(loader.state(), EngineState::Ready);
        assert_eq!(
            *runtime.injected.lock().unwrap(),
            vec![ScriptRole::Api, ScriptRole::Bootstrap]
        );
        assert!(runtime.saw_slot.load(Ordering::SeqCst));
        assert!(installed_context().is_none());
        assert_eq!(session.delivery_mode(), DeliveryMode::Ephemeral);

        let audio = session.generate("Hello").await.unwrap();
        assert!(!audio.samples.is_empty());
        assert!(audio.sample_rate > 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_synthesizer_construction_failure_is_init_failed() {
        let runtime = Arc::new(RecordingRuntime {
            fail_create: true,
            ..Default::default()
        });
        let loader = EngineLoader::new(runtime, None);
        let (scripts, bundle) = scripts_and_bundle();
        let resolved = DeliveryRouter::new(None).resolve(&bundle, "Emma").await;

        let err = loader.load("Emma", scripts, resolved).await.err().unwrap();

        assert!(matches!(err, EngineError::InitFailed(_)));
        assert!(matches!(loader.state(), EngineState::Failed(_)));
    }

    #[tokio::test]
    #[serial]
    async fn test_script_injection_failure_is_init_failed() {
        let runtime = Arc::new(RecordingRuntime {
            fail_inject: true,
            ..Default::default()
        });
        let loader = EngineLoader::new(runtime.clone(), None);
        let (scripts, bundle) = scripts_and_bundle();
        let resolved = DeliveryRouter::new(None).resolve(&bundle, "Emma").await;

        let err = loader.load("Emma", scripts, resolved).await.err().unwrap();

        assert!(matches!(err, EngineError::InitFailed(_)));
        assert_eq!(*runtime.injected.lock().unwrap(), vec![ScriptRole::Api]);
        assert!(installed_context().is_none());
    }

    #[tokio::test]
    #[serial]
    async fn test_cancelled_load_releases_slot() {
        let runtime = Arc::new(RecordingRuntime {
            never_ready: true,
            ..Default::default()
        });
        let loader = EngineLoader::new(runtime, None);
        let (scripts, bundle) = scripts_and_bundle();
        let resolved = DeliveryRouter::new(None).resolve(&bundle, "Emma").await;

        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            loader.load("Emma", scripts, resolved),
        )
        .await;

        assert!(outcome.is_err());
        assert!(installed_context().is_none());
        assert!(matches!(loader.state(), EngineState::Failed(_)));

        // The slot is free for the next load.
        let (scripts, bundle) = scripts_and_bundle();
        let resolved = DeliveryRouter::new(None).resolve(&bundle, "Emma").await;
        let retry = EngineLoader::new(Arc::new(RecordingRuntime::default()), None);
        assert!(retry.load("Emma", scripts, resolved).await.is_ok());
    }

    #[tokio::test]
    async fn test_ready_signal_resolves_once() {
        let (signal, rx) = ReadySignal::new();
        assert!(signal.signal(Ok(())));
        assert!(!signal.signal(Err("late".to_string())));
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_ephemeral_handles_are_single_use() {
        let (_, bundle) = scripts_and_bundle();
        let resolved = DeliveryRouter::new(None).resolve(&bundle, "Emma").await;
        let locator = ResourceLocator::new(resolved, None);

        assert!(locator.locate(ENGINE_MODULE).is_some());
        assert!(locator.fetch(ENGINE_MODULE).await.is_ok());
        assert!(matches!(
            locator.fetch(ENGINE_MODULE).await,
            Err(EngineError::AssetUnavailable(_))
        ));
        assert!(locator.fetch("unknown.bin").await.is_err());
    }

    #[tokio::test]
    async fn test_cached_handles_can_be_fetched_repeatedly() {
        let cache = DeliveryCache::spawn(
            crate::cache::CacheConfig::new("http://127.0.0.1:7878").unwrap(),
        );
        let (_, bundle) = scripts_and_bundle();
        let resolved = DeliveryRouter::new(Some(cache.clone()))
            .resolve(&bundle, "Emma")
            .await;
        let locator = ResourceLocator::new(resolved, Some(cache));

        let first = locator.fetch(ENGINE_DATA).await.unwrap();
        let second = locator.fetch(ENGINE_DATA).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_concurrent_generate_is_busy() {
        struct Gate(Arc<tokio::sync::Notify>);

        #[async_trait]
        impl Synthesizer for Gate {
            async fn generate(&mut self, _text: &str) -> Result<GeneratedAudio, EngineError> {
                self.0.notified().await;
                Ok(GeneratedAudio {
                    samples: vec![0.0; 4],
                    sample_rate: 8000,
                })
            }
        }

        let gate = Arc::new(tokio::sync::Notify::new());
        let session = Arc::new(EngineSession {
            voice: "Emma".to_string(),
            mode: DeliveryMode::Ephemeral,
            synthesizer: tokio::sync::Mutex::new(Box::new(Gate(gate.clone()))),
        });

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.generate("one").await })
        };
        // Let the first call take the synthesizer.
        while session.synthesizer.try_lock().is_ok() {
            tokio::task::yield_now().await;
        }

        assert_eq!(session.generate("two").await, Err(EngineError::Busy));
        gate.notify_one();
        assert!(first.await.unwrap().is_ok());
    }

    #[test]
    fn test_write_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let audio = GeneratedAudio {
            samples: vec![0.0, 0.5, -0.5, 0.25],
            sample_rate: 16000,
        };
        audio.write_wav(&path).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.len(), 4);
    }
}
