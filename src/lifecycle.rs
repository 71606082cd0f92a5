//! Voice lifecycle controller.
//!
//! Drives one activation at a time through
//! `CheckingStorage → Unpacking → Delivering → EngineLoading → Ready`,
//! with `AwaitingUpload → Persisting` in front when there is no stored
//! package. Progress goes out on a broadcast channel; every failure is
//! reported once and leaves the controller in a known-good state (the
//! previous engine if there is one, otherwise waiting for an upload).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::error::{UnpackError, VoiceError};
use crate::history::PhraseHistory;
use crate::loader::{EngineLoader, EngineSession, EngineState, GeneratedAudio};
use crate::playback::PlaybackOutput;
use crate::router::{DeliveryMode, DeliveryRouter};
use crate::store::LocalStore;
use crate::unpack;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    CheckingStorage,
    FoundPackage,
    NoPackage,
    AwaitingUpload,
    Persisting,
    Unpacking,
    Delivering,
    EngineLoading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub state: LifecycleState,
    pub message: String,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.state, self.message)
    }
}

pub enum PackageSource {
    /// Fresh bytes from the user; persisted before anything else happens.
    Upload { name: String, bytes: Vec<u8> },
    /// A package already in the local store.
    Stored { name: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageTimings {
    pub storage: Duration,
    pub unpack: Duration,
    pub delivery: Duration,
    pub engine: Duration,
}

impl StageTimings {
    pub fn total(&self) -> Duration {
        self.storage + self.unpack + self.delivery + self.engine
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub voice: String,
    pub mode: DeliveryMode,
    pub assets: usize,
    pub persisted: bool,
    pub timings: StageTimings,
}

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub settle_delay: Duration,
    pub engine_load_timeout: Option<Duration>,
    pub history_limit: usize,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(50),
            engine_load_timeout: None,
            history_limit: crate::history::DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Clears the in-flight flag when an activation ends, however it ends.
struct ActivationGuard<'a>(&'a AtomicBool);

impl Drop for ActivationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct VoiceLifecycle {
    store: Option<Arc<dyn LocalStore>>,
    router: DeliveryRouter,
    loader: EngineLoader,
    playback: Arc<dyn PlaybackOutput>,
    options: LifecycleOptions,
    state: Mutex<LifecycleState>,
    session: RwLock<Option<Arc<EngineSession>>>,
    history: Mutex<PhraseHistory>,
    activating: AtomicBool,
    events: broadcast::Sender<LifecycleEvent>,
}

impl VoiceLifecycle {
    pub fn new(
        store: Option<Arc<dyn LocalStore>>,
        router: DeliveryRouter,
        loader: EngineLoader,
        playback: Arc<dyn PlaybackOutput>,
        options: LifecycleOptions,
    ) -> Self {
        let stored_history = match &store {
            Some(store) => store.load_history().unwrap_or_else(|e| {
                log::warn!("Could not read phrase history: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        let (events, _) = broadcast::channel(64);

        Self {
            store,
            router,
            loader,
            playback,
            history: Mutex::new(PhraseHistory::from_entries(
                stored_history,
                options.history_limit,
            )),
            options,
            state: Mutex::new(LifecycleState::Idle),
            session: RwLock::new(None),
            activating: AtomicBool::new(false),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or(LifecycleState::Failed)
    }

    /// State of the engine loader, independent of the activation state.
    pub fn engine_state(&self) -> EngineState {
        self.loader.state()
    }

    pub fn current_voice(&self) -> Option<String> {
        self.session().map(|s| s.voice().to_string())
    }

    pub fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .map(|h| h.entries())
            .unwrap_or_default()
    }

    fn session(&self) -> Option<Arc<EngineSession>> {
        self.session.read().ok().and_then(|s| s.clone())
    }

    fn transition(&self, state: LifecycleState, message: impl Into<String>) {
        let message = message.into();
        log::info!("{:?}: {}", state, message);
        if let Ok(mut current) = self.state.lock() {
            *current = state.clone();
        }
        let _ = self.events.send(LifecycleEvent { state, message });
    }

    fn progress(&self, state: LifecycleState, message: String) {
        let _ = self.events.send(LifecycleEvent { state, message });
    }

    fn begin_activation(&self) -> Result<ActivationGuard<'_>, VoiceError> {
        self.activating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ActivationGuard(&self.activating))
            .map_err(|_| {
                log::warn!("Rejected activation: another activation is in flight");
                VoiceError::Busy
            })
    }

    /// Check storage and activate the most recently saved voice, if any.
    /// Returns `Ok(None)` when the user has to upload a package first.
    pub async fn startup(&self) -> Result<Option<ActivationReport>, VoiceError> {
        let _guard = self.begin_activation()?;
        let started = Instant::now();
        self.transition(LifecycleState::CheckingStorage, "Checking for saved voices");

        let found = match &self.store {
            Some(store) => match store.latest() {
                Ok(Some(name)) => match store.load(&name) {
                    Ok(Some(bytes)) => Some((name, bytes)),
                    Ok(None) => None,
                    Err(e) => {
                        log::warn!("Could not read saved voice '{}': {}", name, e);
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    log::warn!("Voice storage unavailable, continuing without it: {}", e);
                    None
                }
            },
            None => None,
        };

        match found {
            Some((name, bytes)) => {
                self.transition(
                    LifecycleState::FoundPackage,
                    format!("Found saved voice '{}'", name),
                );
                let timings = StageTimings {
                    storage: started.elapsed(),
                    ..Default::default()
                };
                self.activate(name, bytes, true, timings).await.map(Some)
            }
            None => {
                self.transition(LifecycleState::NoPackage, "No saved voice found");
                self.transition(LifecycleState::AwaitingUpload, "Please upload a voice package");
                Ok(None)
            }
        }
    }

    /// Run one activation. A second call while one is in flight fails with
    /// [`VoiceError::Busy`] and leaves the running one untouched.
    pub async fn load_voice(&self, source: PackageSource) -> Result<ActivationReport, VoiceError> {
        let _guard = self.begin_activation()?;
        let started = Instant::now();

        let (name, bytes, persisted) = match source {
            PackageSource::Upload { name, bytes } => {
                self.transition(
                    LifecycleState::Persisting,
                    format!("Saving voice '{}' ({} bytes)", name, bytes.len()),
                );
                let persisted = match &self.store {
                    Some(store) => match store.save(&name, &bytes) {
                        Ok(()) => true,
                        Err(e) => {
                            log::warn!(
                                "Could not save voice '{}', continuing for this session: {}",
                                name,
                                e
                            );
                            false
                        }
                    },
                    None => {
                        log::warn!("No voice storage, '{}' will not be kept", name);
                        false
                    }
                };
                (name, bytes, persisted)
            }
            PackageSource::Stored { name } => {
                self.transition(
                    LifecycleState::CheckingStorage,
                    format!("Loading saved voice '{}'", name),
                );
                let loaded = match &self.store {
                    Some(store) => store.load(&name).map_err(VoiceError::from),
                    None => Err(VoiceError::StorageUnavailable("no voice storage".to_string())),
                };
                match loaded {
                    Ok(Some(bytes)) => {
                        self.transition(
                            LifecycleState::FoundPackage,
                            format!("Found saved voice '{}'", name),
                        );
                        (name, bytes, true)
                    }
                    Ok(None) => return Err(self.fail(VoiceError::NoPackage(name))),
                    Err(e) => return Err(self.fail(e)),
                }
            }
        };

        let timings = StageTimings {
            storage: started.elapsed(),
            ..Default::default()
        };
        self.activate(name, bytes, persisted, timings).await
    }

    async fn activate(
        &self,
        name: String,
        bytes: Vec<u8>,
        persisted: bool,
        mut timings: StageTimings,
    ) -> Result<ActivationReport, VoiceError> {
        // Unpacking
        self.transition(LifecycleState::Unpacking, format!("Unpacking voice '{}'", name));
        let stage = Instant::now();
        let events = self.events.clone();
        let unpacked = tokio::task::spawn_blocking(move || {
            unpack::unpack_with_progress(&bytes, |percent| {
                let _ = events.send(LifecycleEvent {
                    state: LifecycleState::Unpacking,
                    message: format!("Unpacking {}%", percent),
                });
            })
        })
        .await
        .unwrap_or_else(|e| Err(UnpackError::CorruptArchive(format!("unpack task failed: {e}"))));
        let bundle = match unpacked {
            Ok(bundle) => bundle,
            Err(e) => return Err(self.fail(e.into())),
        };
        timings.unpack = stage.elapsed();
        log::debug!("Package contents: {:?}", bundle.names().collect::<Vec<_>>());
        self.progress(
            LifecycleState::Unpacking,
            format!("Unpacked {} assets", bundle.len()),
        );

        // Delivering
        self.transition(LifecycleState::Delivering, "Preparing engine assets");
        let stage = Instant::now();
        let resolved = self.router.resolve(&bundle, &name).await;
        let mode = resolved.mode();
        if mode == DeliveryMode::Cached && !self.options.settle_delay.is_zero() {
            tokio::time::sleep(self.options.settle_delay).await;
        }
        timings.delivery = stage.elapsed();

        // EngineLoading
        self.transition(LifecycleState::EngineLoading, "Starting voice engine");
        let stage = Instant::now();
        let load = self.loader.load(&name, bundle.scripts(), resolved);
        let loaded = match self.options.engine_load_timeout {
            Some(limit) => match tokio::time::timeout(limit, load).await {
                Ok(result) => result,
                Err(_) => Err(crate::error::EngineError::Timeout),
            },
            None => load.await,
        };
        let session = match loaded {
            Ok(session) => session,
            Err(e) => return Err(self.fail(e.into())),
        };
        timings.engine = stage.elapsed();

        if let Ok(mut current) = self.session.write() {
            *current = Some(Arc::new(session));
        }
        self.transition(
            LifecycleState::Ready,
            format!(
                "Voice '{}' ready in {:.2?} (unpack {:.2?}, delivery {:.2?}, engine {:.2?})",
                name,
                timings.total(),
                timings.unpack,
                timings.delivery,
                timings.engine
            ),
        );

        Ok(ActivationReport {
            voice: name,
            mode,
            assets: bundle.len(),
            persisted,
            timings,
        })
    }

    /// Report a failed activation and fall back to a known-good state.
    fn fail(&self, error: VoiceError) -> VoiceError {
        log::error!("Voice activation failed: {}", error);
        self.transition(LifecycleState::Failed, error.to_string());
        match self.current_voice() {
            Some(voice) => self.transition(
                LifecycleState::Ready,
                format!("Keeping previous voice '{}'", voice),
            ),
            None => self.transition(
                LifecycleState::AwaitingUpload,
                "Please upload a voice package",
            ),
        }
        error
    }

    /// Synthesize `text`, play it, and record it in the history.
    pub async fn speak(&self, text: &str) -> Result<GeneratedAudio, VoiceError> {
        let session = self.session().ok_or(VoiceError::NoVoice)?;

        let started = Instant::now();
        let audio = session.generate(text).await.map_err(|e| {
            let err = VoiceError::from(e);
            if err != VoiceError::Busy {
                log::error!("Synthesis of {:?} failed: {}", text, err);
            }
            err
        })?;
        log::info!(
            "Generated {:.2}s of audio in {:.2?}",
            audio.duration_secs(),
            started.elapsed()
        );

        self.playback.play(&audio);
        self.remember(text);
        Ok(audio)
    }

    pub fn stop_playback(&self) -> bool {
        self.playback.stop()
    }

    fn remember(&self, text: &str) {
        let entries = match self.history.lock() {
            Ok(mut history) => {
                history.record(text);
                history.entries()
            }
            Err(_) => return,
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.save_history(&entries) {
                log::warn!("Could not save phrase history: {}", e);
            }
        }
    }

    pub fn saved_voices(&self) -> Result<Vec<String>, VoiceError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| VoiceError::StorageUnavailable("no voice storage".to_string()))?;
        let mut names = store.list_names()?;
        names.sort();
        Ok(names)
    }

    /// Remove a saved package and anything the delivery cache holds for it.
    /// The running engine, if it uses this voice, keeps working.
    pub async fn delete_voice(&self, name: &str) -> Result<(), VoiceError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| VoiceError::StorageUnavailable("no voice storage".to_string()))?;
        store.delete(name)?;
        if let Some(cache) = self.router.cache() {
            match cache.evict_voice(name).await {
                Ok(n) if n > 0 => log::info!("Evicted {} cached assets for '{}'", n, name),
                Ok(_) => {}
                Err(e) => log::debug!("Delivery cache not evicted for '{}': {}", name, e),
            }
        }
        Ok(())
    }
}
