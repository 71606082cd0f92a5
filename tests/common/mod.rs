#![allow(dead_code)]

use async_trait::async_trait;
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use zip::write::SimpleFileOptions;

use voicebox::error::EngineError;
use voicebox::lifecycle::{LifecycleOptions, VoiceLifecycle};
use voicebox::loader::{
    EngineContext, EngineLoader, EngineRuntime, GeneratedAudio, ScriptAsset, ScriptRole,
    Synthesizer,
};
use voicebox::playback::SilentOutput;
use voicebox::router::DeliveryRouter;
use voicebox::cache::DeliveryCache;
use voicebox::store::LocalStore;
use voicebox::unpack::{ENGINE_API_SCRIPT, ENGINE_BOOTSTRAP_SCRIPT, ENGINE_DATA, ENGINE_MODULE};

pub fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (path, contents) in entries {
        writer.start_file(*path, options).unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A complete voice package whose data segment is `data`.
pub fn voice_package(data: &[u8]) -> Vec<u8> {
    archive(&[
        (ENGINE_API_SCRIPT, b"var TtsApi = {};".as_slice()),
        (ENGINE_BOOTSTRAP_SCRIPT, b"Module.onRuntimeInitialized();".as_slice()),
        (ENGINE_MODULE, b"\0asm\x01\0\0\0".as_slice()),
        (ENGINE_DATA, data),
    ])
}

pub struct ToneSynth;

#[async_trait]
impl Synthesizer for ToneSynth {
    async fn generate(&mut self, text: &str) -> Result<GeneratedAudio, EngineError> {
        Ok(GeneratedAudio {
            samples: vec![0.1; 160 * text.len().max(1)],
            sample_rate: 16000,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Ok,
    /// Readiness reports a failure.
    FailInit,
}

/// Scripted engine: records script order and the data segment it was given,
/// and signals readiness once both binary assets were fetched. With a gate
/// installed, readiness waits until the gate is opened.
pub struct ScriptedRuntime {
    behaviour: Behaviour,
    gate: Option<Arc<Notify>>,
    pub injected: Mutex<Vec<ScriptRole>>,
    pub loaded_data: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ScriptedRuntime {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            gate: None,
            injected: Mutex::new(Vec::new()),
            loaded_data: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(Behaviour::Ok)
        }
    }
}

#[async_trait]
impl EngineRuntime for ScriptedRuntime {
    async fn inject_script(
        &self,
        ctx: &EngineContext,
        script: ScriptAsset,
    ) -> Result<(), EngineError> {
        self.injected.lock().unwrap().push(script.role);
        if script.role != ScriptRole::Bootstrap {
            return Ok(());
        }

        let ctx = ctx.clone();
        let gate = self.gate.clone();
        let behaviour = self.behaviour;
        let loaded = self.loaded_data.clone();
        tokio::spawn(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let outcome = match (
                ctx.locator().fetch(ENGINE_MODULE).await,
                ctx.locator().fetch(ENGINE_DATA).await,
            ) {
                _ if behaviour == Behaviour::FailInit => Err("model failed to load".to_string()),
                (Ok(_), Ok(data)) => {
                    loaded.lock().unwrap().push(data.to_vec());
                    Ok(())
                }
                (Err(e), _) | (_, Err(e)) => Err(e.to_string()),
            };
            ctx.ready().signal(outcome);
        });
        Ok(())
    }

    async fn create_synthesizer(
        &self,
        _ctx: &EngineContext,
    ) -> Result<Box<dyn Synthesizer>, EngineError> {
        Ok(Box::new(ToneSynth))
    }
}

pub fn lifecycle(
    store: Option<Arc<dyn LocalStore>>,
    cache: Option<DeliveryCache>,
    runtime: Arc<ScriptedRuntime>,
) -> VoiceLifecycle {
    lifecycle_with_options(store, cache, runtime, LifecycleOptions::default())
}

pub fn lifecycle_with_options(
    store: Option<Arc<dyn LocalStore>>,
    cache: Option<DeliveryCache>,
    runtime: Arc<ScriptedRuntime>,
    options: LifecycleOptions,
) -> VoiceLifecycle {
    VoiceLifecycle::new(
        store,
        DeliveryRouter::new(cache.clone()),
        EngineLoader::new(runtime, cache),
        Arc::new(SilentOutput),
        options,
    )
}
