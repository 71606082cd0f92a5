//! Engine runtime backed by an external synthesis process.
//!
//! Scripts and binary assets are staged into a per-session directory; each
//! `generate` call runs the engine binary against that directory with the
//! text on stdin and reads a WAV stream back from stdout. A session
//! directory lives as long as the synthesizer built from it. Directories
//! of failed or abandoned loads are removed as soon as the next load starts.

use async_trait::async_trait;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wait_timeout::ChildExt;

use crate::error::EngineError;
use crate::loader::{
    EngineContext, EngineRuntime, GeneratedAudio, ScriptAsset, ScriptRole, Synthesizer,
};
use crate::unpack::{ENGINE_API_SCRIPT, ENGINE_BOOTSTRAP_SCRIPT, ENGINE_DATA, ENGINE_MODULE};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn remove_session_dir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => log::debug!("Removed engine session {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not remove engine session {}: {}", dir.display(), e),
    }
}

/// A staged session directory, removed when the last owner drops it.
struct SessionDir(PathBuf);

impl SessionDir {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for SessionDir {
    fn drop(&mut self) {
        remove_session_dir(&self.0);
    }
}

pub struct ProcessRuntime {
    binary: String,
    work_dir: PathBuf,
    synthesis_timeout: Duration,
    /// Directory of the load in progress, until a synthesizer claims it.
    staging: Mutex<Option<PathBuf>>,
}

impl ProcessRuntime {
    pub fn new(
        binary: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        synthesis_timeout: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            work_dir: work_dir.into(),
            synthesis_timeout,
            staging: Mutex::new(None),
        }
    }

    /// Build from the global settings.
    pub fn from_settings() -> Self {
        let (binary, work_dir, timeout) = crate::config_loader::SETTINGS
            .read()
            .map(|s| {
                (
                    s.engine_binary.clone(),
                    s.data_path().join("engine"),
                    s.synthesis_timeout(),
                )
            })
            .unwrap_or_else(|_| {
                (
                    "voice-engine".to_string(),
                    std::env::temp_dir().join("voicebox-engine"),
                    Duration::from_secs(30),
                )
            });
        Self::new(binary, work_dir, timeout)
    }

    fn next_session_dir(&self, voice: &str) -> PathBuf {
        let safe: String = voice
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.work_dir.join(format!(
            "{}-{}-{}",
            safe,
            std::process::id(),
            SESSION_COUNTER.fetch_add(1, Ordering::SeqCst) + 1
        ))
    }

    /// Start a new staging directory, dropping one left by an unfinished load.
    fn begin_staging(&self, voice: &str) -> Result<PathBuf, EngineError> {
        let dir = self.next_session_dir(voice);
        let abandoned = self
            .staging
            .lock()
            .map_err(|_| EngineError::InitFailed("staging state poisoned".to_string()))?
            .replace(dir.clone());
        if let Some(abandoned) = abandoned {
            remove_session_dir(&abandoned);
        }
        Ok(dir)
    }

    fn staged_dir(&self) -> Result<PathBuf, EngineError> {
        self.staging
            .lock()
            .ok()
            .and_then(|staging| staging.clone())
            .ok_or_else(|| EngineError::InitFailed("no engine session is being staged".to_string()))
    }

    fn claim_staged_dir(&self) -> Result<SessionDir, EngineError> {
        self.staging
            .lock()
            .ok()
            .and_then(|mut staging| staging.take())
            .map(SessionDir)
            .ok_or_else(|| EngineError::InitFailed("no engine session is being staged".to_string()))
    }
}

impl Drop for ProcessRuntime {
    fn drop(&mut self) {
        if let Some(dir) = self.staging.get_mut().ok().and_then(|staging| staging.take()) {
            remove_session_dir(&dir);
        }
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::InitFailed(format!("{}: {}", parent.display(), e)))?;
    }
    std::fs::write(path, bytes)
        .map_err(|e| EngineError::InitFailed(format!("{}: {}", path.display(), e)))
}

/// Pull the binary assets through the locator, then write them next to the
/// scripts and check that the engine binary runs, off the async threads.
async fn stage_binaries(ctx: &EngineContext, dir: PathBuf, binary: String) -> Result<(), String> {
    let mut assets = Vec::with_capacity(2);
    for name in [ENGINE_MODULE, ENGINE_DATA] {
        let handle = ctx
            .locator()
            .locate(name)
            .ok_or_else(|| format!("{} was not delivered", name))?;
        log::debug!(
            "Fetching {} ({})",
            name,
            if handle.is_cached() { "cached URL" } else { "ephemeral handle" }
        );
        let bytes = ctx.locator().fetch(name).await.map_err(|e| e.to_string())?;
        assets.push((name, bytes));
    }

    tokio::task::spawn_blocking(move || {
        for (name, bytes) in &assets {
            write_file(&dir.join(name), bytes).map_err(|e| e.to_string())?;
        }
        let status = Command::new(&binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| format!("engine binary '{}' could not be started: {}", binary, e))?;
        if !status.success() {
            return Err(format!("engine binary '{}' failed its check: {}", binary, status));
        }
        Ok(())
    })
    .await
    .map_err(|e| format!("staging task failed: {}", e))?
}

#[async_trait]
impl EngineRuntime for ProcessRuntime {
    async fn inject_script(
        &self,
        ctx: &EngineContext,
        script: ScriptAsset,
    ) -> Result<(), EngineError> {
        let dir = match script.role {
            ScriptRole::Api => self.begin_staging(ctx.voice())?,
            ScriptRole::Bootstrap => self.staged_dir()?,
        };
        write_file(&dir.join(&script.name), script.source.as_bytes())?;
        log::debug!(
            "Staged {} ({} bytes) in {}",
            script.name,
            script.source.len(),
            dir.display()
        );

        if script.role == ScriptRole::Bootstrap {
            let ctx = ctx.clone();
            let binary = self.binary.clone();
            tokio::spawn(async move {
                let outcome = stage_binaries(&ctx, dir.clone(), binary).await;
                if let Err(e) = &outcome {
                    log::error!("Engine initialization failed: {}", e);
                    remove_session_dir(&dir);
                }
                ctx.ready().signal(outcome);
            });
        }
        Ok(())
    }

    async fn create_synthesizer(
        &self,
        _ctx: &EngineContext,
    ) -> Result<Box<dyn Synthesizer>, EngineError> {
        let dir = self.claim_staged_dir()?;
        for name in [ENGINE_API_SCRIPT, ENGINE_BOOTSTRAP_SCRIPT, ENGINE_MODULE, ENGINE_DATA] {
            if !dir.path().join(name).exists() {
                return Err(EngineError::InitFailed(format!("{} was not staged", name)));
            }
        }
        Ok(Box::new(ProcessSynthesizer {
            binary: self.binary.clone(),
            dir: Arc::new(dir),
            timeout: self.synthesis_timeout,
        }))
    }
}

pub struct ProcessSynthesizer {
    binary: String,
    dir: Arc<SessionDir>,
    timeout: Duration,
}

impl ProcessSynthesizer {
    fn run(
        binary: &str,
        dir: &Path,
        text: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, EngineError> {
        let mut child = Command::new(binary)
            .arg("--api")
            .arg(dir.join(ENGINE_API_SCRIPT))
            .arg("--bootstrap")
            .arg(dir.join(ENGINE_BOOTSTRAP_SCRIPT))
            .arg("--module")
            .arg(dir.join(ENGINE_MODULE))
            .arg("--data")
            .arg(dir.join(ENGINE_DATA))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError::SynthesisFailed(format!("failed to start {}: {}", binary, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .and_then(|_| stdin.write_all(b"\n"))
                .map_err(|e| EngineError::SynthesisFailed(e.to_string()))?;
        }

        // Drain stdout while waiting so a large WAV cannot fill the pipe.
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::SynthesisFailed("no stdout".to_string()))?;
        let reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).map(|_| buf)
        });

        let status = child
            .wait_timeout(timeout)
            .map_err(|e| EngineError::SynthesisFailed(e.to_string()))?;
        match status {
            Some(status) if status.success() => reader
                .join()
                .map_err(|_| EngineError::SynthesisFailed("stdout reader panicked".to_string()))?
                .map_err(|e| EngineError::SynthesisFailed(e.to_string())),
            Some(_) => {
                let mut err = String::new();
                if let Some(mut stderr) = child.stderr.take() {
                    let _ = stderr.read_to_string(&mut err);
                }
                Err(EngineError::SynthesisFailed(format!("engine error: {}", err.trim())))
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(EngineError::Timeout)
            }
        }
    }
}

/// Decode a WAV stream into mono f32 samples. Multi-channel audio keeps
/// only the first channel.
pub fn decode_wav(bytes: &[u8]) -> Result<GeneratedAudio, EngineError> {
    let invalid =
        |e: hound::Error| EngineError::SynthesisFailed(format!("invalid WAV output: {}", e));
    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(invalid)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Result<Vec<f32>, hound::Error> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().step_by(channels).collect(),
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .step_by(channels)
                .map(|s| s.map(|v| v as f32 / scale))
                .collect()
        }
    };

    Ok(GeneratedAudio {
        samples: samples.map_err(invalid)?,
        sample_rate: spec.sample_rate,
    })
}

#[async_trait]
impl Synthesizer for ProcessSynthesizer {
    async fn generate(&mut self, text: &str) -> Result<GeneratedAudio, EngineError> {
        let binary = self.binary.clone();
        let dir = self.dir.clone();
        let text = text.to_string();
        let timeout = self.timeout;

        let wav = tokio::task::spawn_blocking(move || {
            Self::run(&binary, dir.path(), &text, timeout)
        })
        .await
        .map_err(|e| EngineError::SynthesisFailed(format!("synthesis task failed: {}", e)))??;
        decode_wav(&wav)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{EngineLoader, EngineSession};
    use crate::router::DeliveryRouter;
    use crate::unpack::{test_support::*, unpack};
    use serial_test::serial;

    type TestWriter<'a> = hound::WavWriter<Cursor<&'a mut Vec<u8>>>;

    fn wav_bytes(spec: hound::WavSpec, write: impl FnOnce(&mut TestWriter<'_>)) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut buf), spec).unwrap();
            write(&mut writer);
            writer.finalize().unwrap();
        }
        buf
    }

    fn session_dirs(work_dir: &Path) -> Vec<String> {
        match std::fs::read_dir(work_dir) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn load(loader: &EngineLoader) -> Result<EngineSession, EngineError> {
        let bundle = unpack(&build_archive(&complete_entries())).unwrap();
        let resolved = DeliveryRouter::new(None).resolve(&bundle, "Emma").await;
        loader.load("Emma", bundle.scripts(), resolved).await
    }

    #[test]
    fn test_decode_int16_wav() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = wav_bytes(spec, |w| {
            for s in [0i16, 16384, -16384, i16::MAX] {
                w.write_sample(s).unwrap();
            }
        });

        let audio = decode_wav(&bytes).unwrap();
        assert_eq!(audio.sample_rate, 22050);
        assert_eq!(audio.samples.len(), 4);
        assert!((audio.samples[1] - 0.5).abs() < 1e-4);
        assert!((audio.samples[2] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stereo_keeps_first_channel() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let bytes = wav_bytes(spec, |w| {
            for s in [0.25f32, -1.0, 0.5, -1.0] {
                w.write_sample(s).unwrap();
            }
        });

        let audio = decode_wav(&bytes).unwrap();
        assert_eq!(audio.samples, vec![0.25, 0.5]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_wav(b"definitely not audio"),
            Err(EngineError::SynthesisFailed(_))
        ));
    }

    #[test]
    fn test_missing_binary_fails_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessSynthesizer::run(
            "voicebox-no-such-engine",
            dir.path(),
            "Hello",
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::SynthesisFailed(_)));
    }

    #[test]
    fn test_session_dir_sanitizes_voice_name() {
        let runtime =
            ProcessRuntime::new("voice-engine", "/tmp/voicebox-test", Duration::from_secs(1));
        let dir = runtime.next_session_dir("../Emma Voice");
        let leaf = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(leaf.starts_with("___Emma_Voice-"));
        assert_eq!(dir.parent().unwrap(), Path::new("/tmp/voicebox-test"));
        assert_ne!(runtime.next_session_dir("Emma"), runtime.next_session_dir("Emma"));
    }

    #[tokio::test]
    #[serial]
    async fn test_reactivation_keeps_one_session_dir() {
        let work = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ProcessRuntime::new("true", work.path(), Duration::from_secs(1)));
        let loader = EngineLoader::new(runtime, None);

        let mut session = None;
        for _ in 0..3 {
            // Replacing the session drops the previous synthesizer.
            session = Some(load(&loader).await.unwrap());
            assert_eq!(session_dirs(work.path()).len(), 1);
        }

        drop(session);
        assert!(session_dirs(work.path()).is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_failed_load_leaves_no_session_dir() {
        let work = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ProcessRuntime::new(
            "voicebox-no-such-engine",
            work.path(),
            Duration::from_secs(1),
        ));
        let loader = EngineLoader::new(runtime, None);

        assert!(matches!(load(&loader).await, Err(EngineError::InitFailed(_))));
        assert!(session_dirs(work.path()).is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_failing_engine_check_is_init_failed() {
        let work = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ProcessRuntime::new("false", work.path(), Duration::from_secs(1)));
        let loader = EngineLoader::new(runtime, None);

        assert!(matches!(load(&loader).await, Err(EngineError::InitFailed(_))));
        assert!(session_dirs(work.path()).is_empty());
    }
}
