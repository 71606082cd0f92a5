use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};
use std::sync::mpsc::{channel, Sender};
use std::thread;

use crate::loader::GeneratedAudio;

/// Where generated speech goes. Starting a new playback stops the previous
/// one; nothing is queued.
pub trait PlaybackOutput: Send + Sync {
    fn play(&self, audio: &GeneratedAudio);

    /// Stop the current playback. Returns false if nothing was playing.
    fn stop(&self) -> bool;
}

enum PlayerCommand {
    Play(GeneratedAudio),
    Stop(Sender<bool>),
}

#[derive(Clone)]
pub struct AudioPlayer {
    tx: Sender<PlayerCommand>,
}

impl AudioPlayer {
    pub fn new(volume: f32) -> Self {
        let (tx, rx) = channel::<PlayerCommand>();

        thread::spawn(move || {
            // Audio stream must live on this thread
            let (_stream, stream_handle) = match OutputStream::try_default() {
                Ok(output) => output,
                Err(e) => {
                    log::error!("No audio output device found: {}", e);
                    // Keep answering stop requests so callers never hang.
                    while let Ok(cmd) = rx.recv() {
                        if let PlayerCommand::Stop(reply) = cmd {
                            let _ = reply.send(false);
                        }
                    }
                    return;
                }
            };

            let mut current: Option<Sink> = None;
            while let Ok(cmd) = rx.recv() {
                match cmd {
                    PlayerCommand::Play(audio) => {
                        if let Some(previous) = current.take() {
                            previous.stop();
                        }
                        match Sink::try_new(&stream_handle) {
                            Ok(sink) => {
                                sink.set_volume(volume);
                                let source =
                                    SamplesBuffer::new(1, audio.sample_rate, audio.samples);
                                sink.append(source);
                                current = Some(sink);
                            }
                            Err(e) => log::error!("Failed to create sink: {}", e),
                        }
                    }
                    PlayerCommand::Stop(reply) => {
                        let was_playing = current.as_ref().map_or(false, |s| !s.empty());
                        if let Some(sink) = current.take() {
                            sink.stop();
                        }
                        let _ = reply.send(was_playing);
                    }
                }
            }
        });

        Self { tx }
    }
}

impl PlaybackOutput for AudioPlayer {
    fn play(&self, audio: &GeneratedAudio) {
        let _ = self.tx.send(PlayerCommand::Play(audio.clone()));
    }

    fn stop(&self) -> bool {
        let (reply, rx) = channel();
        if self.tx.send(PlayerCommand::Stop(reply)).is_err() {
            return false;
        }
        rx.recv().unwrap_or(false)
    }
}

/// Used when audio output is disabled.
pub struct SilentOutput;

impl PlaybackOutput for SilentOutput {
    fn play(&self, audio: &GeneratedAudio) {
        log::debug!("Audio disabled, dropping {:.2}s of speech", audio.duration_secs());
    }

    fn stop(&self) -> bool {
        false
    }
}
