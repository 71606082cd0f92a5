//! voicebox - command-line front end for the offline voice pipeline.

use clap::{Parser, Subcommand};
use std::error::Error;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use voicebox::cache::{server, CacheConfig, DeliveryCache};
use voicebox::config_loader::{Settings, SETTINGS};
use voicebox::lifecycle::LifecycleOptions;
use voicebox::loader::EngineLoader;
use voicebox::phrases::{PhraseBook, PhraseEntry};
use voicebox::playback::{AudioPlayer, PlaybackOutput, SilentOutput};
use voicebox::router::DeliveryRouter;
use voicebox::runtime::ProcessRuntime;
use voicebox::store::{LocalStore, SledStore};
use voicebox::{PackageSource, VoiceLifecycle};

/// Offline voice packages for AAC speech
#[derive(Parser)]
#[command(name = "voicebox")]
#[command(author = "StarTuz")]
#[command(version)]
#[command(about = "Install, load and speak with offline voice packages", long_about = None)]
struct Cli {
    /// Show lifecycle progress
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save a voice package archive and activate it
    Load {
        /// Path to the .zip voice package
        path: PathBuf,
        /// Name to store the voice under (defaults to the file stem)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List saved voices
    Voices,

    /// Delete a saved voice
    Delete {
        /// Voice name
        name: String,
    },

    /// Activate the most recently saved voice and speak text
    Speak {
        /// Text to speak
        text: String,
        /// Use this saved voice instead of the most recent one
        #[arg(short, long)]
        voice: Option<String>,
        /// Also write the audio to a WAV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show recently spoken phrases
    History,

    /// Show a phrase definitions file
    Phrases {
        /// Path to the phrases JSON file
        path: PathBuf,
        /// Show one group instead of the root list
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Activate the most recent voice and speak each line read from stdin
    Serve,
}

struct App {
    lifecycle: Arc<VoiceLifecycle>,
    cache: Option<DeliveryCache>,
}

async fn start_delivery_cache(settings: &Settings) -> Option<DeliveryCache> {
    if !settings.enable_delivery_cache {
        log::info!("Delivery cache disabled, assets will be handed to the engine directly");
        return None;
    }

    let config = match CacheConfig::new(&settings.origin) {
        Ok(config) => config.with_allowed_script_host(settings.allowed_script_host.clone()),
        Err(e) => {
            log::warn!("Delivery cache unavailable: {}", e);
            return None;
        }
    };
    let listener = match TcpListener::bind(&settings.cache_listen).await {
        Ok(listener) => listener,
        Err(e) => {
            log::warn!(
                "Delivery cache unavailable, could not bind {}: {}",
                settings.cache_listen,
                e
            );
            return None;
        }
    };

    let cache = DeliveryCache::spawn(config);
    let served = cache.clone();
    tokio::spawn(async move {
        server::serve(listener, served).await;
    });
    log::info!("Delivery cache listening on {}", settings.cache_listen);
    Some(cache)
}

async fn build_app() -> Result<App, Box<dyn Error>> {
    let settings = SETTINGS
        .read()
        .map_err(|_| "settings lock poisoned")?
        .clone();
    settings.validate()?;

    let store_path = settings.data_path().join("voices.db");
    let store: Option<Arc<dyn LocalStore>> = match SledStore::open(&store_path) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            log::warn!(
                "Voice storage at {} unavailable, voices will not be kept: {}",
                store_path.display(),
                e
            );
            None
        }
    };

    let cache = start_delivery_cache(&settings).await;
    let playback: Arc<dyn PlaybackOutput> = if settings.enable_audio {
        Arc::new(AudioPlayer::new(settings.playback_volume))
    } else {
        Arc::new(SilentOutput)
    };
    let runtime = Arc::new(ProcessRuntime::from_settings());

    let lifecycle = VoiceLifecycle::new(
        store,
        DeliveryRouter::new(cache.clone()),
        EngineLoader::new(runtime, cache.clone()),
        playback,
        LifecycleOptions {
            settle_delay: settings.settle_delay(),
            engine_load_timeout: settings.engine_load_timeout(),
            history_limit: settings.history_limit,
        },
    );

    Ok(App {
        lifecycle: Arc::new(lifecycle),
        cache,
    })
}

fn print_progress(lifecycle: &VoiceLifecycle) {
    let mut events = lifecycle.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            eprintln!("{}", event);
        }
    });
}

fn print_entries(entries: &[PhraseEntry]) {
    for entry in entries {
        match entry {
            PhraseEntry::Phrase { text } => println!("  {}", text),
            PhraseEntry::Group { name } => println!("  [{}]", name),
        }
    }
}

/// Activate `voice`, or the most recently saved voice.
async fn activate(lifecycle: &VoiceLifecycle, voice: Option<String>) -> Result<(), Box<dyn Error>> {
    match voice {
        Some(name) => {
            lifecycle.load_voice(PackageSource::Stored { name }).await?;
        }
        None => {
            if lifecycle.startup().await?.is_none() {
                return Err("No saved voice. Load one with `voicebox load <package.zip>`".into());
            }
        }
    }
    Ok(())
}

async fn speak_and_wait(
    lifecycle: &VoiceLifecycle,
    text: &str,
    output: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let audio = lifecycle.speak(text).await?;
    if let Some(path) = output {
        audio.write_wav(path)?;
        println!("Wrote {}", path.display());
    }
    // Playback runs on its own thread; keep the process alive until it ends.
    tokio::time::sleep(Duration::from_secs_f64(audio.duration_secs())).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Commands::Phrases { path, group } = &cli.command {
        let book = PhraseBook::from_path(path)?;
        for name in book.validate() {
            log::warn!("Phrase group '{}' is referenced but not defined", name);
        }
        match group {
            Some(name) => match book.group(name) {
                Some(entries) => print_entries(entries),
                None => return Err(format!("No phrase group named '{}'", name).into()),
            },
            None => print_entries(book.root()),
        }
        return Ok(());
    }

    let app = build_app().await?;
    let lifecycle = app.lifecycle.clone();
    if cli.verbose {
        print_progress(&lifecycle);
    }

    let result = match cli.command {
        Commands::Load { path, name } => {
            let bytes = std::fs::read(&path)?;
            let name = name
                .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
                .ok_or("Cannot derive a voice name from the path, pass --name")?;
            let report = lifecycle
                .load_voice(PackageSource::Upload { name, bytes })
                .await?;
            println!(
                "Voice '{}' ready ({:?} delivery, {} assets, {:.2?}){}",
                report.voice,
                report.mode,
                report.assets,
                report.timings.total(),
                if report.persisted { "" } else { " - not saved" }
            );
            Ok(())
        }
        Commands::Voices => {
            for name in lifecycle.saved_voices()? {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Delete { name } => {
            lifecycle.delete_voice(&name).await?;
            println!("Deleted '{}'", name);
            Ok(())
        }
        Commands::Speak { text, voice, output } => {
            activate(&lifecycle, voice).await?;
            speak_and_wait(&lifecycle, &text, output.as_deref()).await
        }
        Commands::History => {
            for (i, text) in lifecycle.history().iter().enumerate() {
                println!("{:2}. {}", i + 1, text);
            }
            Ok(())
        }
        Commands::Serve => {
            activate(&lifecycle, None).await?;
            println!("Ready. Type a phrase and press Enter (Ctrl-D to quit).");
            let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(16);
            std::thread::spawn(move || {
                for line in std::io::stdin().lock().lines().map_while(Result::ok) {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
            });
            while let Some(line) = rx.recv().await {
                match line.trim() {
                    "" => {}
                    "/stop" => {
                        lifecycle.stop_playback();
                    }
                    text => {
                        if let Err(e) = lifecycle.speak(text).await {
                            eprintln!("Error: {}", e);
                        }
                    }
                }
            }
            Ok(())
        }
        Commands::Phrases { .. } => Ok(()),
    };

    if let Some(cache) = app.cache {
        cache.shutdown().await;
    }
    result
}
