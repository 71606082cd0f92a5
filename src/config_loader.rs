use config::{Config, File};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub data_dir: String,
    // Delivery cache
    pub origin: String,
    pub enable_delivery_cache: bool,
    pub cache_listen: String,
    pub allowed_script_host: String,
    pub delivery_settle_ms: u64,
    // Engine
    pub engine_binary: String,
    pub engine_load_timeout_secs: u64, // 0 = wait as long as the engine needs
    pub synthesis_timeout_secs: u64,
    // Session
    pub history_limit: usize,
    pub enable_audio: bool,
    pub playback_volume: f32,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("voicebox")
        .to_string_lossy()
        .into_owned()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            origin: "http://127.0.0.1:7878".to_string(),
            enable_delivery_cache: true,
            cache_listen: "127.0.0.1:7878".to_string(),
            allowed_script_host: "cdnjs.cloudflare.com".to_string(),
            delivery_settle_ms: 50,
            engine_binary: "voice-engine".to_string(),
            engine_load_timeout_secs: 0,
            synthesis_timeout_secs: 30,
            history_limit: 20,
            enable_audio: true,
            playback_volume: 1.0,
        }
    }
}

lazy_static! {
    pub static ref SETTINGS: RwLock<Settings> =
        RwLock::new(Settings::new().expect("Failed to load settings"));
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let defaults = Settings::default();
        let builder = Config::builder()
            .set_default("data_dir", defaults.data_dir)?
            // Delivery cache defaults
            .set_default("origin", defaults.origin)?
            .set_default("enable_delivery_cache", defaults.enable_delivery_cache)?
            .set_default("cache_listen", defaults.cache_listen)?
            .set_default("allowed_script_host", defaults.allowed_script_host)?
            .set_default("delivery_settle_ms", defaults.delivery_settle_ms)?
            // Engine defaults
            .set_default("engine_binary", defaults.engine_binary)?
            .set_default("engine_load_timeout_secs", defaults.engine_load_timeout_secs)?
            .set_default("synthesis_timeout_secs", defaults.synthesis_timeout_secs)?
            // Session defaults
            .set_default("history_limit", defaults.history_limit as u64)?
            .set_default("enable_audio", defaults.enable_audio)?
            .set_default("playback_volume", defaults.playback_volume as f64)?
            // Merge with local config file (if exists)
            .add_source(File::with_name("Voicebox").required(false))
            .add_source(
                File::with_name(&format!(
                    "{}/.config/voicebox/Voicebox",
                    std::env::var("HOME").unwrap_or_default()
                ))
                .required(false),
            )
            // Merge with environment variables (e.g. VOICEBOX_ENGINE_BINARY)
            .add_source(config::Environment::with_prefix("VOICEBOX"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.playback_volume < 0.0 || self.playback_volume > 1.0 {
            return Err(config::ConfigError::Message(format!(
                "Invalid playback_volume: {}. Must be between 0.0 and 1.0",
                self.playback_volume
            )));
        }
        if self.history_limit == 0 {
            return Err(config::ConfigError::Message(
                "history_limit must be greater than 0".to_string(),
            ));
        }
        match reqwest::Url::parse(&self.origin) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
            _ => {
                return Err(config::ConfigError::Message(format!(
                    "Invalid origin: {}. Must be an absolute http(s) URL",
                    self.origin
                )))
            }
        }
        Ok(())
    }

    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.delivery_settle_ms)
    }

    pub fn engine_load_timeout(&self) -> Option<Duration> {
        match self.engine_load_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }
}
