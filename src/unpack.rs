//! Voice package unpacking.
//!
//! A voice package is a zip archive. Entries are keyed by their final path
//! segment; directories are skipped. Script entries are decoded as UTF-8
//! text, everything else is kept as raw bytes.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

use crate::error::UnpackError;

/// Engine API script, loaded first.
pub const ENGINE_API_SCRIPT: &str = "sherpa-onnx-tts.js";
/// Engine bootstrap script; evaluating it starts engine initialization.
pub const ENGINE_BOOTSTRAP_SCRIPT: &str = "sherpa-onnx-wasm-main-tts.js";
/// Compiled engine module.
pub const ENGINE_MODULE: &str = "sherpa-onnx-wasm-main-tts.wasm";
/// Packed model data segment.
pub const ENGINE_DATA: &str = "sherpa-onnx-wasm-main-tts.data";

pub const REQUIRED_ASSETS: [&str; 4] = [
    ENGINE_API_SCRIPT,
    ENGINE_BOOTSTRAP_SCRIPT,
    ENGINE_MODULE,
    ENGINE_DATA,
];

const SCRIPT_EXTENSIONS: &[&str] = &["js", "mjs"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Asset {
    Text(String),
    Binary(Arc<[u8]>),
}

impl Asset {
    pub fn len(&self) -> usize {
        match self {
            Asset::Text(s) => s.len(),
            Asset::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The two scripts the engine loader injects, in order.
#[derive(Debug, Clone)]
pub struct EngineScripts {
    pub api: String,
    pub bootstrap: String,
}

/// Unpacked contents of one voice package. Only constructed by [`unpack`],
/// so every bundle holds the four required assets.
#[derive(Debug, Clone)]
pub struct AssetBundle {
    assets: HashMap<String, Asset>,
}

impl AssetBundle {
    pub fn get(&self, name: &str) -> Option<&Asset> {
        self.assets.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.assets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn binary(&self, name: &str) -> Option<Arc<[u8]>> {
        match self.assets.get(name) {
            Some(Asset::Binary(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    fn text(&self, name: &str) -> Option<&str> {
        match self.assets.get(name) {
            Some(Asset::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn scripts(&self) -> EngineScripts {
        // Presence and kind of both scripts is checked in `unpack`.
        EngineScripts {
            api: self.text(ENGINE_API_SCRIPT).unwrap_or_default().to_string(),
            bootstrap: self
                .text(ENGINE_BOOTSTRAP_SCRIPT)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

fn is_script(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| SCRIPT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Unpack a voice package without progress reporting.
pub fn unpack(raw: &[u8]) -> Result<AssetBundle, UnpackError> {
    unpack_with_progress(raw, |_| {})
}

/// Unpack a voice package, calling `progress` with a 0–100 percentage after
/// each archive entry.
pub fn unpack_with_progress<F>(raw: &[u8], mut progress: F) -> Result<AssetBundle, UnpackError>
where
    F: FnMut(u8),
{
    let mut zip = zip::ZipArchive::new(Cursor::new(raw))
        .map_err(|e| UnpackError::CorruptArchive(format!("Failed to open zip archive: {e}")))?;

    let total = zip.len();
    let mut assets = HashMap::new();

    for i in 0..total {
        let mut entry = zip.by_index(i).map_err(|e| {
            UnpackError::CorruptArchive(format!("Failed to read zip entry {i}: {e}"))
        })?;

        let raw_name = entry.name().to_string();
        let key = raw_name
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        if !entry.is_dir() && !key.is_empty() {
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| {
                    UnpackError::CorruptArchive(format!("Failed to read {raw_name}: {e}"))
                })?;

            let asset = if is_script(&key) {
                let text = String::from_utf8(data).map_err(|_| {
                    UnpackError::CorruptArchive(format!("{raw_name}: script is not valid UTF-8"))
                })?;
                Asset::Text(text)
            } else {
                Asset::Binary(Arc::from(data))
            };

            if assets.insert(key.clone(), asset).is_some() {
                log::warn!("Duplicate asset name '{}' in package, keeping {}", key, raw_name);
            }
            log::debug!("Unpacked {} ({}/{})", raw_name, i + 1, total);
        }

        progress((((i + 1) * 100) / total) as u8);
    }

    let missing: Vec<String> = REQUIRED_ASSETS
        .iter()
        .filter(|name| !assets.contains_key(**name))
        .map(|name| name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(UnpackError::IncompletePackage { missing });
    }

    log::info!("Unpacked voice package with {} assets", assets.len());
    Ok(AssetBundle { assets })
}
