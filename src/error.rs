//! Error taxonomy shared by the voice pipeline.
//!
//! Each layer has its own error type; [`VoiceError`] is what the lifecycle
//! controller reports to the user.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("Stored record is corrupt: {0}")]
    Corrupt(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        match e {
            sled::Error::Corruption { .. } => StoreError::Corrupt(e.to_string()),
            other => StoreError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnpackError {
    #[error("Not a valid voice package archive: {0}")]
    CorruptArchive(String),
    #[error("Voice package is incomplete, missing: {}", missing.join(", "))]
    IncompletePackage { missing: Vec<String> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Delivery cache is not active")]
    Unavailable,
    #[error("Delivery cache worker has shut down")]
    Closed,
    #[error("Delivery cache quota exceeded ({needed} bytes needed, {available} available)")]
    QuotaExceeded { needed: usize, available: usize },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Invalid cache URL: {0}")]
    InvalidUrl(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine initialization failed: {0}")]
    InitFailed(String),
    #[error("Synthesis failed: {0}")]
    SynthesisFailed(String),
    #[error("Engine asset unavailable: {0}")]
    AssetUnavailable(String),
    #[error("A synthesis request is already in flight")]
    Busy,
    #[error("Engine timed out")]
    Timeout,
}

/// User-facing errors reported by [`crate::lifecycle::VoiceLifecycle`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("The voice package could not be read: {0}")]
    CorruptArchive(String),
    #[error("The voice package is missing required files: {}", missing.join(", "))]
    IncompletePackage { missing: Vec<String> },
    #[error("The voice engine failed to start: {0}")]
    EngineInitFailed(String),
    #[error("Speech synthesis failed: {0}")]
    SynthesisFailed(String),
    #[error("Busy: another request is still in progress")]
    Busy,
    #[error("No voice is loaded")]
    NoVoice,
    #[error("No stored voice package named '{0}'")]
    NoPackage(String),
}

impl From<UnpackError> for VoiceError {
    fn from(e: UnpackError) -> Self {
        match e {
            UnpackError::CorruptArchive(msg) => VoiceError::CorruptArchive(msg),
            UnpackError::IncompletePackage { missing } => VoiceError::IncompletePackage { missing },
        }
    }
}

impl From<StoreError> for VoiceError {
    fn from(e: StoreError) -> Self {
        VoiceError::StorageUnavailable(e.to_string())
    }
}

impl From<EngineError> for VoiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Busy => VoiceError::Busy,
            EngineError::SynthesisFailed(msg) => VoiceError::SynthesisFailed(msg),
            other => VoiceError::EngineInitFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_package_lists_missing_assets() {
        let err = UnpackError::IncompletePackage {
            missing: vec!["a.wasm".into(), "a.data".into()],
        };
        assert_eq!(
            err.to_string(),
            "Voice package is incomplete, missing: a.wasm, a.data"
        );
        assert!(matches!(
            VoiceError::from(err),
            VoiceError::IncompletePackage { missing } if missing.len() == 2
        ));
    }

    #[test]
    fn test_engine_busy_maps_to_busy() {
        assert_eq!(VoiceError::from(EngineError::Busy), VoiceError::Busy);
        assert!(matches!(
            VoiceError::from(EngineError::Timeout),
            VoiceError::EngineInitFailed(_)
        ));
    }
}
