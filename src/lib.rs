//! Offline voice packages for an AAC speech application: store a packaged
//! voice locally, unpack it, deliver its assets to the synthesis engine and
//! keep one engine session ready for speaking.

pub mod cache;
pub mod config_loader;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod loader;
pub mod phrases;
pub mod playback;
pub mod router;
pub mod runtime;
pub mod store;
pub mod unpack;

pub use error::VoiceError;
pub use lifecycle::{LifecycleEvent, LifecycleState, PackageSource, VoiceLifecycle};
