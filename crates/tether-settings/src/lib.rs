//! # tether-settings
//!
//! Configuration for the tether server and its connection engine.
//!
//! Three layers, later ones winning:
//! 1. compiled defaults ([`TetherSettings::default()`])
//! 2. a JSON file, `$TETHER_SETTINGS` or `~/.tether/settings.json`, merged key by key
//! 3. `TETHER_*` environment variables
//!
//! The result is validated before it is handed out.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, merge_layers, settings_path};
pub use types::*;
