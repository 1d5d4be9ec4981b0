//! # lifeline-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`LifelineSettings::default()`]
//! 2. **User file**: `~/.lifeline/settings.json` or `--config` (deep-merged over defaults)
//! 3. **Environment variables**: `LIFELINE_*` overrides (highest priority)
//!
//! Settings are loaded once at startup and shared read-only behind an `Arc`.
//!
//! ```no_run
//! use lifeline_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("port: {}", settings.server.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path, validate};
pub use types::*;
