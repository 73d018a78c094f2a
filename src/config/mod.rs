//! Configuration for the live tutor.
//!
//! Provides `AppConfig` (top-level settings), one section per subsystem,
//! `AppPaths` for the platform config directory, and TOML persistence via
//! `AppConfig::load` / `AppConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{AppConfig, AudioConfig, RecoveryConfig, RemoteConfig, TutorConfig};
