#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Typed configuration for the tierkeep engine.
//!
//! Layout: `model.rs` (config sections), `defaults.rs` (default values),
//! `loader.rs` (file + environment loading), `validate.rs` (validation rules).

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use model::{
    EncryptionSettings, EngineConfig, LogFormatSetting, LoggingSettings, ProgressSettings,
    RelocationSettings, RoutingSettings, ScanSettings, SchedulerSettings,
};
