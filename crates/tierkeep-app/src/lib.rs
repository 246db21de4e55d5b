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

//! tierkeep application wiring.
//!
//! Layout: `bootstrap.rs` (service construction and lifecycle), `scheduler.rs`
//! (periodic scan trigger), `error.rs`.

/// Service construction and the boot sequence.
pub mod bootstrap;
/// Application error type.
pub mod error;
/// Periodic scan trigger.
pub mod scheduler;

pub use bootstrap::{Services, build_services, run_app, start_background};
pub use error::{AppError, AppResult};
pub use scheduler::Scheduler;
