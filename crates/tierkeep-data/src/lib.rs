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
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! Entities and transactional repositories for the tierkeep engine.
//!
//! Layout: `model.rs` (entities and enums), `store.rs` (repository traits),
//! `memory.rs` (in-process store), `postgres.rs` (`sqlx` store), `error.rs`.

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;

pub use error::{DataError, DataResult};
pub use memory::MemoryStore;
pub use model::{
    ColdStorageLocation, Criterion, CriterionOperator, CriterionType, FileInventoryEntry,
    FileRecord, FileStatus, InventoryFilter, MonitoredPath, OperationFailure, OperationMode,
    PinnedFile, ScanOutcome, StorageTier,
};
pub use postgres::PgStore;
pub use store::{Store, StoreTx};
