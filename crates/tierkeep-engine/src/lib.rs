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

//! Tiering engine: decides which files belong in cold storage and moves them there.
//!
//! Layout: `criteria.rs` (rule evaluation), `routing.rs` (cold location scoring),
//! `progress.rs` (scan progress and exclusion), `workflow.rs` (per-path scans),
//! `operations.rs` (freeze/thaw/pin/reversal), `inventory.rs` (listing and stats),
//! `relocation.rs` (cold-to-cold migration queue), `error.rs`.

pub mod criteria;
pub mod error;
pub mod inventory;
pub mod operations;
mod pool;
pub mod progress;
pub mod relocation;
pub mod routing;
pub mod workflow;

pub use criteria::{
    AccessTime, AccessTimeSource, CriteriaMatcher, Evaluation, LastOpenedAccessTime,
    RawAccessTime, parse_size,
};
pub use error::{EngineError, EngineResult};
pub use inventory::{InventoryPage, InventoryQuery, InventorySortKey, PathStats, apply_query};
pub use operations::ReversalResult;
pub use progress::{
    FileOperationKind, FileOperationProgress, ScanCounter, ScanProgress, ScanProgressManager,
    ScanStatus,
};
pub use relocation::{RelocationManager, RelocationStatus, RelocationTask};
pub use routing::{DiskUsage, DiskUsageProbe, Fs2DiskUsage, LocationLoad, Rejection, StorageRouter};
pub use workflow::{
    AccessTimeCapability, AssumeSupported, FileOutcome, FileWorkflow, ScanResult, SkipReason,
    WorkflowDeps,
};
