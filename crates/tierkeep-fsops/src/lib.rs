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

//! Filesystem primitives for the tierkeep engine.
//!
//! Layout: `mover.rs` (move/copy/symlink transfers), `crypto.rs` (streaming
//! AES-256-GCM), `metadata.rs` (file snapshots), `identity.rs` (uid/gid/mode
//! parsing), `error.rs`.

pub mod crypto;
pub mod error;
pub mod identity;
pub mod metadata;
pub mod mover;

pub use crypto::EncryptionService;
pub use error::{FsOpsError, FsOpsResult};
pub use identity::{parse_octal_mode, resolve_group, resolve_user};
pub use metadata::{EntryKind, FileSnapshot};
pub use mover::{
    FileMover, NO_INDEX_MARKERS, Payload, TransferOutcome, create_symlink, mark_unindexed,
    remove_symlink, sha256_file,
};
