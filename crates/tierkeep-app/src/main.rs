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
#![allow(clippy::multiple_crate_versions)]

//! Binary entrypoint: loads configuration, wires the services, and runs the scan
//! scheduler until interrupted.

use std::path::PathBuf;

use anyhow::Context;
use tierkeep_app::run_app;

/// Boots tierkeep and blocks until shutdown. The optional first argument is a
/// configuration file path.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    run_app(config_path.as_deref())
        .await
        .context("tierkeep terminated with an error")
}
