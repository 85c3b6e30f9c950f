// SPDX-License-Identifier: MIT

//! Side-process engine worker.
//!
//! Spawned by the process tier. Reads its configuration as the first stdin
//! line, boots an engine session, then serves JSON-line requests until
//! shutdown or EOF. Stdout belongs to the protocol; all logging goes to
//! stderr.

use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = wasmdoc::tiers::worker::run_stdio_worker() {
        tracing::error!("engine worker failed: {}", e);
        std::process::exit(1);
    }
}
