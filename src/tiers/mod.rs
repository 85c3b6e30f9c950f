// SPDX-License-Identifier: MIT

//! Execution tiers.
//!
//! The engine is a large native codebase running in linear memory; a bad
//! pointer arithmetic bug corrupts the whole instance, not just one call.
//! The tiers trade overhead against blast radius:
//!
//! - [`LocalTier`]: same context, zero isolation, fastest.
//! - [`ThreadTier`]: dedicated OS thread, host survives a wedged engine.
//! - [`ProcessTier`]: child process, host survives anything, respawn and
//!   retry on corruption.
//!
//! All three implement [`DocumentEngine`] and detect corruption through the
//! same diagnostic classifier.

pub mod local;
pub mod pending;
pub mod process;
pub mod protocol;
pub mod thread;
pub mod worker;

pub use local::LocalTier;
pub use pending::PendingRequests;
pub use process::{ProcessTier, StdioTransport, WorkerChannel, WorkerTransport};
pub use thread::ThreadTier;

use crate::errors::EngineResult;
use async_trait::async_trait;

/// Options shared by the whole-document operations.
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    pub output_format: String,
    pub input_format: Option<String>,
    pub password: Option<String>,
    pub filter_options: Option<String>,
}

impl ConvertOptions {
    pub fn to_format(output_format: impl Into<String>) -> Self {
        Self {
            output_format: output_format.into(),
            ..Self::default()
        }
    }
}

/// Outcome of a conversion.
#[derive(Debug, Clone)]
pub struct ConvertResult {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub filename: String,
    pub duration_ms: u64,
}

/// One rendered document part as raw RGBA pixels.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Per-tier lifecycle state. `Corrupted` is cleared only by a successful
/// re-initialization; `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierState {
    Uninitialized,
    Initializing,
    Ready,
    Corrupted,
    Destroyed,
}

/// Common surface of the execution tiers.
///
/// Implementations own their engine context; callers never touch handles or
/// linear memory directly. `convert`, `page_count` and `render_page` heal a
/// corrupted context before proceeding, but never retry the call that
/// observed the corruption (the process tier's respawn-and-retry budget is
/// the one exception, and it is explicit configuration).
#[async_trait]
pub trait DocumentEngine: Send + Sync {
    async fn initialize(&self) -> EngineResult<()>;

    async fn destroy(&self) -> EngineResult<()>;

    async fn is_ready(&self) -> bool;

    async fn convert(&self, document: &[u8], options: ConvertOptions)
        -> EngineResult<ConvertResult>;

    async fn page_count(&self, document: &[u8], options: ConvertOptions) -> EngineResult<u32>;

    async fn render_page(
        &self,
        document: &[u8],
        options: ConvertOptions,
        page: u32,
        width: u32,
        height: Option<u32>,
    ) -> EngineResult<RenderedPage>;
}
