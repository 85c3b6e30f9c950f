// SPDX-License-Identifier: MIT

//! wasmdoc: document conversion over a WASM-sandboxed document engine.
//!
//! A large native document engine, compiled to WebAssembly, runs inside
//! `wasmtime` with no system capabilities. This crate provides the two
//! layers that make that usable:
//!
//! - the **marshaling layer** ([`marshal`], [`session`]): strings, buffers
//!   and documents crossing the linear-memory boundary, with named-shim
//!   dispatch and a vtable-traversal fallback;
//! - the **execution tiers** ([`tiers`]): same-context, side-thread and
//!   side-process hosting with corruption detection and recovery.

pub mod config;
pub mod errors;
pub mod marshal;
pub mod observability;
pub mod registry;
pub mod session;
pub mod tiers;

#[cfg(test)]
pub(crate) mod test_engine;

pub use config::{load_config, EngineConfig, ResilienceConfig};
pub use errors::{EngineError, EngineResult};
pub use session::{DocumentHandle, DocumentType, EngineHandle, EngineSession};
pub use tiers::{
    ConvertOptions, ConvertResult, DocumentEngine, LocalTier, ProcessTier, RenderedPage,
    ThreadTier, TierState,
};
