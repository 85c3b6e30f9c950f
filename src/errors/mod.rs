// SPDX-License-Identifier: MIT

//! Error types for engine hosting and document operations.
//!
//! All errors implement `std::error::Error` via the `thiserror` crate.
//! Corruption-class diagnostics are classified centrally in [`classify`]
//! rather than at individual call sites.

pub mod classify;

pub use classify::{classify_diagnostic, DiagnosticClass};

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all engine-hosting operations.
///
/// The first group mirrors the externally visible taxonomy consumed by
/// editors, CLIs and servers; the second group covers marshaling, transport
/// and lifecycle infrastructure.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Empty or malformed input bytes.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The requested format pair is not convertible.
    #[error("Unsupported format conversion: {input} -> {output}")]
    UnsupportedFormat { input: String, output: String },

    /// The engine returned a null document handle; carries the engine's
    /// last-error diagnostic.
    #[error("Document load failed: {0}")]
    LoadFailed(String),

    /// Save returned falsy or the output read-back was empty.
    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    /// The tier is not ready or the engine module is not loaded.
    #[error("Engine not initialized: {0}")]
    WasmNotInitialized(String),

    /// The document is encrypted and no (valid) password was supplied.
    #[error("Document requires a password")]
    PasswordRequired,

    /// The engine recognized the document but could not parse it.
    #[error("Corrupted document: {0}")]
    CorruptedDocument(String),

    /// The loaded engine build does not match the expected ABI contract
    /// (missing exports, bad struct magic, offset drift).
    #[error("Engine ABI mismatch: {0}")]
    AbiMismatch(String),

    /// Allocation or access error in engine linear memory.
    #[error("Memory error: {0}")]
    Memory(String),

    /// Worker thread/process channel failure; fanned out to every in-flight
    /// caller, not just the one that triggered it.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A correlated request received no response in time.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed message on the inter-context channel.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unsupported engine binary encoding (component model, legacy preview).
    #[error("Unsupported engine encoding: {0}")]
    UnsupportedEncoding(String),

    /// File I/O error while loading the engine module.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// UTF-8 decoding error for a string crossing the boundary.
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Wasmtime runtime execution error (traps included).
    #[error("Engine execution error: {0}")]
    Execution(#[from] wasmtime::Error),

    /// WASM binary parsing error from wasmparser.
    #[error("Engine binary parse error: {0}")]
    Parser(#[from] wasmparser::BinaryReaderError),
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
