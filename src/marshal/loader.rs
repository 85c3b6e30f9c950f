// SPDX-License-Identifier: MIT

//! Engine module loading and validation.
//!
//! Loads the engine `.wasm` from disk, verifies size and encoding with a
//! spec-compliant parse, and compiles it with a security-focused wasmtime
//! configuration. The engine must be a classic core module; Component Model
//! binaries are rejected rather than half-supported.

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::observability::messages::marshal::ModuleLoaded;
use std::path::Path;
use wasmparser::{Encoding, Parser, Payload};
use wasmtime::{Config, Engine, Module};

/// Compiled engine module plus the wasmtime engine that owns it.
pub struct LoadedEngine {
    pub engine: Engine,
    pub module: Module,
}

/// Detects whether the given binary is a classic core module.
///
/// Component Model binaries (encoding version 2+) and legacy preview
/// components (version 1 carrying a "component" custom section) are rejected.
pub fn validate_core_module(bytes: &[u8]) -> EngineResult<()> {
    let parser = Parser::new(0);
    let mut encoding = None;
    let mut has_component_section = false;

    for payload in parser.parse_all(bytes) {
        match payload? {
            Payload::Version { encoding: enc, .. } => encoding = Some(enc),
            Payload::CustomSection(reader) if reader.name() == "component" => {
                has_component_section = true;
            }
            _ => {}
        }
    }

    match encoding {
        None => Err(EngineError::InvalidInput(
            "not a WebAssembly binary".to_string(),
        )),
        Some(Encoding::Component) => Err(EngineError::UnsupportedEncoding(
            "engine is a Component Model binary; a core module build is required".to_string(),
        )),
        Some(Encoding::Module) if has_component_section => Err(EngineError::UnsupportedEncoding(
            "engine is a legacy Preview 1 component; a core module build is required".to_string(),
        )),
        Some(Encoding::Module) => Ok(()),
    }
}

/// Creates a wasmtime engine configured for hosting the document engine.
///
/// Fuel is enabled so every invocation runs under an explicit budget; epoch
/// interruption stays off to avoid spurious interrupt traps in embedded use.
/// Threads, SIMD, multi-memory, memory64 and the Component Model are disabled:
/// the engine build targets none of them and a smaller surface is a smaller
/// sandbox.
pub fn create_engine() -> EngineResult<Engine> {
    let mut config = Config::new();

    config.wasm_threads(false);
    config.wasm_simd(false);
    config.wasm_relaxed_simd(false);
    config.wasm_multi_memory(false);
    config.wasm_memory64(false);
    config.wasm_component_model(false);
    config.consume_fuel(true);
    config.epoch_interruption(false);

    Engine::new(&config).map_err(EngineError::Execution)
}

/// Load and compile the engine module named by `config.module_path`.
pub fn load_engine_module(config: &EngineConfig) -> EngineResult<LoadedEngine> {
    let engine = create_engine()?;
    let bytes = load_engine_bytes(&config.module_path, config.max_module_size)?;
    validate_core_module(&bytes)?;

    let module = Module::new(&engine, &bytes)?;

    tracing::info!(
        "{}",
        ModuleLoaded {
            module_path: &config.module_path.to_string_lossy(),
            size_bytes: bytes.len(),
        }
    );

    Ok(LoadedEngine { engine, module })
}

fn load_engine_bytes(path: &Path, max_size: usize) -> EngineResult<Vec<u8>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() > max_size {
        return Err(EngineError::InvalidInput(format!(
            "engine module too large: {} bytes (max: {} bytes)",
            bytes.len(),
            max_size
        )));
    }
    Ok(bytes)
}
