// SPDX-License-Identifier: MIT

//! Boundary marshaling: raw engine-ABI invocation across linear memory.

pub mod abi;
pub mod callbacks;
pub mod loader;
mod memory;

pub use abi::{Dispatch, ShimTable, ABI_OFFSETS, ABI_VERSION};
pub use callbacks::{parse_state_changes, CallbackChannel, CallbackEvent};
pub use loader::{create_engine, load_engine_module, validate_core_module, LoadedEngine};
pub use memory::Marshaler;
