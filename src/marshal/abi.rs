// SPDX-License-Identifier: MIT

//! Engine ABI surface: shim export names, the versioned vtable offset
//! contract, and dispatch-strategy selection.
//!
//! The engine build either exposes a fixed set of named entry points
//! ("shims") or it does not. Probing happens once, at construction. When the
//! shims are missing the marshaler falls back to **vtable traversal**: it
//! reads a vtable pointer from a fixed byte offset inside the engine/document
//! struct, reads a function-table index from a fixed slot offset within that
//! vtable, and invokes it through the engine's exported indirect function
//! table.
//!
//! ## Do not touch the offsets casually
//!
//! The struct layout below is a versioned contract with a specific engine
//! build. If the engine's internal layout changes, vtable traversal does not
//! fail cleanly: it calls the wrong function or reads garbage. The only
//! guard is the magic word validated at boot; treat any offset edit as an ABI
//! version bump and update [`ABI_VERSION`] together with the engine build.

use crate::errors::{EngineError, EngineResult};
use wasmtime::{Instance, Store, Table, TypedFunc};

/// Version of the vtable offset contract below.
pub const ABI_VERSION: u32 = 1;

/// Name of the engine's exported indirect call table.
pub const FUNCTION_TABLE_EXPORT: &str = "__indirect_function_table";

/// Entry points that every supported engine build exports by name.
///
/// These cover instance lifecycle, the engine allocator, virtual-file
/// staging, the callback queue, and unit queries. Document operations are the
/// only ones with a vtable fallback.
pub const REQUIRED_EXPORTS: &[&str] = &[
    "eng_init",
    "eng_destroy",
    "eng_malloc",
    "eng_free",
    "eng_file_write",
    "eng_file_read",
    "eng_file_remove",
    "eng_post_command",
    "eng_register_callback",
    "eng_unregister_callback",
    "eng_clear_callbacks",
    "eng_flush_callbacks",
    "eng_poll_callback",
    "eng_unit_ratio",
];

/// Named document-operation shims, probed at construction. All present means
/// shim dispatch; any absent means vtable traversal.
pub const SHIM_EXPORTS: &[&str] = &[
    "eng_document_load",
    "eng_document_load_with_options",
    "eng_document_save_as",
    "eng_document_destroy",
    "eng_get_error",
    "eng_document_parts",
    "eng_document_part",
    "eng_document_set_part",
    "eng_document_type",
    "eng_document_size",
    "eng_paint_tile",
];

/// Byte offsets inside engine-internal structs, plus the magic words used to
/// validate them at boot. One instance of this table per [`ABI_VERSION`].
#[derive(Debug, Clone, Copy)]
pub struct AbiOffsets {
    /// Expected value of the u32 at offset 0 of the engine instance struct.
    pub engine_magic: u32,
    /// Expected value of the u32 at offset 0 of a document struct.
    pub document_magic: u32,
    /// Offset of the vtable pointer within both struct kinds.
    pub vtable_offset: u32,
}

/// The offset contract for [`ABI_VERSION`] 1.
pub const ABI_OFFSETS: AbiOffsets = AbiOffsets {
    engine_magic: 0x454E_4731, // "ENG1"
    document_magic: 0x444F_4331, // "DOC1"
    vtable_offset: 4,
};

/// Slot indices within the engine struct's vtable.
#[derive(Debug, Clone, Copy)]
pub enum EngineSlot {
    DocumentLoad = 0,
    DocumentLoadWithOptions = 1,
    GetError = 2,
}

/// Slot indices within a document struct's vtable.
#[derive(Debug, Clone, Copy)]
pub enum DocumentSlot {
    Destroy = 0,
    SaveAs = 1,
    Parts = 2,
    Part = 3,
    SetPart = 4,
    Type = 5,
    Size = 6,
    PaintTile = 7,
}

/// Document-operation entry points resolved once from named shim exports.
pub struct ShimTable {
    pub document_load: TypedFunc<(i32, i32), i32>,
    pub document_load_with_options: TypedFunc<(i32, i32, i32), i32>,
    pub document_save_as: TypedFunc<(i32, i32, i32, i32), i32>,
    pub document_destroy: TypedFunc<i32, ()>,
    pub get_error: TypedFunc<i32, i32>,
    pub document_parts: TypedFunc<i32, i32>,
    pub document_part: TypedFunc<i32, i32>,
    pub document_set_part: TypedFunc<(i32, i32), ()>,
    pub document_type: TypedFunc<i32, i32>,
    pub document_size: TypedFunc<(i32, i32, i32), ()>,
    pub paint_tile: TypedFunc<(i32, i32, i32, i32, i32, i32, i32, i32), ()>,
}

impl ShimTable {
    /// Resolve every shim with its expected signature. A present-but-wrongly-
    /// typed shim is an ABI mismatch, not a fallback trigger.
    pub fn resolve(store: &mut Store<()>, instance: &Instance) -> EngineResult<Self> {
        fn typed<P, R>(
            store: &mut Store<()>,
            instance: &Instance,
            name: &str,
        ) -> EngineResult<TypedFunc<P, R>>
        where
            P: wasmtime::WasmParams,
            R: wasmtime::WasmResults,
        {
            instance.get_typed_func::<P, R>(&mut *store, name).map_err(|e| {
                EngineError::AbiMismatch(format!("shim '{}' has unexpected signature: {}", name, e))
            })
        }

        Ok(Self {
            document_load: typed(store, instance, "eng_document_load")?,
            document_load_with_options: typed(store, instance, "eng_document_load_with_options")?,
            document_save_as: typed(store, instance, "eng_document_save_as")?,
            document_destroy: typed(store, instance, "eng_document_destroy")?,
            get_error: typed(store, instance, "eng_get_error")?,
            document_parts: typed(store, instance, "eng_document_parts")?,
            document_part: typed(store, instance, "eng_document_part")?,
            document_set_part: typed(store, instance, "eng_document_set_part")?,
            document_type: typed(store, instance, "eng_document_type")?,
            document_size: typed(store, instance, "eng_document_size")?,
            paint_tile: typed(store, instance, "eng_paint_tile")?,
        })
    }
}

/// Call strategy selected once at marshaler construction.
pub enum Dispatch {
    /// Named shim exports, resolved and typed once.
    Shim(ShimTable),
    /// Struct-offset traversal through the indirect function table.
    Vtable { table: Table, offsets: AbiOffsets },
}

impl Dispatch {
    pub fn strategy_name(&self) -> &'static str {
        match self {
            Dispatch::Shim(_) => "shim",
            Dispatch::Vtable { .. } => "vtable",
        }
    }
}

/// True when the instance exports the complete shim set.
pub fn shims_available(store: &mut Store<()>, instance: &Instance) -> bool {
    SHIM_EXPORTS
        .iter()
        .all(|name| instance.get_func(&mut *store, name).is_some())
}
