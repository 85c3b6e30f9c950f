// SPDX-License-Identifier: MIT

//! Memory Marshaler: every host-level operation crosses the engine's linear
//! memory boundary through this type.
//!
//! ## Crossing contracts
//!
//! * **Strings** are UTF-8, NUL-terminated, copied into a fresh engine
//!   allocation, passed as an i32 offset, and freed when the call returns,
//!   success or failure. Scoped acquisition ([`Marshaler::with_c_string`],
//!   [`Marshaler::with_buffer`]) guarantees the free on every exit path.
//! * **Strings returned by the engine** live on the engine heap. They are
//!   read up to the NUL byte and then freed through the engine's allocator.
//!   Skipping that free leaks *engine* memory, which no host-side leak
//!   detector will ever see.
//! * **Views are never cached.** Every read or write re-fetches the memory
//!   view at the use site, because the engine can grow its memory at any call
//!   and growth invalidates previously obtained slices.

use crate::errors::{EngineError, EngineResult};
use crate::marshal::abi::{
    shims_available, AbiOffsets, Dispatch, DocumentSlot, EngineSlot, ShimTable, ABI_OFFSETS,
    FUNCTION_TABLE_EXPORT,
};
use crate::observability::messages::marshal::DispatchSelected;
use wasmtime::{Func, Instance, Memory, Ref, Store, TypedFunc};

pub struct Marshaler {
    memory: Memory,
    malloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
    init: TypedFunc<i32, i32>,
    engine_destroy: TypedFunc<i32, ()>,
    file_write: TypedFunc<(i32, i32, i32), i32>,
    file_read: TypedFunc<(i32, i32), i32>,
    file_remove: TypedFunc<i32, i32>,
    post_command: TypedFunc<(i32, i32), ()>,
    unit_ratio: TypedFunc<(), f64>,
    dispatch: Dispatch,
}

impl Marshaler {
    /// Resolve the always-named entry points and select the dispatch
    /// strategy. Probing happens exactly once, here.
    pub fn new(
        store: &mut Store<()>,
        instance: &Instance,
        force_vtable: bool,
    ) -> EngineResult<Self> {
        let memory = instance.get_memory(&mut *store, "memory").ok_or_else(|| {
            EngineError::AbiMismatch("engine module must export 'memory'".to_string())
        })?;

        let dispatch = if !force_vtable && shims_available(store, instance) {
            Dispatch::Shim(ShimTable::resolve(store, instance)?)
        } else {
            let table = instance
                .get_table(&mut *store, FUNCTION_TABLE_EXPORT)
                .ok_or_else(|| {
                    EngineError::AbiMismatch(format!(
                        "shims unavailable and '{}' is not exported; no dispatch strategy",
                        FUNCTION_TABLE_EXPORT
                    ))
                })?;
            Dispatch::Vtable {
                table,
                offsets: ABI_OFFSETS,
            }
        };

        tracing::info!(
            "{}",
            DispatchSelected {
                strategy: dispatch.strategy_name(),
            }
        );

        Ok(Self {
            memory,
            malloc: required(store, instance, "eng_malloc")?,
            free: required(store, instance, "eng_free")?,
            init: required(store, instance, "eng_init")?,
            engine_destroy: required(store, instance, "eng_destroy")?,
            file_write: required(store, instance, "eng_file_write")?,
            file_read: required(store, instance, "eng_file_read")?,
            file_remove: required(store, instance, "eng_file_remove")?,
            post_command: required(store, instance, "eng_post_command")?,
            unit_ratio: required(store, instance, "eng_unit_ratio")?,
            dispatch,
        })
    }

    pub fn dispatch_strategy(&self) -> &'static str {
        self.dispatch.strategy_name()
    }

    // ---- allocation -------------------------------------------------------

    /// Allocate `len` bytes on the engine heap. Null return is an allocation
    /// failure, not a valid pointer.
    pub fn alloc(&self, store: &mut Store<()>, len: usize) -> EngineResult<u32> {
        let len = i32::try_from(len.max(1))
            .map_err(|_| EngineError::Memory(format!("allocation too large: {} bytes", len)))?;
        let ptr = self.malloc.call(&mut *store, len)?;
        if ptr == 0 {
            return Err(EngineError::Memory(format!(
                "engine allocator returned null for {} bytes",
                len
            )));
        }
        Ok(ptr as u32)
    }

    /// Return an allocation to the engine heap.
    pub fn free(&self, store: &mut Store<()>, ptr: u32) -> EngineResult<()> {
        self.free.call(&mut *store, ptr as i32)?;
        Ok(())
    }

    /// Run `f` with a NUL-terminated copy of `s` on the engine heap. The
    /// allocation is freed on every exit path; the operation's error wins
    /// over a failing free.
    pub fn with_c_string<T>(
        &self,
        store: &mut Store<()>,
        s: &str,
        f: impl FnOnce(&Self, &mut Store<()>, u32) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let bytes = s.as_bytes();
        let ptr = self.alloc(store, bytes.len() + 1)?;
        if let Err(e) = self.write_c_string(store, ptr, bytes) {
            let _ = self.free(store, ptr);
            return Err(e);
        }
        let result = f(self, store, ptr);
        let freed = self.free(store, ptr);
        match (result, freed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(free_err)) => Err(free_err),
            (Err(e), _) => Err(e),
        }
    }

    /// Run `f` with a zero-initialized `len`-byte allocation on the engine
    /// heap. Same free guarantee as [`Marshaler::with_c_string`].
    pub fn with_buffer<T>(
        &self,
        store: &mut Store<()>,
        len: usize,
        f: impl FnOnce(&Self, &mut Store<()>, u32) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let ptr = self.alloc(store, len)?;
        let result = f(self, store, ptr);
        let freed = self.free(store, ptr);
        match (result, freed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(free_err)) => Err(free_err),
            (Err(e), _) => Err(e),
        }
    }

    // ---- raw reads/writes (always through a fresh view) -------------------

    pub fn write_bytes(&self, store: &mut Store<()>, ptr: u32, bytes: &[u8]) -> EngineResult<()> {
        let data = self.memory.data_mut(&mut *store);
        let start = ptr as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|end| *end <= data.len())
            .ok_or_else(|| out_of_bounds(start, bytes.len(), data.len()))?;
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn write_c_string(&self, store: &mut Store<()>, ptr: u32, bytes: &[u8]) -> EngineResult<()> {
        let data = self.memory.data_mut(&mut *store);
        let start = ptr as usize;
        let end = start
            .checked_add(bytes.len() + 1)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| out_of_bounds(start, bytes.len() + 1, data.len()))?;
        data[start..end - 1].copy_from_slice(bytes);
        data[end - 1] = 0;
        Ok(())
    }

    pub fn read_bytes(&self, store: &mut Store<()>, ptr: u32, len: usize) -> EngineResult<Vec<u8>> {
        let data = self.memory.data(&*store);
        let start = ptr as usize;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| out_of_bounds(start, len, data.len()))?;
        Ok(data[start..end].to_vec())
    }

    pub fn read_u32(&self, store: &mut Store<()>, ptr: u32) -> EngineResult<u32> {
        let bytes = self.read_bytes(store, ptr, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte read")))
    }

    pub fn write_u32(&self, store: &mut Store<()>, ptr: u32, value: u32) -> EngineResult<()> {
        self.write_bytes(store, ptr, &value.to_le_bytes())
    }

    /// Decode a NUL-terminated UTF-8 string living on the engine heap.
    pub fn read_c_string(&self, store: &mut Store<()>, ptr: u32) -> EngineResult<String> {
        let data = self.memory.data(&*store);
        let start = ptr as usize;
        if start >= data.len() {
            return Err(out_of_bounds(start, 1, data.len()));
        }
        let nul = data[start..]
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| EngineError::Memory(format!("unterminated string at {:#x}", start)))?;
        Ok(String::from_utf8(data[start..start + nul].to_vec())?)
    }

    /// Read an engine-returned string, then free it through the engine's
    /// allocator. Engine-returned strings always transfer ownership.
    pub fn read_string_and_free(&self, store: &mut Store<()>, ptr: u32) -> EngineResult<String> {
        let result = self.read_c_string(store, ptr);
        let freed = self.free(store, ptr);
        match (result, freed) {
            (Ok(s), Ok(())) => Ok(s),
            (Ok(_), Err(free_err)) => Err(free_err),
            (Err(e), _) => Err(e),
        }
    }

    // ---- vtable traversal -------------------------------------------------

    fn vtable_offsets(&self) -> Option<&AbiOffsets> {
        match &self.dispatch {
            Dispatch::Vtable { offsets, .. } => Some(offsets),
            Dispatch::Shim(_) => None,
        }
    }

    /// Validate the magic word at offset 0 of an engine-internal struct.
    /// Only meaningful under vtable dispatch; a mismatch means the offset
    /// contract does not fit the loaded engine build.
    pub fn validate_struct_magic(
        &self,
        store: &mut Store<()>,
        obj: u32,
        expected: u32,
    ) -> EngineResult<()> {
        let found = self.read_u32(store, obj)?;
        if found != expected {
            return Err(EngineError::AbiMismatch(format!(
                "struct magic mismatch at {:#x}: expected {:#010x}, found {:#010x} (offset contract v{} does not match this engine build)",
                obj,
                expected,
                found,
                crate::marshal::abi::ABI_VERSION,
            )));
        }
        Ok(())
    }

    /// Validate the engine instance struct after `eng_init`, when running
    /// under vtable dispatch. No-op under shim dispatch.
    pub fn validate_engine_struct(&self, store: &mut Store<()>, eh: u32) -> EngineResult<()> {
        if let Some(offsets) = self.vtable_offsets() {
            self.validate_struct_magic(store, eh, offsets.engine_magic)?;
        }
        Ok(())
    }

    /// Read `obj`'s vtable pointer, read the function-table index at `slot`,
    /// and resolve it through the indirect call table.
    fn vtable_func(&self, store: &mut Store<()>, obj: u32, slot: u32) -> EngineResult<Func> {
        let (table, offsets) = match &self.dispatch {
            Dispatch::Vtable { table, offsets } => (*table, *offsets),
            Dispatch::Shim(_) => {
                return Err(EngineError::AbiMismatch(
                    "vtable traversal requested under shim dispatch".to_string(),
                ))
            }
        };

        let vtable = self.read_u32(store, obj.wrapping_add(offsets.vtable_offset))?;
        let index = self.read_u32(store, vtable.wrapping_add(slot * 4))?;

        let entry = table.get(&mut *store, index as u64).ok_or_else(|| {
            EngineError::Execution(anyhow::anyhow!(
                "table index is out of bounds: {} (table size {})",
                index,
                table.size(&*store)
            ))
        })?;

        match entry {
            Ref::Func(Some(func)) => Ok(func),
            Ref::Func(None) => Err(EngineError::Execution(anyhow::anyhow!(
                "null function at call table index {}",
                index
            ))),
            _ => Err(EngineError::AbiMismatch(format!(
                "call table entry {} is not a function reference",
                index
            ))),
        }
    }

    // ---- engine lifecycle -------------------------------------------------

    /// Instance hook: boots the engine with its install path and returns the
    /// engine handle. 0 means the engine refused to come up.
    pub fn engine_init(&self, store: &mut Store<()>, install_path: &str) -> EngineResult<u32> {
        let handle = self.with_c_string(store, install_path, |m, store, ptr| {
            Ok(m.init.call(&mut *store, ptr as i32)?)
        })?;
        Ok(handle as u32)
    }

    pub fn engine_destroy(&self, store: &mut Store<()>, eh: u32) -> EngineResult<()> {
        self.engine_destroy.call(&mut *store, eh as i32)?;
        Ok(())
    }

    /// Fetch and clear the engine's last-error string, if any. The returned
    /// string is freed engine-side as part of the read.
    pub fn last_error(&self, store: &mut Store<()>, eh: u32) -> EngineResult<Option<String>> {
        let ptr = match &self.dispatch {
            Dispatch::Shim(shims) => shims.get_error.call(&mut *store, eh as i32)?,
            Dispatch::Vtable { .. } => {
                let f = self.vtable_func(store, eh, EngineSlot::GetError as u32)?;
                f.typed::<i32, i32>(&*store)?.call(&mut *store, eh as i32)?
            }
        };
        if ptr == 0 {
            return Ok(None);
        }
        self.read_string_and_free(store, ptr as u32).map(Some)
    }

    // ---- document operations ---------------------------------------------

    pub fn document_load(&self, store: &mut Store<()>, eh: u32, path: &str) -> EngineResult<u32> {
        let handle = self.with_c_string(store, path, |m, store, path_ptr| {
            match &m.dispatch {
                Dispatch::Shim(shims) => {
                    Ok(shims.document_load.call(&mut *store, (eh as i32, path_ptr as i32))?)
                }
                Dispatch::Vtable { .. } => {
                    let f = m.vtable_func(store, eh, EngineSlot::DocumentLoad as u32)?;
                    Ok(f.typed::<(i32, i32), i32>(&*store)?
                        .call(&mut *store, (eh as i32, path_ptr as i32))?)
                }
            }
        })?;
        Ok(handle as u32)
    }

    pub fn document_load_with_options(
        &self,
        store: &mut Store<()>,
        eh: u32,
        path: &str,
        options: &str,
    ) -> EngineResult<u32> {
        let handle = self.with_c_string(store, path, |m, store, path_ptr| {
            m.with_c_string(store, options, |m, store, opts_ptr| match &m.dispatch {
                Dispatch::Shim(shims) => Ok(shims.document_load_with_options.call(
                    &mut *store,
                    (eh as i32, path_ptr as i32, opts_ptr as i32),
                )?),
                Dispatch::Vtable { .. } => {
                    let f = m.vtable_func(store, eh, EngineSlot::DocumentLoadWithOptions as u32)?;
                    Ok(f.typed::<(i32, i32, i32), i32>(&*store)?
                        .call(&mut *store, (eh as i32, path_ptr as i32, opts_ptr as i32))?)
                }
            })
        })?;
        Ok(handle as u32)
    }

    /// Returns the engine's truthiness for the save: `false` means the filter
    /// rejected the document or the format.
    pub fn document_save_as(
        &self,
        store: &mut Store<()>,
        dh: u32,
        url: &str,
        format: &str,
        filter_options: &str,
    ) -> EngineResult<bool> {
        let ok = self.with_c_string(store, url, |m, store, url_ptr| {
            m.with_c_string(store, format, |m, store, fmt_ptr| {
                m.with_c_string(store, filter_options, |m, store, opts_ptr| match &m.dispatch {
                    Dispatch::Shim(shims) => Ok(shims.document_save_as.call(
                        &mut *store,
                        (dh as i32, url_ptr as i32, fmt_ptr as i32, opts_ptr as i32),
                    )?),
                    Dispatch::Vtable { .. } => {
                        let f = m.vtable_func(store, dh, DocumentSlot::SaveAs as u32)?;
                        Ok(f.typed::<(i32, i32, i32, i32), i32>(&*store)?.call(
                            &mut *store,
                            (dh as i32, url_ptr as i32, fmt_ptr as i32, opts_ptr as i32),
                        )?)
                    }
                })
            })
        })?;
        Ok(ok != 0)
    }

    pub fn document_destroy(&self, store: &mut Store<()>, dh: u32) -> EngineResult<()> {
        match &self.dispatch {
            Dispatch::Shim(shims) => shims.document_destroy.call(&mut *store, dh as i32)?,
            Dispatch::Vtable { .. } => {
                let f = self.vtable_func(store, dh, DocumentSlot::Destroy as u32)?;
                f.typed::<i32, ()>(&*store)?.call(&mut *store, dh as i32)?;
            }
        }
        Ok(())
    }

    pub fn document_parts(&self, store: &mut Store<()>, dh: u32) -> EngineResult<u32> {
        let parts = match &self.dispatch {
            Dispatch::Shim(shims) => shims.document_parts.call(&mut *store, dh as i32)?,
            Dispatch::Vtable { .. } => {
                let f = self.vtable_func(store, dh, DocumentSlot::Parts as u32)?;
                f.typed::<i32, i32>(&*store)?.call(&mut *store, dh as i32)?
            }
        };
        Ok(parts as u32)
    }

    pub fn document_part(&self, store: &mut Store<()>, dh: u32) -> EngineResult<u32> {
        let part = match &self.dispatch {
            Dispatch::Shim(shims) => shims.document_part.call(&mut *store, dh as i32)?,
            Dispatch::Vtable { .. } => {
                let f = self.vtable_func(store, dh, DocumentSlot::Part as u32)?;
                f.typed::<i32, i32>(&*store)?.call(&mut *store, dh as i32)?
            }
        };
        Ok(part as u32)
    }

    pub fn document_set_part(&self, store: &mut Store<()>, dh: u32, part: u32) -> EngineResult<()> {
        match &self.dispatch {
            Dispatch::Shim(shims) => {
                shims.document_set_part.call(&mut *store, (dh as i32, part as i32))?
            }
            Dispatch::Vtable { .. } => {
                let f = self.vtable_func(store, dh, DocumentSlot::SetPart as u32)?;
                f.typed::<(i32, i32), ()>(&*store)?
                    .call(&mut *store, (dh as i32, part as i32))?;
            }
        }
        Ok(())
    }

    pub fn document_type(&self, store: &mut Store<()>, dh: u32) -> EngineResult<u32> {
        let code = match &self.dispatch {
            Dispatch::Shim(shims) => shims.document_type.call(&mut *store, dh as i32)?,
            Dispatch::Vtable { .. } => {
                let f = self.vtable_func(store, dh, DocumentSlot::Type as u32)?;
                f.typed::<i32, i32>(&*store)?.call(&mut *store, dh as i32)?
            }
        };
        Ok(code as u32)
    }

    /// Document size in the engine's native unit (twips), read through two
    /// out-params in one scoped allocation.
    pub fn document_size(&self, store: &mut Store<()>, dh: u32) -> EngineResult<(u32, u32)> {
        self.with_buffer(store, 8, |m, store, out_ptr| {
            let (w_ptr, h_ptr) = (out_ptr, out_ptr + 4);
            match &m.dispatch {
                Dispatch::Shim(shims) => shims
                    .document_size
                    .call(&mut *store, (dh as i32, w_ptr as i32, h_ptr as i32))?,
                Dispatch::Vtable { .. } => {
                    let f = m.vtable_func(store, dh, DocumentSlot::Size as u32)?;
                    f.typed::<(i32, i32, i32), ()>(&*store)?
                        .call(&mut *store, (dh as i32, w_ptr as i32, h_ptr as i32))?;
                }
            }
            Ok((m.read_u32(store, w_ptr)?, m.read_u32(store, h_ptr)?))
        })
    }

    /// Render a tile: allocate `width*height*4` bytes, paint, copy out
    /// through a fresh view, free. Position and size are native units.
    #[allow(clippy::too_many_arguments)]
    pub fn paint_tile(
        &self,
        store: &mut Store<()>,
        dh: u32,
        canvas_width_px: u32,
        canvas_height_px: u32,
        tile_x: u32,
        tile_y: u32,
        tile_width: u32,
        tile_height: u32,
    ) -> EngineResult<Vec<u8>> {
        let len = canvas_width_px as usize * canvas_height_px as usize * 4;
        self.with_buffer(store, len, |m, store, buf_ptr| {
            let args = (
                dh as i32,
                buf_ptr as i32,
                canvas_width_px as i32,
                canvas_height_px as i32,
                tile_x as i32,
                tile_y as i32,
                tile_width as i32,
                tile_height as i32,
            );
            match &m.dispatch {
                Dispatch::Shim(shims) => shims.paint_tile.call(&mut *store, args)?,
                Dispatch::Vtable { .. } => {
                    let f = m.vtable_func(store, dh, DocumentSlot::PaintTile as u32)?;
                    f.typed::<(i32, i32, i32, i32, i32, i32, i32, i32), ()>(&*store)?
                        .call(&mut *store, args)?;
                }
            }
            // The paint call may have grown memory; read_bytes re-fetches the
            // view rather than trusting anything obtained before the call.
            m.read_bytes(store, buf_ptr, len)
        })
    }

    // ---- virtual-file staging ---------------------------------------------

    /// Stage bytes at a path inside the engine's virtual filesystem.
    pub fn file_write(&self, store: &mut Store<()>, path: &str, data: &[u8]) -> EngineResult<bool> {
        let ok = self.with_c_string(store, path, |m, store, path_ptr| {
            m.with_buffer(store, data.len(), |m, store, data_ptr| {
                m.write_bytes(store, data_ptr, data)?;
                Ok(m.file_write.call(
                    &mut *store,
                    (path_ptr as i32, data_ptr as i32, data.len() as i32),
                )?)
            })
        })?;
        Ok(ok != 0)
    }

    /// Read a file back out of the engine's virtual filesystem. The engine
    /// hands over a fresh allocation; it is freed as part of the read.
    pub fn file_read(&self, store: &mut Store<()>, path: &str) -> EngineResult<Option<Vec<u8>>> {
        self.with_c_string(store, path, |m, store, path_ptr| {
            m.with_buffer(store, 4, |m, store, len_out| {
                let data_ptr = m
                    .file_read
                    .call(&mut *store, (path_ptr as i32, len_out as i32))?;
                if data_ptr == 0 {
                    return Ok(None);
                }
                let len = m.read_u32(store, len_out)? as usize;
                let result = m.read_bytes(store, data_ptr as u32, len);
                let freed = m.free(store, data_ptr as u32);
                match (result, freed) {
                    (Ok(bytes), Ok(())) => Ok(Some(bytes)),
                    (Ok(_), Err(free_err)) => Err(free_err),
                    (Err(e), _) => Err(e),
                }
            })
        })
    }

    pub fn file_remove(&self, store: &mut Store<()>, path: &str) -> EngineResult<()> {
        self.with_c_string(store, path, |m, store, path_ptr| {
            m.file_remove.call(&mut *store, path_ptr as i32)?;
            Ok(())
        })
    }

    // ---- commands and units -----------------------------------------------

    /// Post a named command against a document. Callbacks produced by the
    /// command sit in the deferred queue until explicitly flushed.
    pub fn post_command(&self, store: &mut Store<()>, dh: u32, command: &str) -> EngineResult<()> {
        self.with_c_string(store, command, |m, store, cmd_ptr| {
            m.post_command.call(&mut *store, (dh as i32, cmd_ptr as i32))?;
            Ok(())
        })
    }

    /// Engine-reported native units per pixel (twips per pixel at the
    /// engine's working DPI).
    pub fn unit_ratio(&self, store: &mut Store<()>) -> EngineResult<f64> {
        Ok(self.unit_ratio.call(&mut *store, ())?)
    }
}

fn required<P, R>(
    store: &mut Store<()>,
    instance: &Instance,
    name: &str,
) -> EngineResult<TypedFunc<P, R>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    instance
        .get_typed_func::<P, R>(&mut *store, name)
        .map_err(|e| EngineError::AbiMismatch(format!("missing required export '{}': {}", name, e)))
}

fn out_of_bounds(start: usize, len: usize, memory_len: usize) -> EngineError {
    EngineError::Memory(format!(
        "access out of bounds: {:#x}+{} exceeds memory size {:#x}",
        start, len, memory_len
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::classify::{classify_diagnostic, DiagnosticClass};
    use crate::test_engine;

    fn marshaler(force_vtable: bool) -> (Store<()>, Instance, Marshaler) {
        let (mut store, instance) = test_engine::instantiate();
        let marshaler = Marshaler::new(&mut store, &instance, force_vtable).unwrap();
        (store, instance, marshaler)
    }

    fn alloc_balance(store: &mut Store<()>, instance: &Instance) -> i32 {
        let balance = instance
            .get_typed_func::<(), i32>(&mut *store, "eng_alloc_balance")
            .unwrap();
        balance.call(store, ()).unwrap()
    }

    #[test]
    fn probes_shims_by_default_and_vtable_on_request() {
        let (_, _, shim) = marshaler(false);
        assert_eq!(shim.dispatch_strategy(), "shim");
        let (_, _, vtable) = marshaler(true);
        assert_eq!(vtable.dispatch_strategy(), "vtable");
    }

    #[test]
    fn string_round_trip_including_utf8_and_empty() {
        let (mut store, _, m) = marshaler(false);
        for input in ["hello", "", "héllo wörld ✓", "päivää"] {
            let out = m
                .with_c_string(&mut store, input, |m, store, ptr| {
                    m.read_c_string(store, ptr)
                })
                .unwrap();
            assert_eq!(out, input);
        }
    }

    #[test]
    fn scoped_allocations_free_on_success_and_on_error() {
        let (mut store, instance, m) = marshaler(false);
        assert_eq!(alloc_balance(&mut store, &instance), 0);

        m.with_c_string(&mut store, "balanced", |_, _, _| Ok(()))
            .unwrap();
        assert_eq!(alloc_balance(&mut store, &instance), 0);

        let err = m
            .with_buffer(&mut store, 64, |_, _, _| {
                Err::<(), _>(EngineError::InvalidInput("injected".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert_eq!(alloc_balance(&mut store, &instance), 0);
    }

    #[test]
    fn engine_owned_strings_are_freed_after_reading() {
        let (mut store, instance, m) = marshaler(false);
        let eh = m.engine_init(&mut store, "/engine").unwrap();

        // a failed load parks a diagnostic; fetching it transfers ownership
        let handle = m.document_load(&mut store, eh, "/missing.txt").unwrap();
        assert_eq!(handle, 0);
        let diagnostic = m.last_error(&mut store, eh).unwrap().unwrap();
        assert!(diagnostic.contains("document not found"));
        assert_eq!(alloc_balance(&mut store, &instance), 0);

        // the slot is cleared by the read
        assert!(m.last_error(&mut store, eh).unwrap().is_none());
    }

    #[test]
    fn file_staging_round_trip_and_balance() {
        let (mut store, instance, m) = marshaler(false);
        let payload = b"\x00\x01 binary \xfe\xff".to_vec();

        assert!(m.file_write(&mut store, "/work/in.bin", &payload).unwrap());
        let back = m.file_read(&mut store, "/work/in.bin").unwrap().unwrap();
        assert_eq!(back, payload);

        m.file_remove(&mut store, "/work/in.bin").unwrap();
        assert!(m.file_read(&mut store, "/work/in.bin").unwrap().is_none());
        assert_eq!(alloc_balance(&mut store, &instance), 0);
    }

    #[test]
    fn views_stay_valid_across_forced_memory_growth() {
        let (mut store, instance, m) = marshaler(false);
        assert!(m.file_write(&mut store, "/grow.bin", b"before growth").unwrap());

        let grow = instance
            .get_typed_func::<i32, i32>(&mut store, "eng_grow_memory")
            .unwrap();
        assert!(grow.call(&mut store, 4).unwrap() > 0);

        // Reads go through a freshly acquired view, so data written before
        // the growth is still reachable.
        let back = m.file_read(&mut store, "/grow.bin").unwrap().unwrap();
        assert_eq!(back, b"before growth");
    }

    #[test]
    fn vtable_dispatch_drives_document_operations() {
        let (mut store, _, m) = marshaler(true);
        let eh = m.engine_init(&mut store, "/engine").unwrap();
        m.validate_engine_struct(&mut store, eh).unwrap();

        assert!(m.file_write(&mut store, "/doc.txt", b"content").unwrap());
        let dh = m.document_load(&mut store, eh, "/doc.txt").unwrap();
        assert_ne!(dh, 0);
        m.validate_struct_magic(&mut store, dh, ABI_OFFSETS.document_magic)
            .unwrap();

        assert_eq!(m.document_parts(&mut store, dh).unwrap(), 3);
        m.document_set_part(&mut store, dh, 2).unwrap();
        assert_eq!(m.document_part(&mut store, dh).unwrap(), 2);
        assert_eq!(m.document_size(&mut store, dh).unwrap(), (12240, 15840));

        let tile = m.paint_tile(&mut store, dh, 4, 4, 0, 0, 256, 256).unwrap();
        assert_eq!(tile.len(), 4 * 4 * 4);
        assert_eq!(tile[1], 1);

        m.document_destroy(&mut store, dh).unwrap();
    }

    #[test]
    fn corrupted_vtable_surfaces_a_corruption_class_error() {
        let (mut store, instance, m) = marshaler(true);
        let eh = m.engine_init(&mut store, "/engine").unwrap();
        assert!(m.file_write(&mut store, "/doc.txt", b"content").unwrap());
        let dh = m.document_load(&mut store, eh, "/doc.txt").unwrap();

        let corrupt = instance
            .get_typed_func::<(), ()>(&mut store, "eng_corrupt_vtable")
            .unwrap();
        corrupt.call(&mut store, ()).unwrap();

        let err = m.document_destroy(&mut store, dh).unwrap_err();
        assert_eq!(
            classify_diagnostic(&err.to_string()),
            DiagnosticClass::FatalCorruption
        );
    }

    #[test]
    fn magic_mismatch_is_an_abi_error_not_silence() {
        let (mut store, instance, m) = marshaler(true);
        let eh = m.engine_init(&mut store, "/engine").unwrap();
        m.validate_engine_struct(&mut store, eh).unwrap();

        let corrupt = instance
            .get_typed_func::<(), ()>(&mut store, "eng_corrupt_magic")
            .unwrap();
        corrupt.call(&mut store, ()).unwrap();

        let err = m.validate_engine_struct(&mut store, eh).unwrap_err();
        assert!(matches!(err, EngineError::AbiMismatch(_)));
    }

    #[test]
    fn shim_mode_skips_struct_validation() {
        let (mut store, _, m) = marshaler(false);
        let eh = m.engine_init(&mut store, "/engine").unwrap();
        // No offsets to validate against under shim dispatch.
        m.validate_engine_struct(&mut store, eh).unwrap();
    }

    #[test]
    fn unit_ratio_is_queried_from_the_engine() {
        let (mut store, _, m) = marshaler(false);
        assert_eq!(m.unit_ratio(&mut store).unwrap(), 15.0);
    }
}
