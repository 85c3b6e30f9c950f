// SPDX-License-Identifier: MIT

//! A fake document engine compiled from WAT, exercising the full ABI:
//! allocator with an outstanding-allocation counter, virtual filesystem,
//! named shims *and* vtable dispatch over `__indirect_function_table`,
//! callback queues with deferred flush, and corruption helpers.
//!
//! Layout: engine struct at 0x1000 (magic "ENG1", vtable ptr at +4,
//! last-error slot at +8), engine vtable at 0x1100, document vtable at
//! 0x1200, file table at 0x2000 (8 entries of name/data/len), staged and
//! delivered callback queues at 0x2100/0x2200, bump heap from 0x8000.
//! Documents are 28-byte structs: magic "DOC1", vtable ptr, parts=3,
//! part, type, width=12240, height=15840 (twips). `save_as` writes
//! `CONVERTED:<format>` to the target path, or fails via the last-error
//! slot when the format is `fail`.

use crate::config::EngineConfig;
use tempfile::NamedTempFile;
use wasmtime::{Instance, Linker, Module, Store};

pub(crate) const ENGINE_WAT: &str = r#"
(module
  (memory (export "memory") 16 256)
  (table (export "__indirect_function_table") 16 funcref)

  (global $heap (mut i32) (i32.const 0x8000))
  (global $allocs (mut i32) (i32.const 0))
  (global $staged (mut i32) (i32.const 0))
  (global $delivered (mut i32) (i32.const 0))
  (global $read_idx (mut i32) (i32.const 0))
  (global $cb_doc (mut i32) (i32.const 0))

  (data (i32.const 0x100) "load failed: document not found\00")
  (data (i32.const 0x140) "save failed: filter rejected\00")
  (data (i32.const 0x160) "fail\00")
  (data (i32.const 0x170) "CONVERTED:")
  (data (i32.const 0x1000) "\31\47\4e\45\00\11\00\00\00\00\00\00")
  (data (i32.const 0x1100) "\01\00\00\00\02\00\00\00\03\00\00\00")
  (data (i32.const 0x1200) "\04\00\00\00\05\00\00\00\06\00\00\00\07\00\00\00\08\00\00\00\09\00\00\00\0a\00\00\00\0b\00\00\00")

  (elem (i32.const 1)
    $doc_load $doc_load_opts $get_error $doc_destroy $doc_save_as
    $doc_parts $doc_part $doc_set_part $doc_type $doc_size $paint_tile)

  ;; ---- allocator ----------------------------------------------------------

  (func $alloc_raw (param $n i32) (result i32)
    (local $p i32)
    (local.set $p (global.get $heap))
    (global.set $heap
      (i32.add (global.get $heap)
        (i32.and (i32.add (local.get $n) (i32.const 3)) (i32.const -4))))
    (local.get $p))

  (func $malloc (export "eng_malloc") (param $n i32) (result i32)
    (global.set $allocs (i32.add (global.get $allocs) (i32.const 1)))
    (call $alloc_raw (local.get $n)))

  (func $free (export "eng_free") (param $p i32)
    (global.set $allocs (i32.sub (global.get $allocs) (i32.const 1))))

  (func $alloc_balance (export "eng_alloc_balance") (result i32)
    (global.get $allocs))

  ;; ---- string helpers -----------------------------------------------------

  (func $strlen (param $s i32) (result i32)
    (local $n i32)
    (block $done
      (loop $loop
        (br_if $done (i32.eqz (i32.load8_u (i32.add (local.get $s) (local.get $n)))))
        (local.set $n (i32.add (local.get $n) (i32.const 1)))
        (br $loop)))
    (local.get $n))

  (func $streq (param $a i32) (param $b i32) (result i32)
    (local $ca i32)
    (block $ne
      (loop $loop
        (local.set $ca (i32.load8_u (local.get $a)))
        (br_if $ne (i32.ne (local.get $ca) (i32.load8_u (local.get $b))))
        (if (i32.eqz (local.get $ca)) (then (return (i32.const 1))))
        (local.set $a (i32.add (local.get $a) (i32.const 1)))
        (local.set $b (i32.add (local.get $b) (i32.const 1)))
        (br $loop)))
    (i32.const 0))

  (func $memcpy (param $dst i32) (param $src i32) (param $n i32)
    (local $i i32)
    (block $done
      (loop $loop
        (br_if $done (i32.ge_u (local.get $i) (local.get $n)))
        (i32.store8 (i32.add (local.get $dst) (local.get $i))
                    (i32.load8_u (i32.add (local.get $src) (local.get $i))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $loop))))

  ;; host-owned copy, counted against the allocation balance
  (func $strdup (param $s i32) (result i32)
    (local $len i32)
    (local $p i32)
    (local.set $len (i32.add (call $strlen (local.get $s)) (i32.const 1)))
    (local.set $p (call $malloc (local.get $len)))
    (call $memcpy (local.get $p) (local.get $s) (local.get $len))
    (local.get $p))

  ;; engine-internal copy, not counted
  (func $strdup_raw (param $s i32) (result i32)
    (local $len i32)
    (local $p i32)
    (local.set $len (i32.add (call $strlen (local.get $s)) (i32.const 1)))
    (local.set $p (call $alloc_raw (local.get $len)))
    (call $memcpy (local.get $p) (local.get $s) (local.get $len))
    (local.get $p))

  (func $set_error (param $msg i32)
    (i32.store (i32.const 0x1008) (local.get $msg)))

  ;; ---- virtual filesystem -------------------------------------------------

  (func $file_find (param $path i32) (result i32)
    (local $i i32)
    (local $base i32)
    (local $name i32)
    (block $done
      (loop $loop
        (br_if $done (i32.ge_u (local.get $i) (i32.const 8)))
        (local.set $base (i32.add (i32.const 0x2000) (i32.mul (local.get $i) (i32.const 12))))
        (local.set $name (i32.load (local.get $base)))
        (if (local.get $name)
          (then
            (if (call $streq (local.get $name) (local.get $path))
              (then (return (local.get $base))))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $loop)))
    (i32.const 0))

  (func $file_slot (param $path i32) (result i32)
    (local $entry i32)
    (local $i i32)
    (local $base i32)
    (local.set $entry (call $file_find (local.get $path)))
    (if (local.get $entry) (then (return (local.get $entry))))
    (block $done
      (loop $loop
        (br_if $done (i32.ge_u (local.get $i) (i32.const 8)))
        (local.set $base (i32.add (i32.const 0x2000) (i32.mul (local.get $i) (i32.const 12))))
        (if (i32.eqz (i32.load (local.get $base)))
          (then
            (i32.store (local.get $base) (call $strdup_raw (local.get $path)))
            (return (local.get $base))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $loop)))
    (i32.const 0))

  (func $file_write (export "eng_file_write")
        (param $path i32) (param $data i32) (param $len i32) (result i32)
    (local $entry i32)
    (local $copy i32)
    (local.set $entry (call $file_slot (local.get $path)))
    (if (i32.eqz (local.get $entry)) (then (return (i32.const 0))))
    (local.set $copy (call $alloc_raw (local.get $len)))
    (call $memcpy (local.get $copy) (local.get $data) (local.get $len))
    (i32.store offset=4 (local.get $entry) (local.get $copy))
    (i32.store offset=8 (local.get $entry) (local.get $len))
    (i32.const 1))

  (func $file_read (export "eng_file_read")
        (param $path i32) (param $len_out i32) (result i32)
    (local $entry i32)
    (local $len i32)
    (local $p i32)
    (local.set $entry (call $file_find (local.get $path)))
    (if (i32.eqz (local.get $entry)) (then (return (i32.const 0))))
    (local.set $len (i32.load offset=8 (local.get $entry)))
    (local.set $p (call $malloc (local.get $len)))
    (call $memcpy (local.get $p) (i32.load offset=4 (local.get $entry)) (local.get $len))
    (i32.store (local.get $len_out) (local.get $len))
    (local.get $p))

  (func $file_remove (export "eng_file_remove") (param $path i32) (result i32)
    (local $entry i32)
    (local.set $entry (call $file_find (local.get $path)))
    (if (i32.eqz (local.get $entry)) (then (return (i32.const 0))))
    (i32.store (local.get $entry) (i32.const 0))
    (i32.const 1))

  ;; ---- engine lifecycle ---------------------------------------------------

  (func $init (export "eng_init") (param $install i32) (result i32)
    (i32.const 0x1000))

  (func $destroy (export "eng_destroy") (param $eh i32))

  (func $unit_ratio (export "eng_unit_ratio") (result f64)
    (f64.const 15))

  ;; ---- documents ----------------------------------------------------------

  (func $doc_load (export "eng_document_load")
        (param $eh i32) (param $path i32) (result i32)
    (local $d i32)
    (if (i32.eqz (call $file_find (local.get $path)))
      (then
        (call $set_error (i32.const 0x100))
        (return (i32.const 0))))
    (local.set $d (call $alloc_raw (i32.const 28)))
    (i32.store (local.get $d) (i32.const 0x444f4331))
    (i32.store offset=4 (local.get $d) (i32.const 0x1200))
    (i32.store offset=8 (local.get $d) (i32.const 3))
    (i32.store offset=12 (local.get $d) (i32.const 0))
    (i32.store offset=16 (local.get $d) (i32.const 0))
    (i32.store offset=20 (local.get $d) (i32.const 12240))
    (i32.store offset=24 (local.get $d) (i32.const 15840))
    (local.get $d))

  (func $doc_load_opts (export "eng_document_load_with_options")
        (param $eh i32) (param $path i32) (param $opts i32) (result i32)
    (call $doc_load (local.get $eh) (local.get $path)))

  (func $get_error (export "eng_get_error") (param $eh i32) (result i32)
    (local $msg i32)
    (local.set $msg (i32.load (i32.const 0x1008)))
    (if (i32.eqz (local.get $msg)) (then (return (i32.const 0))))
    (i32.store (i32.const 0x1008) (i32.const 0))
    (call $strdup (local.get $msg)))

  (func $doc_destroy (export "eng_document_destroy") (param $dh i32)
    (i32.store (local.get $dh) (i32.const 0)))

  (func $doc_save_as (export "eng_document_save_as")
        (param $dh i32) (param $url i32) (param $fmt i32) (param $opts i32) (result i32)
    (local $fmtlen i32)
    (local $len i32)
    (local $buf i32)
    (if (call $streq (local.get $fmt) (i32.const 0x160))
      (then
        (call $set_error (i32.const 0x140))
        (return (i32.const 0))))
    (local.set $fmtlen (call $strlen (local.get $fmt)))
    (local.set $len (i32.add (i32.const 10) (local.get $fmtlen)))
    (local.set $buf (call $alloc_raw (local.get $len)))
    (call $memcpy (local.get $buf) (i32.const 0x170) (i32.const 10))
    (call $memcpy (i32.add (local.get $buf) (i32.const 10)) (local.get $fmt) (local.get $fmtlen))
    (call $file_write (local.get $url) (local.get $buf) (local.get $len)))

  (func $doc_parts (export "eng_document_parts") (param $dh i32) (result i32)
    (i32.load offset=8 (local.get $dh)))

  (func $doc_part (export "eng_document_part") (param $dh i32) (result i32)
    (i32.load offset=12 (local.get $dh)))

  (func $doc_set_part (export "eng_document_set_part") (param $dh i32) (param $part i32)
    (i32.store offset=12 (local.get $dh) (local.get $part)))

  (func $doc_type (export "eng_document_type") (param $dh i32) (result i32)
    (i32.load offset=16 (local.get $dh)))

  (func $doc_size (export "eng_document_size")
        (param $dh i32) (param $w_out i32) (param $h_out i32)
    (i32.store (local.get $w_out) (i32.load offset=20 (local.get $dh)))
    (i32.store (local.get $h_out) (i32.load offset=24 (local.get $dh))))

  (func $paint_tile (export "eng_paint_tile")
        (param $dh i32) (param $buf i32) (param $cw i32) (param $ch i32)
        (param $tx i32) (param $ty i32) (param $tw i32) (param $th i32)
    (local $n i32)
    (local $i i32)
    (local.set $n (i32.mul (i32.mul (local.get $cw) (local.get $ch)) (i32.const 4)))
    (block $done
      (loop $loop
        (br_if $done (i32.ge_u (local.get $i) (local.get $n)))
        (i32.store8 (i32.add (local.get $buf) (local.get $i))
          (i32.and
            (i32.add (i32.add (local.get $i) (local.get $tx)) (local.get $ty))
            (i32.const 0xff)))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $loop))))

  ;; ---- callbacks ----------------------------------------------------------

  (func $cb_register (export "eng_register_callback") (param $dh i32)
    (global.set $cb_doc (local.get $dh)))

  (func $cb_unregister (export "eng_unregister_callback") (param $dh i32)
    (global.set $cb_doc (i32.const 0)))

  (func $cb_clear (export "eng_clear_callbacks")
    (global.set $staged (i32.const 0))
    (global.set $delivered (i32.const 0))
    (global.set $read_idx (i32.const 0)))

  ;; posting stages a STATE_CHANGED event; nothing is observable until flush
  (func $post_command (export "eng_post_command") (param $dh i32) (param $cmd i32)
    (local $slot i32)
    (if (i32.eqz (global.get $cb_doc)) (then (return)))
    (if (i32.ge_u (global.get $staged) (i32.const 16)) (then (return)))
    (local.set $slot (i32.add (i32.const 0x2100) (i32.mul (global.get $staged) (i32.const 8))))
    (i32.store (local.get $slot) (i32.const 2))
    (i32.store offset=4 (local.get $slot) (call $strdup_raw (local.get $cmd)))
    (global.set $staged (i32.add (global.get $staged) (i32.const 1))))

  (func $cb_flush (export "eng_flush_callbacks")
    (local $i i32)
    (local $src i32)
    (local $dst i32)
    (block $done
      (loop $loop
        (br_if $done (i32.ge_u (local.get $i) (global.get $staged)))
        (br_if $done (i32.ge_u (global.get $delivered) (i32.const 16)))
        (local.set $src (i32.add (i32.const 0x2100) (i32.mul (local.get $i) (i32.const 8))))
        (local.set $dst (i32.add (i32.const 0x2200) (i32.mul (global.get $delivered) (i32.const 8))))
        (i32.store (local.get $dst) (i32.load (local.get $src)))
        (i32.store offset=4 (local.get $dst) (i32.load offset=4 (local.get $src)))
        (global.set $delivered (i32.add (global.get $delivered) (i32.const 1)))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $loop)))
    (global.set $staged (i32.const 0)))

  (func $cb_poll (export "eng_poll_callback") (param $type_out i32) (result i32)
    (local $slot i32)
    (if (i32.ge_u (global.get $read_idx) (global.get $delivered))
      (then
        (i32.store (local.get $type_out) (i32.const -1))
        (return (i32.const 0))))
    (local.set $slot (i32.add (i32.const 0x2200) (i32.mul (global.get $read_idx) (i32.const 8))))
    (global.set $read_idx (i32.add (global.get $read_idx) (i32.const 1)))
    (i32.store (local.get $type_out) (i32.load (local.get $slot)))
    (call $strdup (i32.load offset=4 (local.get $slot))))

  ;; ---- fault helpers ------------------------------------------------------

  (func (export "eng_grow_memory") (param $pages i32) (result i32)
    (memory.grow (local.get $pages)))

  (func (export "eng_corrupt_vtable")
    (i32.store (i32.const 0x1200) (i32.const 0)))

  (func (export "eng_corrupt_magic")
    (i32.store (i32.const 0x1000) (i32.const 0xdead)))
)
"#;

/// Compile the fake engine to a temp `.wasm` file.
pub(crate) fn write_engine_module() -> NamedTempFile {
    let binary = wat::parse_str(ENGINE_WAT).expect("fake engine wat must assemble");
    let file = NamedTempFile::new().expect("temp module file");
    std::fs::write(file.path(), binary).expect("write module");
    file
}

/// Config pointing at a freshly written fake engine module. The temp file
/// must outlive the config's use.
pub(crate) fn test_config(force_vtable: bool) -> (NamedTempFile, EngineConfig) {
    let module = write_engine_module();
    let mut config = EngineConfig {
        module_path: module.path().to_path_buf(),
        force_vtable,
        ..EngineConfig::default()
    };
    config.resilience.init_backoff_ms = 1;
    (module, config)
}

/// Config with no usable module, for tests that never boot a real session.
pub(crate) fn bare_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.resilience.init_backoff_ms = 1;
    config
}

/// Raw store + instance of the fake engine, for marshaling-level tests.
pub(crate) fn instantiate() -> (Store<()>, Instance) {
    let engine = crate::marshal::create_engine().expect("engine");
    let binary = wat::parse_str(ENGINE_WAT).expect("fake engine wat must assemble");
    let module = Module::new(&engine, binary).expect("module");
    let mut store = Store::new(&engine, ());
    store.set_fuel(crate::config::consts::DEFAULT_FUEL_LEVEL).expect("fuel");
    let linker: Linker<()> = Linker::new(&engine);
    let instance = linker.instantiate(&mut store, &module).expect("instantiate");
    (store, instance)
}
