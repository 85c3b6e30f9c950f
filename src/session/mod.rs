// SPDX-License-Identifier: MIT

//! Engine Session: owns one engine instance and its open documents.
//!
//! A session is a synchronous façade over the [`Marshaler`]. It is the only
//! type that holds an [`EngineHandle`], and exactly one session exists per
//! execution context (the host context for the same-context tier, the worker
//! thread or child process for the isolated tiers). Sessions are not `Sync`
//! and are never shared across threads; the engine is not proven safe for
//! concurrent operations on one handle.

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::marshal::callbacks::CallbackEvent;
use crate::marshal::{
    load_engine_module, parse_state_changes, CallbackChannel, Marshaler,
};
use crate::observability::messages::session::{
    ConversionCompleted, DocumentLoadFailed, DocumentLoaded, SessionClosed,
};
use crate::tiers::{ConvertOptions, ConvertResult, RenderedPage};
use std::collections::HashMap;
use std::time::Instant;
use wasmtime::{Linker, Store};

/// Opaque engine instance handle. 0 is the universal null sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineHandle(pub u32);

impl EngineHandle {
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Opaque document handle, scoped to one engine handle. The engine performs
/// no automatic collection: an undestroyed handle leaks engine-internal
/// resources (cached fonts, views) until the context exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentHandle(pub u32);

impl DocumentHandle {
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Document class reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Text,
    Spreadsheet,
    Presentation,
    Drawing,
    Other,
}

impl DocumentType {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => DocumentType::Text,
            1 => DocumentType::Spreadsheet,
            2 => DocumentType::Presentation,
            3 => DocumentType::Drawing,
            _ => DocumentType::Other,
        }
    }
}

/// MIME type for an output format name.
pub fn mime_type_for(format: &str) -> &'static str {
    match format {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "txt" => "text/plain",
        "html" => "text/html",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "odt" => "application/vnd.oasis.opendocument.text",
        "ods" => "application/vnd.oasis.opendocument.spreadsheet",
        "odp" => "application/vnd.oasis.opendocument.presentation",
        "csv" => "text/csv",
        "rtf" => "application/rtf",
        _ => "application/octet-stream",
    }
}

pub struct EngineSession {
    store: Store<()>,
    marshaler: Marshaler,
    callbacks: CallbackChannel,
    engine_handle: EngineHandle,
    open_docs: Vec<DocumentHandle>,
    fuel_level: u64,
    closed: bool,
}

impl EngineSession {
    /// Boot an engine instance: compile the module, instantiate it with no
    /// system capabilities, resolve the marshaler, and run the instance hook
    /// with the configured install path.
    pub fn boot(config: &EngineConfig) -> EngineResult<Self> {
        let loaded = load_engine_module(config)?;
        let mut store = Store::new(&loaded.engine, ());
        store.set_fuel(config.fuel_level)?;

        // No WASI, no host imports: the engine resolves paths in its own
        // virtual filesystem and documents cross as staged bytes.
        let linker: Linker<()> = Linker::new(&loaded.engine);
        let instance = linker.instantiate(&mut store, &loaded.module)?;

        let marshaler = Marshaler::new(&mut store, &instance, config.force_vtable)?;
        let callbacks = CallbackChannel::new(&mut store, &instance)?;

        let handle = marshaler.engine_init(&mut store, &config.install_path)?;
        if handle == 0 {
            return Err(EngineError::WasmNotInitialized(
                "engine instance hook returned a null handle".to_string(),
            ));
        }
        marshaler.validate_engine_struct(&mut store, handle)?;

        Ok(Self {
            store,
            marshaler,
            callbacks,
            engine_handle: EngineHandle(handle),
            open_docs: Vec::new(),
            fuel_level: config.fuel_level,
            closed: false,
        })
    }

    pub fn dispatch_strategy(&self) -> &'static str {
        self.marshaler.dispatch_strategy()
    }

    fn refuel(&mut self) -> EngineResult<()> {
        self.store.set_fuel(self.fuel_level)?;
        Ok(())
    }

    // ---- document lifecycle -----------------------------------------------

    /// Load a document from a path in the engine's virtual filesystem.
    pub fn load(&mut self, path: &str) -> EngineResult<DocumentHandle> {
        self.refuel()?;
        let eh = self.engine_handle.0;
        let handle = self.marshaler.document_load(&mut self.store, eh, path)?;
        self.surface_load(path, handle)
    }

    /// Load with an engine options string (JSON), e.g. for passwords.
    pub fn load_with_options(&mut self, path: &str, options: &str) -> EngineResult<DocumentHandle> {
        self.refuel()?;
        let eh = self.engine_handle.0;
        let handle =
            self.marshaler
                .document_load_with_options(&mut self.store, eh, path, options)?;
        self.surface_load(path, handle)
    }

    fn surface_load(&mut self, path: &str, handle: u32) -> EngineResult<DocumentHandle> {
        if handle == 0 {
            let diagnostic = self
                .marshaler
                .last_error(&mut self.store, self.engine_handle.0)?
                .unwrap_or_else(|| "engine reported no diagnostic".to_string());
            tracing::error!(
                "{}",
                DocumentLoadFailed {
                    path,
                    diagnostic: &diagnostic,
                }
            );
            let lowered = diagnostic.to_ascii_lowercase();
            if lowered.contains("password") {
                return Err(EngineError::PasswordRequired);
            }
            if lowered.contains("corrupt") {
                return Err(EngineError::CorruptedDocument(diagnostic));
            }
            return Err(EngineError::LoadFailed(diagnostic));
        }
        let doc = DocumentHandle(handle);
        self.open_docs.push(doc);
        tracing::debug!("{}", DocumentLoaded { path, handle });
        Ok(doc)
    }

    /// Save a loaded document to a path in the virtual filesystem.
    pub fn save_as(
        &mut self,
        doc: DocumentHandle,
        url: &str,
        format: &str,
        filter_options: &str,
    ) -> EngineResult<()> {
        self.refuel()?;
        let ok =
            self.marshaler
                .document_save_as(&mut self.store, doc.0, url, format, filter_options)?;
        if !ok {
            let diagnostic = self
                .marshaler
                .last_error(&mut self.store, self.engine_handle.0)?
                .unwrap_or_else(|| "engine reported no diagnostic".to_string());
            return Err(EngineError::ConversionFailed(diagnostic));
        }
        Ok(())
    }

    /// Destroy a document handle. Idempotent no-op on the null handle.
    pub fn destroy_document(&mut self, doc: DocumentHandle) -> EngineResult<()> {
        if doc.is_null() {
            return Ok(());
        }
        if self.callbacks.registered_document() == Some(doc.0) {
            // Callbacks must come off before the handle they reference dies.
            let _ = self.callbacks.unregister(&mut self.store, doc.0);
        }
        self.refuel()?;
        self.marshaler.document_destroy(&mut self.store, doc.0)?;
        self.open_docs.retain(|open| *open != doc);
        Ok(())
    }

    // ---- document queries --------------------------------------------------

    pub fn get_parts(&mut self, doc: DocumentHandle) -> EngineResult<u32> {
        self.refuel()?;
        self.marshaler.document_parts(&mut self.store, doc.0)
    }

    pub fn get_part(&mut self, doc: DocumentHandle) -> EngineResult<u32> {
        self.refuel()?;
        self.marshaler.document_part(&mut self.store, doc.0)
    }

    pub fn set_part(&mut self, doc: DocumentHandle, part: u32) -> EngineResult<()> {
        self.refuel()?;
        self.marshaler.document_set_part(&mut self.store, doc.0, part)
    }

    pub fn get_document_type(&mut self, doc: DocumentHandle) -> EngineResult<DocumentType> {
        self.refuel()?;
        let code = self.marshaler.document_type(&mut self.store, doc.0)?;
        Ok(DocumentType::from_code(code))
    }

    /// Size in the engine's native unit (twips).
    pub fn get_document_size(&mut self, doc: DocumentHandle) -> EngineResult<(u32, u32)> {
        self.refuel()?;
        self.marshaler.document_size(&mut self.store, doc.0)
    }

    /// Engine-reported native units per pixel.
    pub fn unit_ratio(&mut self) -> EngineResult<f64> {
        self.marshaler.unit_ratio(&mut self.store)
    }

    /// Render a tile of a document part into an RGBA buffer of
    /// `width_px * height_px * 4` bytes. Position and size are native units.
    pub fn render_tile(
        &mut self,
        doc: DocumentHandle,
        width_px: u32,
        height_px: u32,
        native_x: u32,
        native_y: u32,
        native_width: u32,
        native_height: u32,
    ) -> EngineResult<Vec<u8>> {
        self.refuel()?;
        self.marshaler.paint_tile(
            &mut self.store,
            doc.0,
            width_px,
            height_px,
            native_x,
            native_y,
            native_width,
            native_height,
        )
    }

    // ---- callbacks ---------------------------------------------------------

    pub fn register_callbacks(&mut self, doc: DocumentHandle) -> EngineResult<()> {
        self.callbacks.register(&mut self.store, doc.0)
    }

    pub fn unregister_callbacks(&mut self, doc: DocumentHandle) -> EngineResult<()> {
        self.callbacks.unregister(&mut self.store, doc.0)
    }

    pub fn callbacks_registered(&self) -> bool {
        self.callbacks.is_registered()
    }

    pub fn clear_callbacks(&mut self) -> EngineResult<()> {
        self.callbacks.clear(&mut self.store)
    }

    pub fn flush_callbacks(&mut self) -> EngineResult<()> {
        self.callbacks.flush(&mut self.store)
    }

    pub fn poll_callback(&mut self) -> EngineResult<Option<CallbackEvent>> {
        self.callbacks.poll(&mut self.store, &self.marshaler)
    }

    pub fn drain_callbacks(&mut self) -> EngineResult<Vec<CallbackEvent>> {
        self.callbacks.drain(&mut self.store, &self.marshaler)
    }

    pub fn post_command(&mut self, doc: DocumentHandle, command: &str) -> EngineResult<()> {
        self.refuel()?;
        self.marshaler.post_command(&mut self.store, doc.0, command)
    }

    /// Full state-observation protocol for one command:
    /// clear → post → flush → poll-all → parse.
    pub fn observe_command(
        &mut self,
        doc: DocumentHandle,
        command: &str,
    ) -> EngineResult<HashMap<String, String>> {
        self.clear_callbacks()?;
        self.post_command(doc, command)?;
        self.flush_callbacks()?;
        let events = self.drain_callbacks()?;
        Ok(parse_state_changes(&events))
    }

    // ---- virtual-file staging ----------------------------------------------

    pub fn stage_file(&mut self, path: &str, bytes: &[u8]) -> EngineResult<()> {
        self.refuel()?;
        if !self.marshaler.file_write(&mut self.store, path, bytes)? {
            return Err(EngineError::Memory(format!(
                "virtual filesystem refused to stage '{}'",
                path
            )));
        }
        Ok(())
    }

    pub fn read_file(&mut self, path: &str) -> EngineResult<Option<Vec<u8>>> {
        self.refuel()?;
        self.marshaler.file_read(&mut self.store, path)
    }

    pub fn remove_file(&mut self, path: &str) -> EngineResult<()> {
        self.refuel()?;
        self.marshaler.file_remove(&mut self.store, path)
    }

    // ---- whole-document operations -----------------------------------------

    /// Convert a document: stage → load → save-as → read back → destroy.
    pub fn convert_bytes(
        &mut self,
        bytes: &[u8],
        options: &ConvertOptions,
    ) -> EngineResult<ConvertResult> {
        if bytes.is_empty() {
            return Err(EngineError::InvalidInput("empty document payload".to_string()));
        }
        let started = Instant::now();
        let input_ext = options.input_format.as_deref().unwrap_or("bin");
        let input_path = format!("/work/input.{}", input_ext);
        let output_path = format!("/work/output.{}", options.output_format);

        self.stage_file(&input_path, bytes)?;
        let result = self.convert_staged(&input_path, &output_path, options, started);

        // Best-effort cleanup; the conversion result wins over unstaging.
        let _ = self.remove_file(&input_path);
        let _ = self.remove_file(&output_path);
        result
    }

    fn convert_staged(
        &mut self,
        input_path: &str,
        output_path: &str,
        options: &ConvertOptions,
        started: Instant,
    ) -> EngineResult<ConvertResult> {
        let doc = self.load_for(input_path, options)?;
        let result = (|| {
            self.save_as(
                doc,
                output_path,
                &options.output_format,
                options.filter_options.as_deref().unwrap_or(""),
            )?;
            let output = self.read_file(output_path)?.unwrap_or_default();
            if output.is_empty() {
                return Err(EngineError::ConversionFailed(
                    "conversion produced no output".to_string(),
                ));
            }
            let duration_ms = started.elapsed().as_millis() as u64;
            tracing::info!(
                "{}",
                ConversionCompleted {
                    output_format: &options.output_format,
                    output_bytes: output.len(),
                    duration_ms,
                }
            );
            Ok(ConvertResult {
                mime_type: mime_type_for(&options.output_format).to_string(),
                filename: format!("document.{}", options.output_format),
                duration_ms,
                bytes: output,
            })
        })();
        let _ = self.destroy_document(doc);
        result
    }

    fn load_for(&mut self, path: &str, options: &ConvertOptions) -> EngineResult<DocumentHandle> {
        match &options.password {
            Some(password) => {
                let load_options = serde_json::json!({ "password": password }).to_string();
                self.load_with_options(path, &load_options)
            }
            None => self.load(path),
        }
    }

    /// Number of parts (pages/sheets/slides) in a document payload.
    pub fn page_count(&mut self, bytes: &[u8], options: &ConvertOptions) -> EngineResult<u32> {
        if bytes.is_empty() {
            return Err(EngineError::InvalidInput("empty document payload".to_string()));
        }
        let input_ext = options.input_format.as_deref().unwrap_or("bin");
        let input_path = format!("/work/input.{}", input_ext);
        self.stage_file(&input_path, bytes)?;
        let result = (|| {
            let doc = self.load_for(&input_path, options)?;
            let parts = self.get_parts(doc);
            let _ = self.destroy_document(doc);
            parts
        })();
        let _ = self.remove_file(&input_path);
        result
    }

    /// Render one part of a document payload to RGBA pixels. A missing
    /// height is derived from the part's native aspect ratio.
    pub fn render_page_bytes(
        &mut self,
        bytes: &[u8],
        options: &ConvertOptions,
        page: u32,
        width_px: u32,
        height_px: Option<u32>,
    ) -> EngineResult<RenderedPage> {
        if bytes.is_empty() {
            return Err(EngineError::InvalidInput("empty document payload".to_string()));
        }
        if width_px == 0 {
            return Err(EngineError::InvalidInput("render width must be non-zero".to_string()));
        }
        let input_ext = options.input_format.as_deref().unwrap_or("bin");
        let input_path = format!("/work/input.{}", input_ext);
        self.stage_file(&input_path, bytes)?;
        let result = (|| {
            let doc = self.load_for(&input_path, options)?;
            let rendered = (|| {
                let parts = self.get_parts(doc)?;
                if page >= parts {
                    return Err(EngineError::InvalidInput(format!(
                        "page {} out of range ({} part(s))",
                        page, parts
                    )));
                }
                self.set_part(doc, page)?;
                let (native_w, native_h) = self.get_document_size(doc)?;
                let height_px = match height_px {
                    Some(h) if h > 0 => h,
                    _ => {
                        let derived =
                            (width_px as u64 * native_h as u64) / native_w.max(1) as u64;
                        u32::try_from(derived.max(1)).map_err(|_| {
                            EngineError::InvalidInput(format!(
                                "derived render height {} exceeds the pixel range",
                                derived
                            ))
                        })?
                    }
                };
                let pixels = self.render_tile(doc, width_px, height_px, 0, 0, native_w, native_h)?;
                Ok(RenderedPage {
                    pixels,
                    width: width_px,
                    height: height_px,
                })
            })();
            let _ = self.destroy_document(doc);
            rendered
        })();
        let _ = self.remove_file(&input_path);
        result
    }

    // ---- teardown ----------------------------------------------------------

    /// Tear the session down in the required order: callbacks off, open
    /// documents destroyed, engine handle destroyed. Idempotent.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let open = std::mem::take(&mut self.open_docs);
        if let Some(dh) = self.callbacks.registered_document() {
            let _ = self.callbacks.unregister(&mut self.store, dh);
        }
        for doc in &open {
            let _ = self.marshaler.document_destroy(&mut self.store, doc.0);
        }
        let _ = self
            .marshaler
            .engine_destroy(&mut self.store, self.engine_handle.0);

        tracing::debug!(
            "{}",
            SessionClosed {
                open_documents: open.len(),
            }
        );
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
