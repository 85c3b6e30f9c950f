// SPDX-License-Identifier: MIT

//! Tier B: the engine session runs on a dedicated OS thread.
//!
//! The wasmtime store is owned by the worker thread; the host side speaks
//! request/response envelopes over channels, correlated through the pending
//! table. A wedged engine call wedges the worker thread, not the async
//! runtime: the awaiting caller times out, the link is dropped, and the next
//! call spawns a fresh worker (the stuck thread is abandoned, its sender is
//! gone, and it exits if it ever comes back).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::config::EngineConfig;
use crate::errors::classify::{classify_diagnostic, DiagnosticClass};
use crate::errors::{EngineError, EngineResult};
use crate::observability::messages::tier::{
    CorruptionDetected, InitRetry, WorkerReady, WorkerRestarted,
};
use crate::session::EngineSession;
use crate::tiers::pending::PendingRequests;
use crate::tiers::protocol::{
    decode_reply, ConvertPayload, ConvertReply, PageCountPayload, PageCountReply,
    RenderPagePayload, RenderPageReply, RequestKind, WorkerRequest, WorkerResponse,
};
use crate::tiers::{worker, ConvertOptions, ConvertResult, DocumentEngine, RenderedPage, TierState};

/// Worker-side request handler, one per spawned worker thread.
pub(crate) type WorkerHandler = Box<dyn FnMut(WorkerRequest) -> WorkerResponse + Send>;

/// Builds a handler on the worker thread. The seam the tests inject faults
/// through; production uses [`engine_handler`].
pub(crate) type HandlerFactory = Arc<dyn Fn() -> EngineResult<WorkerHandler> + Send + Sync>;

fn engine_handler(config: EngineConfig) -> HandlerFactory {
    Arc::new(move || {
        let mut session = EngineSession::boot(&config)?;
        Ok(Box::new(move |request| worker::handle_request(&mut session, request)) as WorkerHandler)
    })
}

struct WorkerLink {
    tx: std::sync::mpsc::Sender<WorkerRequest>,
}

pub struct ThreadTier {
    config: EngineConfig,
    factory: HandlerFactory,
    pending: Arc<PendingRequests>,
    state: Mutex<TierState>,
    link: Mutex<Option<WorkerLink>>,
    restarts: AtomicU32,
    // Bumped on every spawn so a dead worker's dispatcher cannot reject
    // requests that belong to its replacement.
    generation: Arc<AtomicU32>,
}

impl ThreadTier {
    pub fn new(config: EngineConfig) -> Self {
        let factory = engine_handler(config.clone());
        Self::with_factory(config, factory)
    }

    pub(crate) fn with_factory(config: EngineConfig, factory: HandlerFactory) -> Self {
        Self {
            config,
            factory,
            pending: Arc::new(PendingRequests::new()),
            state: Mutex::new(TierState::Uninitialized),
            link: Mutex::new(None),
            restarts: AtomicU32::new(0),
            generation: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Worker restarts after the first boot. Test hook.
    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Spawn a worker thread, wait for its handler to come up, and wire its
    /// responses into the pending table.
    async fn spawn_worker(&self) -> EngineResult<WorkerLink> {
        let (tx, rx) = std::sync::mpsc::channel::<WorkerRequest>();
        let (response_tx, mut response_rx) =
            tokio::sync::mpsc::unbounded_channel::<WorkerResponse>();
        let (boot_tx, boot_rx) = oneshot::channel::<EngineResult<()>>();
        let factory = self.factory.clone();

        std::thread::Builder::new()
            .name("engine-worker".to_string())
            .spawn(move || {
                let mut handler = match factory() {
                    Ok(handler) => {
                        let _ = boot_tx.send(Ok(()));
                        handler
                    }
                    Err(e) => {
                        let _ = boot_tx.send(Err(e));
                        return;
                    }
                };
                while let Ok(request) = rx.recv() {
                    if request.kind == RequestKind::Shutdown {
                        break;
                    }
                    let response = handler(request);
                    if response_tx.send(response).is_err() {
                        break;
                    }
                }
            })?;

        let boot = tokio::time::timeout(self.config.init_timeout(), boot_rx)
            .await
            .map_err(|_| EngineError::Timeout(self.config.init_timeout()))?
            .map_err(|_| {
                EngineError::Transport("worker thread died during boot".to_string())
            })?;
        boot?;

        let pending = self.pending.clone();
        let generation = self.generation.clone();
        let spawned_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(async move {
            while let Some(response) = response_rx.recv().await {
                let id = response.id.clone();
                pending.complete(&id, response.into_result());
            }
            if generation.load(Ordering::SeqCst) == spawned_generation {
                pending.fail_all("engine worker thread exited");
            }
        });

        tracing::info!("{}", WorkerReady { tier: "thread" });
        Ok(WorkerLink { tx })
    }

    async fn ensure_ready(&self) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        match *state {
            TierState::Ready => return Ok(()),
            TierState::Destroyed => {
                return Err(EngineError::WasmNotInitialized(
                    "tier has been destroyed".to_string(),
                ))
            }
            TierState::Corrupted => {
                self.restarts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "{}",
                    WorkerRestarted {
                        tier: "thread",
                        reason: "previous worker marked corrupted",
                    }
                );
            }
            _ => {}
        }
        *state = TierState::Initializing;

        let max_retries = self.config.resilience.max_init_retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_retries {
            match self.spawn_worker().await {
                Ok(link) => {
                    *self.link.lock().await = Some(link);
                    *state = TierState::Ready;
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    let backoff = self.config.init_backoff() * attempt;
                    tracing::warn!(
                        "{}",
                        InitRetry {
                            attempt,
                            max_retries,
                            backoff_ms: backoff.as_millis() as u64,
                            error: &last_error,
                        }
                    );
                    if attempt < max_retries {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        *state = TierState::Uninitialized;
        Err(EngineError::WasmNotInitialized(format!(
            "worker thread failed to boot after {} attempt(s): {}",
            max_retries, last_error
        )))
    }

    /// Tear the link down and mark the tier corrupted; the next call
    /// respawns. In-flight requests are rejected en masse.
    async fn mark_corrupted(&self, diagnostic: &str) {
        tracing::error!(
            "{}",
            CorruptionDetected {
                tier: "thread",
                diagnostic,
            }
        );
        *self.link.lock().await = None;
        self.pending.fail_all(diagnostic);
        let mut state = self.state.lock().await;
        if *state != TierState::Destroyed {
            *state = TierState::Corrupted;
        }
    }

    async fn request<P: serde::Serialize + Sync>(
        &self,
        kind: RequestKind,
        payload: &P,
    ) -> EngineResult<Value> {
        self.ensure_ready().await?;

        let id = self.pending.next_id();
        let request = WorkerRequest::new(kind, id.clone(), payload)?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let sent = {
            let link = self.link.lock().await;
            match link.as_ref() {
                Some(link) => link.tx.send(request).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.pending.remove(&id);
            self.mark_corrupted("worker channel closed").await;
            return Err(EngineError::Transport(
                "worker channel closed".to_string(),
            ));
        }

        match tokio::time::timeout(self.config.convert_timeout(), rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(failure))) => {
                let diagnostic = failure.to_string();
                if classify_diagnostic(&diagnostic) == DiagnosticClass::FatalCorruption {
                    self.mark_corrupted(&diagnostic).await;
                    Err(EngineError::Memory(diagnostic))
                } else {
                    // The worker classed this error; resurface the variant
                    // the same-context tier would have produced.
                    Err(failure.into_error())
                }
            }
            Ok(Err(_)) => {
                // Sender dropped without a response: the dispatcher already
                // rejected the table when the worker died.
                self.mark_corrupted("worker exited mid-request").await;
                Err(EngineError::Transport(
                    "worker exited mid-request".to_string(),
                ))
            }
            Err(_) => {
                self.pending.remove(&id);
                self.mark_corrupted("request timed out; abandoning worker").await;
                Err(EngineError::Timeout(self.config.convert_timeout()))
            }
        }
    }
}

#[async_trait]
impl DocumentEngine for ThreadTier {
    async fn initialize(&self) -> EngineResult<()> {
        self.ensure_ready().await
    }

    async fn destroy(&self) -> EngineResult<()> {
        self.pending.fail_all("tier destroyed");
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            let _ = link.tx.send(WorkerRequest::shutdown(String::new()));
        }
        *self.state.lock().await = TierState::Destroyed;
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        *self.state.lock().await == TierState::Ready
    }

    async fn convert(
        &self,
        document: &[u8],
        options: ConvertOptions,
    ) -> EngineResult<ConvertResult> {
        let payload = ConvertPayload {
            document: document.to_vec(),
            output_format: options.output_format,
            input_format: options.input_format,
            password: options.password,
            filter_options: options.filter_options,
        };
        let value = self.request(RequestKind::Convert, &payload).await?;
        let reply: ConvertReply = decode_reply(value)?;
        Ok(ConvertResult {
            bytes: reply.document,
            mime_type: reply.mime_type,
            filename: reply.filename,
            duration_ms: reply.duration_ms,
        })
    }

    async fn page_count(&self, document: &[u8], options: ConvertOptions) -> EngineResult<u32> {
        let payload = PageCountPayload {
            document: document.to_vec(),
            input_format: options.input_format,
            password: options.password,
        };
        let value = self.request(RequestKind::PageCount, &payload).await?;
        let reply: PageCountReply = decode_reply(value)?;
        Ok(reply.pages)
    }

    async fn render_page(
        &self,
        document: &[u8],
        options: ConvertOptions,
        page: u32,
        width: u32,
        height: Option<u32>,
    ) -> EngineResult<RenderedPage> {
        let payload = RenderPagePayload {
            document: document.to_vec(),
            input_format: options.input_format,
            password: options.password,
            page,
            width,
            height,
        };
        let value = self.request(RequestKind::RenderPage, &payload).await?;
        let reply: RenderPageReply = decode_reply(value)?;
        Ok(RenderedPage {
            pixels: reply.pixels,
            width: reply.width,
            height: reply.height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_engine;
    use crate::tiers::protocol::WireError;
    use std::sync::atomic::AtomicUsize;

    fn reply_pages(pages: u32) -> Value {
        serde_json::to_value(PageCountReply { pages }).unwrap()
    }

    /// Factory whose workers answer every request with a fixed closure.
    fn scripted_factory(
        boots: Arc<AtomicUsize>,
        respond: impl Fn(WorkerRequest) -> WorkerResponse + Send + Sync + Clone + 'static,
    ) -> HandlerFactory {
        Arc::new(move || {
            boots.fetch_add(1, Ordering::Relaxed);
            let respond = respond.clone();
            Ok(Box::new(move |request| respond(request)) as WorkerHandler)
        })
    }

    #[tokio::test]
    async fn responses_correlate_to_requests() {
        let boots = Arc::new(AtomicUsize::new(0));
        let factory = scripted_factory(boots.clone(), |request| {
            WorkerResponse::ok(request.id, reply_pages(7))
        });
        let tier = Arc::new(ThreadTier::with_factory(
            test_engine::bare_config(),
            factory,
        ));
        tier.initialize().await.unwrap();

        let a = tokio::spawn({
            let tier = tier.clone();
            async move { tier.page_count(b"a", ConvertOptions::default()).await }
        });
        let b = tokio::spawn({
            let tier = tier.clone();
            async move { tier.page_count(b"b", ConvertOptions::default()).await }
        });
        assert_eq!(a.await.unwrap().unwrap(), 7);
        assert_eq!(b.await.unwrap().unwrap(), 7);
        assert_eq!(tier.pending_len(), 0);
        assert_eq!(boots.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn corruption_diagnostic_restarts_worker_on_next_call() {
        let boots = Arc::new(AtomicUsize::new(0));
        let marker = Arc::new(AtomicUsize::new(0));
        let factory = scripted_factory(boots.clone(), {
            let marker = marker.clone();
            move |request| {
                if marker.fetch_add(1, Ordering::Relaxed) == 0 {
                    WorkerResponse::failure(
                        request.id,
                        WireError::Internal {
                            message: "memory access out of bounds".to_string(),
                        },
                    )
                } else {
                    WorkerResponse::ok(request.id, reply_pages(3))
                }
            }
        });
        let tier = ThreadTier::with_factory(test_engine::bare_config(), factory);
        tier.initialize().await.unwrap();

        let err = tier
            .page_count(b"doc", ConvertOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Memory(_)));
        assert!(!tier.is_ready().await);

        // Next call respawns the worker and succeeds.
        let pages = tier.page_count(b"doc", ConvertOptions::default()).await.unwrap();
        assert_eq!(pages, 3);
        assert_eq!(boots.load(Ordering::Relaxed), 2);
        assert_eq!(tier.restart_count(), 1);
    }

    #[tokio::test]
    async fn worker_error_types_survive_the_wire() {
        let boots = Arc::new(AtomicUsize::new(0));
        let factory = scripted_factory(boots.clone(), |request| {
            WorkerResponse::failure(
                request.id,
                WireError::InvalidInput {
                    message: "empty document payload".to_string(),
                },
            )
        });
        let tier = ThreadTier::with_factory(test_engine::bare_config(), factory);
        tier.initialize().await.unwrap();

        let err = tier
            .page_count(b"doc", ConvertOptions::default())
            .await
            .unwrap_err();
        match err {
            EngineError::InvalidInput(message) => assert_eq!(message, "empty document payload"),
            other => panic!("unexpected error: {other}"),
        }

        // A caller-class error does not tear the worker down.
        assert!(tier.is_ready().await);
        assert_eq!(tier.restart_count(), 0);
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry_and_abandons_worker() {
        let boots = Arc::new(AtomicUsize::new(0));
        let factory = scripted_factory(boots.clone(), |request| {
            std::thread::sleep(std::time::Duration::from_millis(200));
            WorkerResponse::ok(request.id, reply_pages(1))
        });
        let mut config = test_engine::bare_config();
        config.convert_timeout_secs = 0;
        let tier = ThreadTier::with_factory(config, factory);
        tier.initialize().await.unwrap();

        let err = tier
            .page_count(b"doc", ConvertOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
        assert_eq!(tier.pending_len(), 0);
        assert!(!tier.is_ready().await);
    }

    #[tokio::test]
    async fn failed_boot_is_terminal_after_retries() {
        let boots = Arc::new(AtomicUsize::new(0));
        let factory: HandlerFactory = Arc::new({
            let boots = boots.clone();
            move || {
                boots.fetch_add(1, Ordering::Relaxed);
                Err(EngineError::LoadFailed("no module".to_string()))
            }
        });
        let mut config = test_engine::bare_config();
        config.resilience.max_init_retries = 2;
        config.resilience.init_backoff_ms = 1;
        let tier = ThreadTier::with_factory(config, factory);

        let err = tier.initialize().await.unwrap_err();
        assert!(matches!(err, EngineError::WasmNotInitialized(_)));
        assert_eq!(boots.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn converts_through_a_real_engine_session() {
        let (_module, config) = test_engine::test_config(false);
        let tier = ThreadTier::new(config);
        tier.initialize().await.unwrap();

        let result = tier
            .convert(b"document bytes", ConvertOptions::to_format("txt"))
            .await
            .unwrap();
        assert_eq!(result.bytes, b"CONVERTED:txt");
        assert_eq!(result.mime_type, "text/plain");

        tier.destroy().await.unwrap();
        assert!(!tier.is_ready().await);
    }
}
