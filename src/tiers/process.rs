// SPDX-License-Identifier: MIT

//! Tier C: the engine session runs in a child process.
//!
//! Strongest isolation: a corrupted or wedged engine takes the child down,
//! never the host. The correlation protocol from the thread tier rides on
//! JSON lines over the child's stdin/stdout, behind the [`WorkerTransport`]
//! seam so tests can script worker behavior without spawning processes.
//!
//! This is the only tier that retries: a corruption-class failure with
//! `restart_on_memory_error` set kills and respawns the child, then replays
//! the same logical request, up to `max_conversion_retries` times.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::errors::classify::{classify_diagnostic, DiagnosticClass};
use crate::errors::{EngineError, EngineResult};
use crate::observability::messages::tier::{
    ConversionRetry, CorruptionDetected, InitRetry, WorkerReady, WorkerRestarted,
};
use crate::tiers::pending::PendingRequests;
use crate::tiers::protocol::{
    decode_reply, ConvertPayload, ConvertReply, PageCountPayload, PageCountReply,
    RenderPagePayload, RenderPageReply, RequestKind, WorkerMessage, WorkerRequest, WorkerResponse,
};
use crate::tiers::{ConvertOptions, ConvertResult, DocumentEngine, RenderedPage, TierState};

/// Live link to one spawned worker context.
pub struct WorkerChannel {
    /// Requests into the worker.
    pub tx: mpsc::UnboundedSender<WorkerRequest>,
    /// Responses out of the worker. The ready handshake has already been
    /// consumed by the transport.
    pub rx: mpsc::UnboundedReceiver<WorkerResponse>,
    /// Cancelling this kills the worker context.
    pub kill: CancellationToken,
}

/// How worker contexts are spawned. Production uses [`StdioTransport`];
/// tests script failures through a mock.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn spawn(&self, config: &EngineConfig) -> EngineResult<WorkerChannel>;
}

/// Spawns the `engine-worker` binary and frames the protocol as JSON lines
/// over its stdin/stdout. The worker's stderr passes through for logs.
pub struct StdioTransport;

#[async_trait]
impl WorkerTransport for StdioTransport {
    async fn spawn(&self, config: &EngineConfig) -> EngineResult<WorkerChannel> {
        let worker_path = match &config.worker_path {
            Some(path) => path.clone(),
            None => {
                let mut path = std::env::current_exe()?;
                path.set_file_name("engine-worker");
                path
            }
        };

        let mut child = tokio::process::Command::new(&worker_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            EngineError::Transport("worker stdin unavailable".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::Transport("worker stdout unavailable".to_string())
        })?;

        // First line down is the engine configuration.
        let mut config_line = serde_json::to_string(config)
            .map_err(|e| EngineError::Protocol(format!("unencodable config: {}", e)))?;
        config_line.push('\n');
        stdin.write_all(config_line.as_bytes()).await?;
        stdin.flush().await?;

        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<WorkerRequest>();
        let (response_tx, response_rx) = mpsc::unbounded_channel::<WorkerResponse>();
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let kill = CancellationToken::new();

        // Writer: requests to the child's stdin, one JSON line each.
        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let mut line = match serde_json::to_string(&request) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!("dropping unencodable request: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader: the child's stdout, ready handshake then responses. When
        // the child dies or the kill token fires, the response channel drops
        // and the tier's dispatcher rejects whatever was in flight.
        let reader_kill = kill.clone();
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = tokio::select! {
                    _ = reader_kill.cancelled() => break,
                    line = lines.next_line() => line,
                };
                let line = match line {
                    Ok(Some(line)) => line,
                    _ => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkerMessage>(&line) {
                    Ok(WorkerMessage::Ready(signal)) if signal.is_ready() => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    Ok(WorkerMessage::Ready(_)) => {}
                    Ok(WorkerMessage::Response(response)) => {
                        if response_tx.send(response).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("discarding malformed worker line: {}", e);
                    }
                }
            }
        });

        // Reap the child once the kill token fires.
        let child_kill = kill.clone();
        tokio::spawn(async move {
            child_kill.cancelled().await;
            let _ = child.kill().await;
        });

        // The link is unusable until the worker says it is ready.
        tokio::time::timeout(config.init_timeout(), ready_rx)
            .await
            .map_err(|_| EngineError::Timeout(config.init_timeout()))?
            .map_err(|_| {
                EngineError::Transport("worker exited before becoming ready".to_string())
            })?;

        Ok(WorkerChannel {
            tx: request_tx,
            rx: response_rx,
            kill,
        })
    }
}

struct ProcessLink {
    tx: mpsc::UnboundedSender<WorkerRequest>,
    kill: CancellationToken,
}

impl Drop for ProcessLink {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

pub struct ProcessTier {
    config: EngineConfig,
    transport: Arc<dyn WorkerTransport>,
    pending: Arc<PendingRequests>,
    state: Mutex<TierState>,
    link: Mutex<Option<ProcessLink>>,
    respawns: AtomicU32,
    generation: Arc<AtomicU32>,
}

impl ProcessTier {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_transport(config, Arc::new(StdioTransport))
    }

    pub fn with_transport(config: EngineConfig, transport: Arc<dyn WorkerTransport>) -> Self {
        Self {
            config,
            transport,
            pending: Arc::new(PendingRequests::new()),
            state: Mutex::new(TierState::Uninitialized),
            link: Mutex::new(None),
            respawns: AtomicU32::new(0),
            generation: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Worker respawns after the first boot. Test hook for the retry-budget
    /// properties.
    pub fn respawn_count(&self) -> u32 {
        self.respawns.load(Ordering::Relaxed)
    }

    async fn spawn_linked(&self) -> EngineResult<ProcessLink> {
        let channel = self.transport.spawn(&self.config).await?;
        let WorkerChannel { tx, mut rx, kill } = channel;

        let pending = self.pending.clone();
        let generation = self.generation.clone();
        let spawned_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                let id = response.id.clone();
                pending.complete(&id, response.into_result());
            }
            if generation.load(Ordering::SeqCst) == spawned_generation {
                pending.fail_all("engine worker process exited");
            }
        });

        tracing::info!("{}", WorkerReady { tier: "process" });
        Ok(ProcessLink { tx, kill })
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
            _ => {}
        }
        *state = TierState::Initializing;

        let max_retries = self.config.resilience.max_init_retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_retries {
            match self.spawn_linked().await {
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
            "worker process failed to boot after {} attempt(s): {}",
            max_retries, last_error
        )))
    }

    /// Kill the current worker, reject in-flight work, and leave the tier
    /// ready to respawn on the next `ensure_ready`.
    async fn kill_worker(&self, reason: &str) {
        tracing::warn!(
            "{}",
            WorkerRestarted {
                tier: "process",
                reason,
            }
        );
        *self.link.lock().await = None; // drop cancels the kill token
        self.pending.fail_all(reason);
        let mut state = self.state.lock().await;
        if *state != TierState::Destroyed {
            *state = TierState::Corrupted;
        }
    }

    async fn request_once<P: serde::Serialize + Sync>(
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
            return Err(EngineError::Transport(
                "worker process channel closed".to_string(),
            ));
        }

        match tokio::time::timeout(self.config.convert_timeout(), rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(failure))) => {
                let diagnostic = failure.to_string();
                if classify_diagnostic(&diagnostic) == DiagnosticClass::FatalCorruption {
                    tracing::error!(
                        "{}",
                        CorruptionDetected {
                            tier: "process",
                            diagnostic: &diagnostic,
                        }
                    );
                    Err(EngineError::Memory(diagnostic))
                } else {
                    // The worker classed this error; resurface the variant
                    // the same-context tier would have produced.
                    Err(failure.into_error())
                }
            }
            Ok(Err(_)) => Err(EngineError::Transport(
                "worker exited mid-request".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&id);
                Err(EngineError::Timeout(self.config.convert_timeout()))
            }
        }
    }

    /// Decide whether a failure warrants kill + respawn + same-request retry.
    fn is_recoverable(&self, error: &EngineError) -> bool {
        if !self.config.resilience.restart_on_memory_error {
            return false;
        }
        match error {
            EngineError::Memory(_) | EngineError::Transport(_) | EngineError::Timeout(_) => true,
            other => {
                classify_diagnostic(&other.to_string()) == DiagnosticClass::FatalCorruption
            }
        }
    }

    /// The tier's retry loop: one request, plus up to
    /// `max_conversion_retries` respawn-and-replay rounds on corruption.
    async fn request_with_retry<P: serde::Serialize + Sync>(
        &self,
        kind: RequestKind,
        payload: &P,
    ) -> EngineResult<Value> {
        let max_retries = self.config.resilience.max_conversion_retries;
        let mut attempt: u32 = 0;
        loop {
            match self.request_once(kind, payload).await {
                Ok(value) => return Ok(value),
                Err(e) if self.is_recoverable(&e) && attempt < max_retries => {
                    attempt += 1;
                    self.respawns.fetch_add(1, Ordering::Relaxed);
                    self.kill_worker(&e.to_string()).await;
                    tracing::warn!(
                        "{}",
                        ConversionRetry {
                            attempt,
                            max_retries,
                        }
                    );
                }
                Err(e) if self.is_recoverable(&e) => {
                    // Budget exhausted: the worker is still killed so the
                    // next caller starts clean, but this call fails.
                    self.kill_worker(&e.to_string()).await;
                    return Err(EngineError::ConversionFailed(format!(
                        "failed after {} retry attempt(s): {}",
                        max_retries, e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl DocumentEngine for ProcessTier {
    async fn initialize(&self) -> EngineResult<()> {
        self.ensure_ready().await
    }

    async fn destroy(&self) -> EngineResult<()> {
        self.pending.fail_all("tier destroyed");
        if let Some(link) = self.link.lock().await.take() {
            let _ = link.tx.send(WorkerRequest::shutdown(String::new()));
            // drop cancels the kill token after the shutdown line
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
        let value = self.request_with_retry(RequestKind::Convert, &payload).await?;
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
        let value = self
            .request_with_retry(RequestKind::PageCount, &payload)
            .await?;
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
        let value = self
            .request_with_retry(RequestKind::RenderPage, &payload)
            .await?;
        let reply: RenderPageReply = decode_reply(value)?;
        Ok(RenderedPage {
            pixels: reply.pixels,
            width: reply.width,
            height: reply.height,
        })
    }
}
