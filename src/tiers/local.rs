// SPDX-License-Identifier: MIT

//! Tier A: the engine session lives in the host context.
//!
//! Fastest path, zero isolation. A corruption-class failure poisons the
//! session; the tier drops it, marks itself corrupted, and boots a fresh
//! session before the *next* call proceeds. The call that observed the
//! corruption is never retried here.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::errors::classify::{classify_diagnostic, DiagnosticClass};
use crate::errors::{EngineError, EngineResult};
use crate::observability::messages::tier::{CorruptionDetected, InitRetry, WorkerReady};
use crate::session::EngineSession;
use crate::tiers::{ConvertOptions, ConvertResult, DocumentEngine, RenderedPage, TierState};

struct LocalInner {
    state: TierState,
    session: Option<EngineSession>,
}

pub struct LocalTier {
    config: EngineConfig,
    inner: Mutex<LocalInner>,
    boots: AtomicU32,
}

impl LocalTier {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(LocalInner {
                state: TierState::Uninitialized,
                session: None,
            }),
            boots: AtomicU32::new(0),
        }
    }

    /// Successful session boots so far. Test hook for the single-boot and
    /// reboot-after-corruption properties.
    pub fn boot_count(&self) -> u32 {
        self.boots.load(Ordering::Relaxed)
    }

    /// Bring the held session up if it is not already. Runs under the inner
    /// lock, so concurrent initializers share one boot.
    async fn ensure_ready(&self, inner: &mut LocalInner) -> EngineResult<()> {
        match inner.state {
            TierState::Ready => return Ok(()),
            TierState::Destroyed => {
                return Err(EngineError::WasmNotInitialized(
                    "tier has been destroyed".to_string(),
                ))
            }
            _ => {}
        }

        inner.state = TierState::Initializing;
        inner.session = None;

        let max_retries = self.config.resilience.max_init_retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_retries {
            match EngineSession::boot(&self.config) {
                Ok(session) => {
                    inner.session = Some(session);
                    inner.state = TierState::Ready;
                    self.boots.fetch_add(1, Ordering::Relaxed);
                    tracing::info!("{}", WorkerReady { tier: "local" });
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

        inner.state = TierState::Uninitialized;
        Err(EngineError::WasmNotInitialized(format!(
            "engine failed to initialize after {} attempt(s): {}",
            max_retries, last_error
        )))
    }

    /// Run `op` against a ready session, dropping the session and marking
    /// the tier corrupted when the diagnostic says the heap is gone.
    async fn with_session<T>(
        &self,
        op: impl FnOnce(&mut EngineSession) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut inner = self.inner.lock().await;
        self.ensure_ready(&mut inner).await?;
        let session = inner
            .session
            .as_mut()
            .ok_or_else(|| EngineError::WasmNotInitialized("no active session".to_string()))?;

        match op(session) {
            Ok(value) => Ok(value),
            Err(e) => {
                let diagnostic = e.to_string();
                if classify_diagnostic(&diagnostic) == DiagnosticClass::FatalCorruption {
                    tracing::error!(
                        "{}",
                        CorruptionDetected {
                            tier: "local",
                            diagnostic: &diagnostic,
                        }
                    );
                    inner.session = None;
                    inner.state = TierState::Corrupted;
                }
                Err(e)
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn poison(&self) {
        let mut inner = self.inner.lock().await;
        inner.session = None;
        inner.state = TierState::Corrupted;
    }
}

#[async_trait]
impl DocumentEngine for LocalTier {
    async fn initialize(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_ready(&mut inner).await
    }

    async fn destroy(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(mut session) = inner.session.take() {
            session.shutdown();
        }
        inner.state = TierState::Destroyed;
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        self.inner.lock().await.state == TierState::Ready
    }

    async fn convert(
        &self,
        document: &[u8],
        options: ConvertOptions,
    ) -> EngineResult<ConvertResult> {
        self.with_session(|session| session.convert_bytes(document, &options))
            .await
    }

    async fn page_count(&self, document: &[u8], options: ConvertOptions) -> EngineResult<u32> {
        self.with_session(|session| session.page_count(document, &options))
            .await
    }

    async fn render_page(
        &self,
        document: &[u8],
        options: ConvertOptions,
        page: u32,
        width: u32,
        height: Option<u32>,
    ) -> EngineResult<RenderedPage> {
        self.with_session(|session| {
            session.render_page_bytes(document, &options, page, width, height)
        })
        .await
    }
}
