// SPDX-License-Identifier: MIT

//! Message types for execution-tier lifecycle, corruption and recovery.

use std::fmt::{Display, Formatter};

/// A worker context reported ready.
///
/// # Log Level
/// `info!` - Important operational event
pub struct WorkerReady {
    pub tier: &'static str,
}

impl Display for WorkerReady {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{} worker ready", self.tier)
    }
}

/// A worker context is being torn down and restarted.
///
/// # Log Level
/// `warn!` - Recovery in progress
pub struct WorkerRestarted<'a> {
    pub tier: &'static str,
    pub reason: &'a str,
}

impl Display for WorkerRestarted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Restarting {} worker: {}", self.tier, self.reason)
    }
}

/// A corruption-class diagnostic was recognized.
///
/// # Log Level
/// `error!` - The engine heap can no longer be trusted
pub struct CorruptionDetected<'a> {
    pub tier: &'static str,
    pub diagnostic: &'a str,
}

impl Display for CorruptionDetected<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Corruption detected in {} tier: {}",
            self.tier, self.diagnostic
        )
    }
}

/// A conversion is being retried after a corruption-triggered respawn.
///
/// # Log Level
/// `warn!` - Recovery in progress
pub struct ConversionRetry {
    pub attempt: u32,
    pub max_retries: u32,
}

impl Display for ConversionRetry {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Retrying conversion after engine respawn (attempt {}/{})",
            self.attempt, self.max_retries
        )
    }
}

/// Initialization failed and will be retried with backoff.
///
/// # Log Level
/// `warn!` - Recovery in progress
pub struct InitRetry<'a> {
    pub attempt: u32,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub error: &'a str,
}

impl Display for InitRetry<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Engine initialization attempt {}/{} failed ({}); retrying in {}ms",
            self.attempt, self.max_retries, self.error, self.backoff_ms
        )
    }
}

/// All in-flight requests were rejected because the transport died.
///
/// # Log Level
/// `error!` - Affects every pending caller
pub struct PendingRequestsFailed<'a> {
    pub count: usize,
    pub reason: &'a str,
}

impl Display for PendingRequestsFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Rejected {} pending request(s): {}",
            self.count, self.reason
        )
    }
}
