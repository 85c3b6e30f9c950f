// SPDX-License-Identifier: MIT

//! Default limits for engine hosting.

/// Fuel budget set before every engine invocation.
///
/// Document loads and saves walk large engine-internal structures; the budget
/// is deliberately generous. Exhaustion is classified as transient, not as
/// heap corruption.
pub const DEFAULT_FUEL_LEVEL: u64 = 5_000_000_000;

/// Maximum accepted engine module size (512MB). The wrapped engine is a full
/// office suite; this bound only guards against obviously wrong files.
pub const MAX_ENGINE_MODULE_SIZE: usize = 512 * 1024 * 1024;

/// Large-document conversions are minutes-scale.
pub const DEFAULT_CONVERT_TIMEOUT_SECS: u64 = 300;

/// Engine boot inside a worker context: module compilation dominates.
pub const DEFAULT_INIT_TIMEOUT_SECS: u64 = 120;

pub const DEFAULT_MAX_INIT_RETRIES: u32 = 3;

pub const DEFAULT_MAX_CONVERSION_RETRIES: u32 = 2;

pub const DEFAULT_INIT_BACKOFF_MS: u64 = 250;
