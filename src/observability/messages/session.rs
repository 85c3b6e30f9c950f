// SPDX-License-Identifier: MIT

//! Message types for engine session and document lifecycle events.

use std::fmt::{Display, Formatter};

/// A document was loaded into the engine.
///
/// # Log Level
/// `debug!` - High-volume lifecycle event
pub struct DocumentLoaded<'a> {
    pub path: &'a str,
    pub handle: u32,
}

impl Display for DocumentLoaded<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Loaded document '{}' (handle {})", self.path, self.handle)
    }
}

/// The engine returned a null document handle.
///
/// # Log Level
/// `error!` - Failure requiring attention
pub struct DocumentLoadFailed<'a> {
    pub path: &'a str,
    pub diagnostic: &'a str,
}

impl Display for DocumentLoadFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Failed to load document '{}': {}",
            self.path, self.diagnostic
        )
    }
}

/// A conversion completed end to end.
///
/// # Log Level
/// `info!` - Important operational event
pub struct ConversionCompleted<'a> {
    pub output_format: &'a str,
    pub output_bytes: usize,
    pub duration_ms: u64,
}

impl Display for ConversionCompleted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Conversion to '{}' produced {} bytes in {}ms",
            self.output_format, self.output_bytes, self.duration_ms
        )
    }
}

/// Engine session torn down.
///
/// # Log Level
/// `debug!` - Lifecycle event
pub struct SessionClosed {
    pub open_documents: usize,
}

impl Display for SessionClosed {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Engine session closed ({} document(s) destroyed at teardown)",
            self.open_documents
        )
    }
}
