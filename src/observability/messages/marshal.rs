// SPDX-License-Identifier: MIT

//! Message types for engine module loading and boundary dispatch events.

use std::fmt::{Display, Formatter};

/// Engine module loaded and compiled.
///
/// # Log Level
/// `info!` - Important operational event
pub struct ModuleLoaded<'a> {
    pub module_path: &'a str,
    pub size_bytes: usize,
}

impl Display for ModuleLoaded<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Loaded engine module: {} ({} bytes)",
            self.module_path, self.size_bytes
        )
    }
}

/// Dispatch strategy selected at marshaler construction.
///
/// # Log Level
/// `info!` - Important operational event; "vtable" means the fragile
/// offset-contract fallback is active.
pub struct DispatchSelected {
    pub strategy: &'static str,
}

impl Display for DispatchSelected {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Selected engine dispatch strategy: {}", self.strategy)
    }
}
