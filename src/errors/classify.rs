// SPDX-License-Identifier: MIT

//! Diagnostic classification for caught engine errors.
//!
//! Recovery policy hinges on string matching against trap and runtime
//! diagnostics. The substring lists live here, in one place, so the tiers
//! never grow their own ad hoc matching.

/// How a caught engine diagnostic should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticClass {
    /// The caller did something wrong (bad input, bad format, bad password).
    /// The engine heap is still sound.
    CallerError,
    /// The operation failed for a resource reason (fuel, timeout) and may
    /// succeed if simply re-run against the same engine instance.
    Transient,
    /// The engine heap can no longer be trusted. The execution context must
    /// be torn down and re-initialized before any further call.
    FatalCorruption,
}

/// Diagnostics indicating non-recoverable engine heap state.
///
/// Covers wasmtime's trap wording plus the generic phrasings other hosts of
/// the same engine emit for the identical faults.
const CORRUPTION_MARKERS: &[&str] = &[
    "out of bounds memory access",
    "memory access out of bounds",
    "out of bounds table access",
    "table index is out of bounds",
    "indirect call type mismatch",
    "uninitialized element",
    "null function",
    "call_indirect to a null table entry",
    "context unavailable",
    "unreachable",
];

/// Diagnostics indicating a resource limit, not a broken heap.
const TRANSIENT_MARKERS: &[&str] = &["all fuel consumed", "fuel", "timed out", "interrupt"];

/// Classify a caught engine diagnostic string.
///
/// Corruption markers win over transient markers: a trap that names both is
/// treated as fatal.
pub fn classify_diagnostic(diagnostic: &str) -> DiagnosticClass {
    let lowered = diagnostic.to_ascii_lowercase();

    if CORRUPTION_MARKERS.iter().any(|m| lowered.contains(m)) {
        return DiagnosticClass::FatalCorruption;
    }

    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return DiagnosticClass::Transient;
    }

    DiagnosticClass::CallerError
}
