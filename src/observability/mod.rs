// SPDX-License-Identifier: MIT

//! Observability: structured message types for diagnostic logging.
//!
//! Message types follow a struct-based pattern with a `Display`
//! implementation, emitted through `tracing` at call sites. This keeps the
//! wording of operational events out of the control flow and in one place
//! per subsystem:
//!
//! * `messages::marshal`: module loading and boundary dispatch events
//! * `messages::session`: engine/document lifecycle and conversion events
//! * `messages::tier`: worker lifecycle, corruption and recovery events

pub mod messages;
