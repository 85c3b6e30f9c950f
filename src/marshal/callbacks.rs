// SPDX-License-Identifier: MIT

//! Callback queue reader.
//!
//! The engine has no direct query API for much of its state; instead it
//! enqueues structured events while executing commands. Observing state is
//! therefore an explicit two-phase protocol:
//!
//! 1. clear the queue,
//! 2. post the command,
//! 3. **flush**: headless builds have no running event loop, so posted
//!    commands park their callbacks in a deferred-dispatch queue that is
//!    never pumped automatically,
//! 4. poll one event at a time until the empty sentinel.
//!
//! Registration is tied to a document handle and is a *precondition*:
//! polling without a registered handler silently yields nothing. Callers
//! should assert [`CallbackChannel::is_registered`] before relying on events.

use crate::errors::{EngineError, EngineResult};
use crate::marshal::Marshaler;
use std::collections::HashMap;
use wasmtime::{Instance, Store, TypedFunc};

/// Upper bound on a single event payload. Anything larger is a protocol
/// violation, not data.
pub const MAX_CALLBACK_PAYLOAD: usize = 4096;

/// Event type codes, matching the engine's callback enumeration.
pub const CALLBACK_INVALIDATE_TILES: i32 = 0;
pub const CALLBACK_PROGRESS: i32 = 1;
pub const CALLBACK_STATE_CHANGED: i32 = 2;
pub const CALLBACK_DOCUMENT_MODIFIED: i32 = 3;
pub const CALLBACK_ERROR: i32 = 4;

/// One event pulled from the engine's callback queue.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackEvent {
    pub code: i32,
    pub name: &'static str,
    pub payload: String,
}

/// Human name for an event type code.
pub fn callback_name(code: i32) -> &'static str {
    match code {
        CALLBACK_INVALIDATE_TILES => "INVALIDATE_TILES",
        CALLBACK_PROGRESS => "PROGRESS",
        CALLBACK_STATE_CHANGED => "STATE_CHANGED",
        CALLBACK_DOCUMENT_MODIFIED => "DOCUMENT_MODIFIED",
        CALLBACK_ERROR => "ERROR",
        _ => "UNKNOWN",
    }
}

/// Host side of the engine's callback queue.
pub struct CallbackChannel {
    register: TypedFunc<i32, ()>,
    unregister: TypedFunc<i32, ()>,
    clear: TypedFunc<(), ()>,
    flush: TypedFunc<(), ()>,
    poll: TypedFunc<i32, i32>,
    registered_doc: Option<u32>,
}

impl CallbackChannel {
    pub fn new(store: &mut Store<()>, instance: &Instance) -> EngineResult<Self> {
        fn typed<P, R>(
            store: &mut Store<()>,
            instance: &Instance,
            name: &str,
        ) -> EngineResult<TypedFunc<P, R>>
        where
            P: wasmtime::WasmParams,
            R: wasmtime::WasmResults,
        {
            instance.get_typed_func::<P, R>(&mut *store, name).map_err(|e| {
                EngineError::AbiMismatch(format!("missing callback export '{}': {}", name, e))
            })
        }

        Ok(Self {
            register: typed(store, instance, "eng_register_callback")?,
            unregister: typed(store, instance, "eng_unregister_callback")?,
            clear: typed(store, instance, "eng_clear_callbacks")?,
            flush: typed(store, instance, "eng_flush_callbacks")?,
            poll: typed(store, instance, "eng_poll_callback")?,
            registered_doc: None,
        })
    }

    /// Register the callback handler for a document handle.
    pub fn register(&mut self, store: &mut Store<()>, dh: u32) -> EngineResult<()> {
        self.register.call(&mut *store, dh as i32)?;
        self.registered_doc = Some(dh);
        Ok(())
    }

    pub fn unregister(&mut self, store: &mut Store<()>, dh: u32) -> EngineResult<()> {
        self.unregister.call(&mut *store, dh as i32)?;
        if self.registered_doc == Some(dh) {
            self.registered_doc = None;
        }
        Ok(())
    }

    /// Whether a handler is registered. Polling without one is silently
    /// empty, so callers observing state must check this first.
    pub fn is_registered(&self) -> bool {
        self.registered_doc.is_some()
    }

    /// Document handle the handler is registered against, if any.
    pub fn registered_document(&self) -> Option<u32> {
        self.registered_doc
    }

    /// Drop any queued and any staged-but-unflushed events.
    pub fn clear(&self, store: &mut Store<()>) -> EngineResult<()> {
        self.clear.call(&mut *store, ())?;
        Ok(())
    }

    /// Force delivery of deferred callbacks. Must run after every mutating
    /// command before events can be polled.
    pub fn flush(&self, store: &mut Store<()>) -> EngineResult<()> {
        self.flush.call(&mut *store, ())?;
        Ok(())
    }

    /// Pull one event, or `None` when the queue is empty. The payload string
    /// is handed over by the engine and freed as part of the read.
    pub fn poll(&self, store: &mut Store<()>, marshaler: &Marshaler) -> EngineResult<Option<CallbackEvent>> {
        marshaler.with_buffer(store, 4, |m, store, type_out| {
            let payload_ptr = self.poll.call(&mut *store, type_out as i32)?;
            if payload_ptr == 0 {
                return Ok(None);
            }
            let code = m.read_u32(store, type_out)? as i32;
            let payload = m.read_string_and_free(store, payload_ptr as u32)?;
            if payload.len() > MAX_CALLBACK_PAYLOAD {
                return Err(EngineError::Protocol(format!(
                    "callback payload of {} bytes exceeds the {} byte bound",
                    payload.len(),
                    MAX_CALLBACK_PAYLOAD
                )));
            }
            Ok(Some(CallbackEvent {
                code,
                name: callback_name(code),
                payload,
            }))
        })
    }

    /// Poll until the empty sentinel, draining the whole queue.
    pub fn drain(&self, store: &mut Store<()>, marshaler: &Marshaler) -> EngineResult<Vec<CallbackEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.poll(store, marshaler)? {
            events.push(event);
        }
        Ok(events)
    }
}

/// Fold STATE_CHANGED payloads into a name → value map.
///
/// Payloads follow a `name=value` convention; a payload without `=` is a
/// boolean-style event and maps to an empty value.
pub fn parse_state_changes(events: &[CallbackEvent]) -> HashMap<String, String> {
    let mut states = HashMap::new();
    for event in events {
        if event.code != CALLBACK_STATE_CHANGED {
            continue;
        }
        match event.payload.split_once('=') {
            Some((name, value)) => states.insert(name.to_string(), value.to_string()),
            None => states.insert(event.payload.clone(), String::new()),
        };
    }
    states
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_event(payload: &str) -> CallbackEvent {
        CallbackEvent {
            code: CALLBACK_STATE_CHANGED,
            name: callback_name(CALLBACK_STATE_CHANGED),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn parses_name_value_pairs() {
        let events = vec![state_event(".uno:Bold=true"), state_event(".uno:Italic=false")];
        let states = parse_state_changes(&events);
        assert_eq!(states.len(), 2);
        assert_eq!(states[".uno:Bold"], "true");
        assert_eq!(states[".uno:Italic"], "false");
    }

    #[test]
    fn missing_equals_means_empty_value() {
        let states = parse_state_changes(&[state_event(".uno:Undo")]);
        assert_eq!(states[".uno:Undo"], "");
    }

    #[test]
    fn ignores_non_state_events() {
        let events = vec![
            CallbackEvent {
                code: CALLBACK_PROGRESS,
                name: callback_name(CALLBACK_PROGRESS),
                payload: "50".to_string(),
            },
            state_event(".uno:Bold=true"),
        ];
        let states = parse_state_changes(&events);
        assert_eq!(states.len(), 1);
        assert!(states.contains_key(".uno:Bold"));
    }

    #[test]
    fn value_may_contain_equals() {
        let states = parse_state_changes(&[state_event("formula=A1=B2")]);
        assert_eq!(states["formula"], "A1=B2");
    }

    #[test]
    fn names_cover_known_codes() {
        assert_eq!(callback_name(CALLBACK_STATE_CHANGED), "STATE_CHANGED");
        assert_eq!(callback_name(99), "UNKNOWN");
    }
}
