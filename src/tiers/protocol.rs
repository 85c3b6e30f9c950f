// SPDX-License-Identifier: MIT

//! Wire protocol shared by the side-thread and side-process tiers.
//!
//! Envelopes are `{ type, id, payload }`; the side-process transport frames
//! them as JSON lines over stdin/stdout, with document bytes base64-encoded
//! inside the payload. The worker announces itself with a single ready line
//! before accepting requests. Failures travel as [`WireError`], a mirror of
//! the host error taxonomy, so a typed error produced inside a worker
//! session resurfaces as the same [`EngineError`] variant it would have been
//! in the same-context tier.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Convert,
    PageCount,
    RenderPage,
    Shutdown,
}

/// Request envelope, correlation id included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub id: String,
    #[serde(default)]
    pub payload: Value,
}

impl WorkerRequest {
    pub fn new<P: Serialize>(kind: RequestKind, id: String, payload: &P) -> EngineResult<Self> {
        Ok(Self {
            kind,
            id,
            payload: serde_json::to_value(payload)
                .map_err(|e| EngineError::Protocol(format!("unencodable payload: {}", e)))?,
        })
    }

    pub fn shutdown(id: String) -> Self {
        Self {
            kind: RequestKind::Shutdown,
            id,
            payload: Value::Null,
        }
    }
}

/// Worker failure, classed so the host side can rebuild the typed error.
///
/// The worker's session produces the full [`EngineError`] taxonomy; a bare
/// diagnostic string would collapse every class into one. Variants carry the
/// inner message only, the class prefix is reapplied on reconstruction.
/// Worker-internal failures with no caller-facing class (I/O, traps, channel
/// breakage) travel as `Internal` and are classified by message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum WireError {
    InvalidInput { message: String },
    UnsupportedFormat { input: String, output: String },
    LoadFailed { message: String },
    ConversionFailed { message: String },
    WasmNotInitialized { message: String },
    PasswordRequired,
    CorruptedDocument { message: String },
    AbiMismatch { message: String },
    Memory { message: String },
    Protocol { message: String },
    Internal { message: String },
}

impl WireError {
    /// Snapshot a session error for the wire.
    pub fn from_error(error: &EngineError) -> Self {
        match error {
            EngineError::InvalidInput(m) => WireError::InvalidInput { message: m.clone() },
            EngineError::UnsupportedFormat { input, output } => WireError::UnsupportedFormat {
                input: input.clone(),
                output: output.clone(),
            },
            EngineError::LoadFailed(m) => WireError::LoadFailed { message: m.clone() },
            EngineError::ConversionFailed(m) => WireError::ConversionFailed { message: m.clone() },
            EngineError::WasmNotInitialized(m) => {
                WireError::WasmNotInitialized { message: m.clone() }
            }
            EngineError::PasswordRequired => WireError::PasswordRequired,
            EngineError::CorruptedDocument(m) => {
                WireError::CorruptedDocument { message: m.clone() }
            }
            EngineError::AbiMismatch(m) => WireError::AbiMismatch { message: m.clone() },
            EngineError::Memory(m) => WireError::Memory { message: m.clone() },
            EngineError::Protocol(m) => WireError::Protocol { message: m.clone() },
            other => WireError::Internal {
                message: other.to_string(),
            },
        }
    }

    /// Rebuild the typed host-side error.
    pub fn into_error(self) -> EngineError {
        match self {
            WireError::InvalidInput { message } => EngineError::InvalidInput(message),
            WireError::UnsupportedFormat { input, output } => {
                EngineError::UnsupportedFormat { input, output }
            }
            WireError::LoadFailed { message } => EngineError::LoadFailed(message),
            WireError::ConversionFailed { message } => EngineError::ConversionFailed(message),
            WireError::WasmNotInitialized { message } => EngineError::WasmNotInitialized(message),
            WireError::PasswordRequired => EngineError::PasswordRequired,
            WireError::CorruptedDocument { message } => EngineError::CorruptedDocument(message),
            WireError::AbiMismatch { message } => EngineError::AbiMismatch(message),
            WireError::Memory { message } => EngineError::Memory(message),
            WireError::Protocol { message } => EngineError::Protocol(message),
            WireError::Internal { message } => EngineError::ConversionFailed(message),
        }
    }
}

impl Display for WireError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            WireError::InvalidInput { message } => write!(f, "Invalid input: {}", message),
            WireError::UnsupportedFormat { input, output } => {
                write!(f, "Unsupported format conversion: {} -> {}", input, output)
            }
            WireError::LoadFailed { message } => write!(f, "Document load failed: {}", message),
            WireError::ConversionFailed { message } => write!(f, "Conversion failed: {}", message),
            WireError::WasmNotInitialized { message } => {
                write!(f, "Engine not initialized: {}", message)
            }
            WireError::PasswordRequired => write!(f, "Document requires a password"),
            WireError::CorruptedDocument { message } => {
                write!(f, "Corrupted document: {}", message)
            }
            WireError::AbiMismatch { message } => write!(f, "Engine ABI mismatch: {}", message),
            WireError::Memory { message } => write!(f, "Memory error: {}", message),
            WireError::Protocol { message } => write!(f, "Protocol error: {}", message),
            WireError::Internal { message } => write!(f, "{}", message),
        }
    }
}

/// Response envelope. Exactly one of `data` / `error` is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl WorkerResponse {
    pub fn ok(id: String, data: Value) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: String, error: WireError) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Collapse into the pending-table result shape.
    pub fn into_result(self) -> Result<Value, WireError> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or(WireError::Internal {
                message: "worker reported failure without a diagnostic".to_string(),
            }))
        }
    }
}

/// Signal emitted by a worker once its engine session is booted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadySignal {
    #[serde(rename = "type")]
    pub message_type: String,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self {
            message_type: "ready".to_string(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.message_type == "ready"
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything a worker writes on its stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Response(WorkerResponse),
    Ready(ReadySignal),
}

// ---- operation payloads ----------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertPayload {
    #[serde(with = "base64_bytes")]
    pub document: Vec<u8>,
    pub output_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_options: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertReply {
    #[serde(with = "base64_bytes")]
    pub document: Vec<u8>,
    pub mime_type: String,
    pub filename: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageCountPayload {
    #[serde(with = "base64_bytes")]
    pub document: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageCountReply {
    pub pages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderPagePayload {
    #[serde(with = "base64_bytes")]
    pub document: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub page: u32,
    pub width: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderPageReply {
    #[serde(with = "base64_bytes")]
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode a typed reply out of a pending-table value.
pub fn decode_reply<T: serde::de::DeserializeOwned>(value: Value) -> EngineResult<T> {
    serde_json::from_value(value)
        .map_err(|e| EngineError::Protocol(format!("malformed worker reply: {}", e)))
}

/// Bytes as standard base64 strings inside JSON payloads.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
