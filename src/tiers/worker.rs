// SPDX-License-Identifier: MIT

//! Worker-side request handling, shared by the side-thread tier and the
//! `engine-worker` binary.

use std::io::{BufRead, Write};

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::observability::messages::tier::WorkerReady;
use crate::session::EngineSession;
use crate::tiers::protocol::{
    ConvertPayload, ConvertReply, PageCountPayload, PageCountReply, ReadySignal,
    RenderPagePayload, RenderPageReply, RequestKind, WireError, WorkerMessage, WorkerRequest,
    WorkerResponse,
};
use crate::tiers::ConvertOptions;

/// Execute one request against the worker's session. Never panics outward:
/// every failure becomes an error response carrying the error class and
/// diagnostic, which the host side rebuilds into the typed error.
pub fn handle_request(session: &mut EngineSession, request: WorkerRequest) -> WorkerResponse {
    let id = request.id.clone();
    match dispatch(session, request) {
        Ok(data) => WorkerResponse::ok(id, data),
        Err(e) => WorkerResponse::failure(id, WireError::from_error(&e)),
    }
}

fn dispatch(session: &mut EngineSession, request: WorkerRequest) -> EngineResult<serde_json::Value> {
    match request.kind {
        RequestKind::Convert => {
            let payload: ConvertPayload = decode_payload(request.payload)?;
            let options = ConvertOptions {
                output_format: payload.output_format,
                input_format: payload.input_format,
                password: payload.password,
                filter_options: payload.filter_options,
            };
            let result = session.convert_bytes(&payload.document, &options)?;
            encode_reply(&ConvertReply {
                document: result.bytes,
                mime_type: result.mime_type,
                filename: result.filename,
                duration_ms: result.duration_ms,
            })
        }
        RequestKind::PageCount => {
            let payload: PageCountPayload = decode_payload(request.payload)?;
            let options = ConvertOptions {
                input_format: payload.input_format,
                password: payload.password,
                ..ConvertOptions::default()
            };
            let pages = session.page_count(&payload.document, &options)?;
            encode_reply(&PageCountReply { pages })
        }
        RequestKind::RenderPage => {
            let payload: RenderPagePayload = decode_payload(request.payload)?;
            let options = ConvertOptions {
                input_format: payload.input_format,
                password: payload.password,
                ..ConvertOptions::default()
            };
            let page = session.render_page_bytes(
                &payload.document,
                &options,
                payload.page,
                payload.width,
                payload.height,
            )?;
            encode_reply(&RenderPageReply {
                pixels: page.pixels,
                width: page.width,
                height: page.height,
            })
        }
        RequestKind::Shutdown => Ok(serde_json::Value::Null),
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> EngineResult<T> {
    serde_json::from_value(value)
        .map_err(|e| EngineError::Protocol(format!("malformed request payload: {}", e)))
}

fn encode_reply<T: serde::Serialize>(reply: &T) -> EngineResult<serde_json::Value> {
    serde_json::to_value(reply)
        .map_err(|e| EngineError::Protocol(format!("unencodable reply: {}", e)))
}

/// Side-process worker loop over stdin/stdout.
///
/// The parent writes the engine configuration as the first line; the worker
/// boots a session, announces readiness, then serves requests one JSON line
/// at a time until `shutdown` or EOF. Logs go to stderr, stdout carries the
/// protocol and nothing else.
pub fn run_stdio_worker() -> EngineResult<()> {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    let config_line = lines
        .next()
        .transpose()?
        .ok_or_else(|| EngineError::Protocol("missing configuration line".to_string()))?;
    let config: EngineConfig = serde_json::from_str(&config_line)
        .map_err(|e| EngineError::Protocol(format!("malformed configuration line: {}", e)))?;

    let mut session = EngineSession::boot(&config)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    write_line(&mut out, &WorkerMessage::Ready(ReadySignal::new()))?;
    tracing::info!("{}", WorkerReady { tier: "process" });

    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: WorkerRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("discarding malformed request line: {}", e);
                continue;
            }
        };
        if request.kind == RequestKind::Shutdown {
            break;
        }
        let response = handle_request(&mut session, request);
        write_line(&mut out, &WorkerMessage::Response(response))?;
    }

    session.shutdown();
    Ok(())
}

fn write_line<W: Write>(out: &mut W, message: &WorkerMessage) -> EngineResult<()> {
    let line = serde_json::to_string(message)
        .map_err(|e| EngineError::Protocol(format!("unencodable message: {}", e)))?;
    out.write_all(line.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
