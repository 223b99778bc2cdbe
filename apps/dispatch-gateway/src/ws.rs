//! The `/ws` wire protocol (spec §6.2): newline-delimited JSON frames over
//! a persistent bidirectional socket. Grounded on the teacher pack's
//! `fraiseql_rs` websocket handler's split sender/receiver idiom for the
//! socket plumbing; `wire::InboundFrame`/`OutboundFrame` own the pure frame
//! catalogue. One writer task drains the session's bounded outbound
//! channel (spec §5); direct replies (`authentication_success`,
//! `heartbeat_response`, `error`) are pushed onto that same channel via
//! `Registry::try_send` rather than writing to the socket from the reader
//! loop, so there is exactly one task per session holding the socket's
//! write half.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use dispatch_engine::{Capability, InboundFrame, JobDispatchEngine, OutboundFrame};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state::AppState;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.engine))
}

/// Extracts a `capabilities: [{name, version}]` array from the optional
/// metadata blob an `authenticate` frame carries; extensions that send no
/// metadata authenticate with an empty capability set.
fn parse_capabilities(metadata: &Option<Value>) -> Vec<Capability> {
    let Some(Value::Object(map)) = metadata else {
        return Vec::new();
    };
    let Some(Value::Array(entries)) = map.get("capabilities") else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let name = entry.get("name")?.as_str()?.to_string();
            let version = entry.get("version")?.as_str()?.to_string();
            Some(Capability { name, version })
        })
        .collect()
}

async fn handle_socket(socket: WebSocket, engine: Arc<JobDispatchEngine>) {
    let (sender, mut receiver) = socket.split();
    let mut current_id = format!("temp-{}", Uuid::new_v4());
    let mut authenticated = false;
    let mut outbound_rx = engine.connect_extension(current_id.clone());

    engine
        .registry
        .try_send(&current_id, OutboundFrame::AuthenticationRequired { timestamp: Utc::now() });

    let writer = tokio::spawn(async move {
        let mut sender = sender;
        while let Some(frame) = outbound_rx.recv().await {
            let line = frame.to_json_line().unwrap_or_default();
            if sender.send(Message::Text(line.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let Ok(msg) = msg else {
            warn!(extension_id = %current_id, "websocket read error, closing");
            break;
        };

        match msg {
            Message::Text(text) => {
                if !handle_frame(&engine, &mut current_id, &mut authenticated, &text) {
                    break;
                }
            }
            Message::Close(_) => {
                debug!(extension_id = %current_id, "client closed websocket");
                break;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    writer.abort();
    engine.disconnect_extension(&current_id);
    debug!(extension_id = %current_id, "extension session ended");
}

/// Applies one inbound frame to the engine, replying over the registry's
/// outbound channel where the protocol calls for a direct reply. Returns
/// `false` when the session should be closed (a protocol violation before
/// authentication completes, or a rejected authenticate frame).
fn handle_frame(engine: &Arc<JobDispatchEngine>, current_id: &mut String, authenticated: &mut bool, text: &str) -> bool {
    let frame = match InboundFrame::from_json_line(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(extension_id = %current_id, error = %e, "malformed frame");
            engine
                .registry
                .try_send(current_id, OutboundFrame::Error { error: e.to_string(), timestamp: Utc::now() });
            return true;
        }
    };

    match frame {
        InboundFrame::Authenticate { extension_id, metadata } => {
            if *authenticated {
                warn!(extension_id = %current_id, "duplicate authenticate frame, closing session");
                return false;
            }
            let capabilities = parse_capabilities(&metadata);
            if engine.authenticate_extension(current_id, extension_id.clone(), capabilities) {
                *current_id = extension_id.clone();
                *authenticated = true;
                engine
                    .registry
                    .try_send(&extension_id, OutboundFrame::AuthenticationSuccess { extension_id, timestamp: Utc::now() });
                true
            } else {
                warn!(extension_id = %extension_id, "authentication failed, closing session");
                false
            }
        }
        _ if !*authenticated => {
            warn!(extension_id = %current_id, "frame received before authentication, closing session");
            engine.registry.try_send(
                current_id,
                OutboundFrame::Error { error: "authenticate first".into(), timestamp: Utc::now() },
            );
            false
        }
        InboundFrame::Heartbeat { .. } => {
            engine.heartbeat_extension(current_id);
            engine
                .registry
                .try_send(current_id, OutboundFrame::HeartbeatResponse { timestamp: Utc::now() });
            true
        }
        InboundFrame::ImageGenerationProgress { request_id, .. } => {
            if let Ok(job_id) = request_id.parse::<Uuid>() {
                engine.report_progress(current_id, job_id);
            }
            true
        }
        InboundFrame::ImageGenerated { request_id, image_url, metadata, .. } => {
            if let Ok(job_id) = request_id.parse::<Uuid>() {
                let result = serde_json::json!({ "imageUrl": image_url, "metadata": metadata });
                let _ = engine.complete_job(current_id, job_id, Some(result));
            }
            true
        }
        InboundFrame::ImageGenerationFailed { request_id, error, .. } => {
            if let Ok(job_id) = request_id.parse::<Uuid>() {
                let _ = engine.fail_job(current_id, job_id, error);
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_engine::EngineConfig;
    use test_support::WireHarness;

    #[tokio::test]
    async fn handle_frame_authenticates_then_accepts_heartbeat() {
        let harness = WireHarness::new(EngineConfig::default());
        let mut current_id = "temp-1".to_string();
        let mut rx = harness.engine.connect_extension(current_id.clone());
        let mut authenticated = false;

        let auth = serde_json::json!({"type": "authenticate", "extensionId": "ext-1"}).to_string();
        assert!(handle_frame(&harness.engine, &mut current_id, &mut authenticated, &auth));
        assert!(authenticated);
        assert_eq!(current_id, "ext-1");
        match rx.recv().await.unwrap() {
            OutboundFrame::AuthenticationSuccess { extension_id, .. } => {
                assert_eq!(extension_id, "ext-1");
            }
            other => panic!("expected authentication_success, got {other:?}"),
        }

        let heartbeat = serde_json::json!({"type": "heartbeat"}).to_string();
        assert!(handle_frame(&harness.engine, &mut current_id, &mut authenticated, &heartbeat));
        match rx.recv().await.unwrap() {
            OutboundFrame::HeartbeatResponse { .. } => {}
            other => panic!("expected heartbeat_response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handle_frame_rejects_frames_before_authentication() {
        let harness = WireHarness::new(EngineConfig::default());
        let mut current_id = "temp-2".to_string();
        let mut rx = harness.engine.connect_extension(current_id.clone());
        let mut authenticated = false;

        let heartbeat = serde_json::json!({"type": "heartbeat"}).to_string();
        assert!(!handle_frame(&harness.engine, &mut current_id, &mut authenticated, &heartbeat));
        match rx.recv().await.unwrap() {
            OutboundFrame::Error { .. } => {}
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn parse_capabilities_reads_name_and_version_pairs() {
        let metadata = Some(serde_json::json!({
            "capabilities": [{"name": "image-gen", "version": "1.0"}]
        }));
        let caps = parse_capabilities(&metadata);
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].name, "image-gen");
    }

    #[test]
    fn parse_capabilities_defaults_to_empty_without_metadata() {
        assert!(parse_capabilities(&None).is_empty());
    }

    #[test]
    fn parse_capabilities_ignores_malformed_entries() {
        let metadata = Some(serde_json::json!({ "capabilities": [{"name": "image-gen"}] }));
        assert!(parse_capabilities(&metadata).is_empty());
    }
}
