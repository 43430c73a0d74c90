//! WebSocket surface: chat traffic in, event-bus mirror out.
//!
//! A connection may watch any number of sessions; each `chat.send` or
//! `session.resume` attaches a bus subscription whose events are forwarded
//! as frames carrying the topic name, session id, and bus sequence.

use super::GatewayState;
use crate::bus::SessionEvent;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const FORWARD_QUEUE: usize = 256;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "chat.send")]
    ChatSend {
        #[serde(default)]
        session_id: Option<String>,
        content: String,
    },
    #[serde(rename = "chat.cancel")]
    ChatCancel { session_id: String },
    #[serde(rename = "approval.response")]
    ApprovalResponse { approval_id: String, approved: bool },
    #[serde(rename = "sessions.list")]
    SessionsList {},
    #[serde(rename = "session.resume")]
    SessionResume { session_id: String },
}

async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let (mut sink, mut stream) = socket.split();
    let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(FORWARD_QUEUE);
    let mut watched: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let frame = event_frame(&event);
                if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("websocket read error: {e}");
                        break;
                    }
                };
                let reply = handle_client_message(
                    &state,
                    text.as_str(),
                    &event_tx,
                    &mut watched,
                )
                .await;
                if let Some(reply) = reply
                    && sink.send(Message::Text(reply.to_string().into())).await.is_err()
                {
                    break;
                }
            }
        }
    }
    debug!("websocket connection closed ({} watched sessions)", watched.len());
}

/// Attach a bus subscription for a session and forward its events into the
/// connection's unified queue.
fn watch_session(
    state: &GatewayState,
    session_id: &str,
    event_tx: &mpsc::Sender<SessionEvent>,
    watched: &mut HashSet<String>,
) {
    if !watched.insert(session_id.to_string()) {
        return;
    }
    let mut rx = state.agent.bus().subscribe(session_id, None);
    let tx = event_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
}

async fn handle_client_message(
    state: &GatewayState,
    text: &str,
    event_tx: &mpsc::Sender<SessionEvent>,
    watched: &mut HashSet<String>,
) -> Option<Value> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            return Some(json!({
                "type": "error",
                "code": "bad_request",
                "message": format!("unparseable message: {e}"),
            }));
        }
    };

    match message {
        ClientMessage::ChatSend {
            session_id,
            content,
        } => {
            let session = match state
                .agent
                .ensure_session(session_id.as_deref(), "ws", &content)
            {
                Ok(session) => session,
                Err(e) => return Some(error_frame(&e)),
            };
            watch_session(state, &session.id, event_tx, watched);
            state.agent.spawn_turn(session.id.clone(), content);
            Some(json!({"type": "chat.accepted", "session_id": session.id}))
        }
        ClientMessage::ChatCancel { session_id } => {
            let found = state.agent.cancel_turn(&session_id);
            Some(json!({
                "type": "chat.cancelled",
                "session_id": session_id,
                "found": found,
            }))
        }
        ClientMessage::ApprovalResponse {
            approval_id,
            approved,
        } => match state.agent.approvals().resolve(&approval_id, approved).await {
            Ok(resolution) => Some(json!({
                "type": "approval.recorded",
                "approval_id": approval_id,
                "resolution": resolution,
            })),
            Err(e) => {
                warn!("approval.response failed: {e}");
                Some(error_frame(&e))
            }
        },
        ClientMessage::SessionsList {} => {
            match state.agent.store().list_sessions(100, 0) {
                Ok(sessions) => Some(json!({"type": "sessions.list", "sessions": sessions})),
                Err(e) => Some(error_frame(&crate::errors::PryxError::from(e))),
            }
        }
        ClientMessage::SessionResume { session_id } => {
            match state.agent.store().get_session(&session_id) {
                Ok(session) => {
                    watch_session(state, &session.id, event_tx, watched);
                    Some(json!({"type": "session.resumed", "session_id": session.id}))
                }
                Err(e) => Some(error_frame(&crate::errors::PryxError::from(e))),
            }
        }
    }
}

fn error_frame(e: &crate::errors::PryxError) -> Value {
    json!({
        "type": "error",
        "code": e.code(),
        "message": e.to_string(),
    })
}

/// Bus event → wire frame. The frame's `type` is the dotted topic name;
/// payload fields ride alongside.
fn event_frame(event: &SessionEvent) -> Value {
    let mut payload = serde_json::to_value(&event.payload).unwrap_or_else(|_| json!({}));
    if let Some(obj) = payload.as_object_mut() {
        obj.remove("type");
    }
    json!({
        "type": event.payload.topic(),
        "session_id": event.session_id,
        "seq": event.seq,
        "payload": payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventPayload;

    #[test]
    fn event_frame_uses_topic_names() {
        let event = SessionEvent {
            session_id: "s1".into(),
            seq: 7,
            payload: EventPayload::MessageDelta { text: "hi".into() },
        };
        let frame = event_frame(&event);
        assert_eq!(frame["type"], "message.delta");
        assert_eq!(frame["session_id"], "s1");
        assert_eq!(frame["seq"], 7);
        assert_eq!(frame["payload"]["text"], "hi");
        assert!(frame["payload"].get("type").is_none());
    }

    #[test]
    fn client_messages_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"chat.send","content":"hello"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::ChatSend { session_id: None, .. }));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"approval.response","approval_id":"a1","approved":true}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::ApprovalResponse { approved: true, .. }));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"sessions.list"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SessionsList {}));
    }
}
