//! Signaling over the coordinator's HTTP API and per-call WebSocket.
//!
//! `join`, `leave` and `end` are plain JSON requests. A successful join opens
//! `/v1/calls/{call_id}/signal`; one pump task per call forwards outbound
//! envelopes as text frames and decodes inbound frames into [`ServerEvent`]s.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use parley_shared::{
    CallError, CallId, EventStream, JoinResponse, RoomId, ServerEvent, SignalingMessage,
    SignalingTransport, UserId,
};

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

/// What a request was about, used to rebuild typed errors.
struct Scope<'a> {
    room: Option<&'a RoomId>,
    call: Option<CallId>,
    user: &'a UserId,
}

impl Scope<'_> {
    fn error(&self, body: ErrorBody) -> CallError {
        match (body.code.as_str(), self.room, self.call) {
            ("room_not_found", Some(room), _) => CallError::RoomNotFound(room.clone()),
            ("room_full", Some(room), _) => CallError::RoomFull(room.clone()),
            ("call_not_found", _, Some(call)) => CallError::CallNotFound(call),
            ("already_joined", ..) => CallError::AlreadyJoined(self.user.clone()),
            ("not_a_participant", ..) => CallError::NotAParticipant(self.user.clone()),
            ("forbidden", ..) => CallError::Forbidden(body.error),
            ("malformed", ..) | ("bad_request", ..) => CallError::Malformed(body.error),
            ("coordinator_unavailable", ..) => CallError::CoordinatorUnavailable,
            _ => CallError::Transport(body.error),
        }
    }
}

pub struct WsTransport {
    base: Url,
    http: Client,
    outbound: Mutex<HashMap<(CallId, UserId), mpsc::UnboundedSender<String>>>,
}

impl WsTransport {
    pub fn new(server_url: &str) -> Result<Self, CallError> {
        let base = Url::parse(server_url)
            .map_err(|e| CallError::Transport(format!("invalid server url {server_url}: {e}")))?;
        Ok(Self {
            base,
            http: Client::new(),
            outbound: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, CallError> {
        self.base
            .join(path)
            .map_err(|e| CallError::Transport(e.to_string()))
    }

    fn signal_url(&self, call_id: &CallId, user_id: &UserId) -> Result<Url, CallError> {
        let mut url = self.endpoint(&format!("/v1/calls/{call_id}/signal"))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| CallError::Transport(format!("cannot use {scheme} for {url}")))?;
        url.query_pairs_mut()
            .append_pair("user_id", user_id.as_str());
        Ok(url)
    }

    async fn post(
        &self,
        path: &str,
        user_id: &UserId,
        scope: Scope<'_>,
    ) -> Result<reqwest::Response, CallError> {
        let response = self
            .http
            .post(self.endpoint(path)?)
            .json(&serde_json::json!({ "user_id": user_id }))
            .send()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => Err(scope.error(body)),
            Err(_) if status == StatusCode::SERVICE_UNAVAILABLE => {
                Err(CallError::CoordinatorUnavailable)
            }
            Err(_) => Err(CallError::Transport(format!("HTTP {status}"))),
        }
    }

    fn channel(&self, call_id: CallId, user_id: &UserId) -> Option<mpsc::UnboundedSender<String>> {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(call_id, user_id.clone()))
            .cloned()
    }

    fn close_channel(&self, call_id: CallId, user_id: &UserId) {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(call_id, user_id.clone()));
    }
}

#[async_trait]
impl SignalingTransport for WsTransport {
    async fn join(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<(JoinResponse, EventStream), CallError> {
        let scope = Scope {
            room: Some(room_id),
            call: None,
            user: user_id,
        };
        let response: JoinResponse = self
            .post(&format!("/v1/rooms/{room_id}/join"), user_id, scope)
            .await?
            .json()
            .await
            .map_err(|e| CallError::Malformed(e.to_string()))?;

        let url = self.signal_url(&response.call_id, user_id)?;
        let socket = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                // The REST join already added us; don't linger until the
                // liveness window runs out.
                warn!(call = %response.call_id, error = %e, "Signaling socket failed, leaving call");
                let scope = Scope {
                    room: None,
                    call: Some(response.call_id),
                    user: user_id,
                };
                let leave = format!("/v1/calls/{}/leave", response.call_id);
                if let Err(leave_err) = self.post(&leave, user_id, scope).await {
                    warn!(call = %response.call_id, error = %leave_err, "Leave after failed join also failed");
                }
                return Err(CallError::Transport(format!("signaling socket: {e}")));
            }
        };
        info!(call = %response.call_id, "Signaling channel connected");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((response.call_id, user_id.clone()), out_tx);

        let call_id = response.call_id;
        let (mut sink, mut stream) = socket.split();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => {
                        let Some(text) = outgoing else {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        };
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!(call = %call_id, error = %e, "Signaling send failed");
                            break;
                        }
                    }
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => match ServerEvent::from_json(&text) {
                            Ok(event) => {
                                if event_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!(error = %e, "Dropping unparseable server event"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(call = %call_id, error = %e, "Signaling socket error");
                            break;
                        }
                    }
                }
            }
            debug!(call = %call_id, "Signaling channel closed");
        });

        Ok((response, event_rx))
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), CallError> {
        let channel = self
            .channel(message.call_id, &message.sender)
            .ok_or_else(|| CallError::NotAParticipant(message.sender.clone()))?;
        let text = message
            .to_json()
            .map_err(|e| CallError::Malformed(e.to_string()))?;
        channel
            .send(text)
            .map_err(|_| CallError::Transport("signaling channel closed".into()))
    }

    async fn leave(&self, call_id: &CallId, user_id: &UserId) -> Result<(), CallError> {
        let scope = Scope {
            room: None,
            call: Some(*call_id),
            user: user_id,
        };
        let result = self
            .post(&format!("/v1/calls/{call_id}/leave"), user_id, scope)
            .await;
        self.close_channel(*call_id, user_id);
        result.map(|_| ())
    }

    async fn end(&self, call_id: &CallId, user_id: &UserId) -> Result<(), CallError> {
        let scope = Scope {
            room: None,
            call: Some(*call_id),
            user: user_id,
        };
        self.post(&format!("/v1/calls/{call_id}/end"), user_id, scope)
            .await?;
        self.close_channel(*call_id, user_id);
        Ok(())
    }
}
