use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use peerview_ws_proto::{ClientEvent, ErrorReport, OnlineUsers, ServerEvent};
use serde::Serialize;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::hub::MembershipSnapshot;

/// Session side of a participant's connection.
///
/// Decoded client events come in through `inc`, anything put into `out` is
/// written to the socket by the transport task. The hub delivers into clones of
/// `out`.
pub struct ControlStream {
    inc: mpsc::Receiver<ClientEvent>,
    out: mpsc::Sender<Arc<ServerEvent>>,
}

impl ControlStream {
    pub fn new(inc: mpsc::Receiver<ClientEvent>, out: mpsc::Sender<Arc<ServerEvent>>) -> Self {
        Self { inc, out }
    }

    pub fn from_websocket(ws: WebSocket, capacity: usize, send_timeout: Duration) -> Self {
        let (forward_tx, forward_rx) = mpsc::channel(capacity);
        let (backward_tx, backward_rx) = mpsc::channel(capacity);
        tokio::spawn(async move {
            let fut = ControlStreamPriv::new(ws, forward_tx, backward_rx, send_timeout).run();
            match fut.await {
                Ok(_) => {
                    tracing::info!("WS task closed normally");
                }
                Err(e) => {
                    tracing::warn!("WS task errored out: {}", e);
                }
            }
        });
        Self::new(forward_rx, backward_tx)
    }

    /// Handle the hub delivers into.
    pub fn sender(&self) -> mpsc::Sender<Arc<ServerEvent>> {
        self.out.clone()
    }

    async fn send(&self, evt: ServerEvent) -> Result<(), ControlStreamError> {
        self.out
            .send(Arc::new(evt))
            .await
            .map_err(|_| ControlStreamError::DeadReceiver)
    }

    pub async fn online_users(&self, membership: MembershipSnapshot) -> Result<(), ControlStreamError> {
        self.send(ServerEvent::OnlineUsers(OnlineUsers {
            users: membership.into_users(),
        }))
        .await
    }

    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.inc.recv().await
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ControlStreamError {
    #[error("outgoing WS channel receiver died")]
    DeadReceiver,
}

struct ControlStreamPriv {
    ws: WebSocket,
    forward: mpsc::Sender<ClientEvent>,
    back: mpsc::Receiver<Arc<ServerEvent>>,
    send_timeout: Duration,
}

impl ControlStreamPriv {
    fn new(
        ws: WebSocket,
        forward: mpsc::Sender<ClientEvent>,
        back: mpsc::Receiver<Arc<ServerEvent>>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            ws,
            forward,
            back,
            send_timeout,
        }
    }

    async fn run(mut self) -> Result<(), PrivControlStreamError> {
        loop {
            let ws = self.ws.next();
            let back = self.back.recv();
            select! {
                ws_msg = ws => {
                    let msg = ws_msg.ok_or(PrivControlStreamError::StreamClosed)??;
                    if let ControlFlow::Stop = self.handle_incoming_message(msg).await? {
                        break;
                    }
                }
                back_msg = back => {
                    match back_msg {
                        Some(back_msg) => self.send_json(&*back_msg).await?,
                        None => {
                            tracing::debug!("session released the connection");
                            break;
                        }
                    }
                }
            }
        }
        self.back.close();
        let _ = timeout(self.send_timeout, self.ws.close()).await;
        Ok(())
    }

    async fn handle_incoming_message(
        &mut self,
        message: Message,
    ) -> Result<ControlFlow, PrivControlStreamError> {
        let bytes = match &message {
            Message::Close(_) => {
                tracing::debug!("received close");
                return Ok(ControlFlow::Stop);
            }
            Message::Ping(_) | Message::Pong(_) => return Ok(ControlFlow::Continue),
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data.as_slice(),
        };
        match serde_json::from_slice::<ClientEvent>(bytes) {
            Ok(evt) => {
                tracing::debug!(event = <&'static str>::from(&evt), "received");
                self.forward.send(evt).await?;
            }
            Err(e) => {
                tracing::warn!("malformed message: {}", e);
                self.send_json(&ServerEvent::Error(ErrorReport::invalid_json()))
                    .await?;
            }
        }
        Ok(ControlFlow::Continue)
    }

    async fn send_json<V: Serialize>(&mut self, payload: &V) -> Result<(), PrivControlStreamError> {
        let msg = Message::Text(serde_json::to_string(payload)?);
        timeout(self.send_timeout, self.ws.send(msg))
            .await
            .map_err(|_| PrivControlStreamError::SendTimeout)?
            .map_err(PrivControlStreamError::AxumError)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum PrivControlStreamError {
    #[error("timeout sending message")]
    SendTimeout,
    #[error("stream closed")]
    StreamClosed,
    #[error("stream error: {0}")]
    AxumError(#[from] axum::Error),
    #[error("serialization error: {0}")]
    Ser(#[from] serde_json::Error),
    #[error("internal receiver went away")]
    NoReceiver(#[from] mpsc::error::SendError<ClientEvent>),
}

enum ControlFlow {
    Continue,
    Stop,
}
