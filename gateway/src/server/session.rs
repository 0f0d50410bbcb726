use axum::extract::ws::WebSocket;
use peerview_ws_proto::{ChatMessage, ClientEvent, Image};
use tokio::select;

use super::ws::{ControlStream, ControlStreamError};
use crate::hub::{Connection, Hub, HubError};
use crate::TransportConfig;

impl From<ControlStreamError> for HubError {
    fn from(_: ControlStreamError) -> Self {
        HubError::ConnectionLost
    }
}

/// A participant's connection to the hub.
///
/// Registered for as long as the session runs. The session ends when the client
/// goes away or the hub closes the connection (reconnect elsewhere, eviction).
pub struct ServerSession {
    identity: String,
    ctl: ControlStream,
    connection: Connection,
    hub: Hub,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("identity", &self.identity)
            .field("connection", &self.connection.id())
            .field("ctl", &"{CONTROL_STREAM}")
            .field("hub", &self.hub)
            .finish()
    }
}

impl ServerSession {
    /// Register `identity` on the hub for the given websocket.
    #[tracing::instrument(skip(ws, hub, transport))]
    pub async fn init_websocket(
        ws: WebSocket,
        identity: String,
        hub: Hub,
        transport: TransportConfig,
    ) -> Self {
        let ctl = ControlStream::from_websocket(ws, transport.channel_capacity, transport.send_timeout);
        Self::init(ctl, identity, hub).await
    }

    pub async fn init(ctl: ControlStream, identity: String, hub: Hub) -> Self {
        let connection = hub.register(&identity, ctl.sender()).await;
        Self {
            identity,
            ctl,
            connection,
            hub,
        }
    }

    /// Run the session to completion and release the registration.
    #[tracing::instrument(skip(self), fields(identity = %self.identity, connection = self.connection.id()))]
    pub async fn run_session(mut self) -> anyhow::Result<()> {
        tracing::info!("session running");
        let res = self.event_loop().await;
        self.hub.disconnect(&self.identity, &self.connection).await;
        res.map_err(Into::into)
    }

    async fn event_loop(&mut self) -> Result<(), HubError> {
        loop {
            let closed = self.connection.closed();
            let evt = self.ctl.next_event();
            select! {
                _ = closed => {
                    tracing::info!("connection closed by hub");
                    return Ok(());
                }
                evt = evt => match evt {
                    Some(evt) => self.handle_event(evt).await?,
                    None => {
                        tracing::info!("client went away");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn handle_event(&self, evt: ClientEvent) -> Result<(), HubError> {
        match evt {
            ClientEvent::Image(Image { data, .. }) => {
                match self.hub.publish(&self.identity, data).await {
                    Ok(record) => tracing::trace!(seq = record.seq, "published"),
                    Err(e) => tracing::debug!("dropping publish: {}", e),
                }
            }
            ClientEvent::OnlineUsersCheck(_) => match self.hub.heartbeat(&self.identity).await {
                Ok(membership) => self.ctl.online_users(membership).await?,
                Err(e) => tracing::debug!("dropping heartbeat: {}", e),
            },
            ClientEvent::ChatMessage(ChatMessage { content, .. }) => {
                if let Err(e) = self.hub.chat(&self.identity, content).await {
                    tracing::debug!("dropping chat message: {}", e);
                }
            }
        }
        Ok(())
    }
}
