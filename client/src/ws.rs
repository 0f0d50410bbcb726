use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peerview_ws_proto::*;
use reqwest::Url;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;

/// Open the websocket for `identity` below `endpoint`, i.e. `{endpoint}/ws/{identity}`.
pub async fn connect(endpoint: &Url, identity: &str) -> Result<ControlStream, ControlStreamError> {
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .map_err(|_| ControlStreamError::InvalidEndpoint(endpoint.to_string()))?
        .pop_if_empty()
        .extend(["ws", identity]);
    tracing::debug!("connecting to {}", url);
    let (ws, _) = tokio_tungstenite::connect_async(url.to_string()).await?;
    Ok(ControlStream::new(ws))
}

pub struct ControlStream {
    inc: mpsc::Receiver<ServerEvent>,
    out: mpsc::Sender<ClientEvent>,
    stop: StopHandle,
}

impl ControlStream {
    pub fn new<T>(ws: WebSocketStream<T>) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (forward_tx, forward_rx) = mpsc::channel(32);
        let (backward_tx, backward_rx) = mpsc::channel(32);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let fut = ControlStreamPriv::new(ws, forward_tx, backward_rx, stop_rx).run();
            if let Err(e) = fut.await {
                tracing::error!("WS task errored out: {}", e);
            } else {
                tracing::info!("WS task closed normally");
            }
        });
        Self {
            inc: forward_rx,
            out: backward_tx,
            stop: StopHandle { stop_tx },
        }
    }

    /// Hand the channels to independent tasks, keeping the means to close the socket.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Sender<ClientEvent>,
        mpsc::Receiver<ServerEvent>,
        StopHandle,
    ) {
        (self.out, self.inc, self.stop)
    }
}

/// Closes the websocket of a [`ControlStream`].
pub struct StopHandle {
    stop_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl StopHandle {
    pub async fn stop(self) -> Result<(), ControlStreamError> {
        let (tx, rx) = oneshot::channel();
        timeout(Duration::from_millis(50), self.stop_tx.send(tx))
            .await
            .map_err(|_| ControlStreamError::ShutdownError)?
            .map_err(|_| ControlStreamError::ShutdownError)?;
        timeout(Duration::from_millis(50), rx)
            .await
            .map_err(|_| ControlStreamError::ShutdownError)?
            .map_err(|_| ControlStreamError::ShutdownError)?;
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ControlStreamError {
    #[error("graceful shutdown failed")]
    ShutdownError,
    #[error("cannot derive a websocket url from {0}")]
    InvalidEndpoint(String),
    #[error("connecting failed: {0}")]
    Connect(#[from] tungstenite::Error),
}

struct ControlStreamPriv<T> {
    ws: WebSocketStream<T>,
    forward: mpsc::Sender<ServerEvent>,
    back: mpsc::Receiver<ClientEvent>,
    send_timeout: Duration,
    stop_rx: mpsc::Receiver<oneshot::Sender<()>>,
}

impl<T> ControlStreamPriv<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        ws: WebSocketStream<T>,
        forward: mpsc::Sender<ServerEvent>,
        back: mpsc::Receiver<ClientEvent>,
        stop_rx: mpsc::Receiver<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            ws,
            send_timeout: Duration::from_millis(500),
            forward,
            back,
            stop_rx,
        }
    }

    #[tracing::instrument(skip_all)]
    async fn run(mut self) -> Result<(), PrivControlStreamError> {
        loop {
            let ws = self.ws.next();
            let back = self.back.recv();
            let stop = self.stop_rx.recv();
            select! {
                ws_msg = ws => {
                    let msg = ws_msg.ok_or_else(|| {
                        self.back.close();
                        PrivControlStreamError::StreamClosed
                    })??;
                    if msg.is_close() {
                        tracing::info!("server closed WS");
                        self.back.close();
                        break;
                    }
                    if !(msg.is_text() || msg.is_binary()) {
                        continue;
                    }
                    match msg.json::<ServerEvent>() {
                        Ok(evt) => self.forward.send(evt).await?,
                        Err(e) => tracing::warn!("dropping undecodable message: {}", e),
                    }
                },
                back_msg = back => {
                    match back_msg {
                        Some(msg) => {
                            tracing::trace!(event = <&'static str>::from(&msg), "sending");
                            self.send_json(&msg).await?;
                        },
                        None => {
                            tracing::debug!("Internal WS sender stopped");
                            self.close().await?;
                            break;
                        }
                    }
                }
                stop = stop => {
                    self.close().await?;
                    if let Some(rep) = stop {
                        let _ = rep.send(());
                    }
                    return Ok(())
                }
            }
        }
        Ok(())
    }

    async fn close(mut self) -> Result<(), PrivControlStreamError> {
        timeout(self.send_timeout, self.ws.close(None))
            .await
            .map_err(|_| PrivControlStreamError::SendTimeout)??;
        Ok(())
    }

    async fn send_json<V>(&mut self, payload: &V) -> Result<(), PrivControlStreamError>
    where
        V: Serialize,
    {
        let msg = tungstenite::Message::Text(serde_json::to_string(payload)?);

        timeout(self.send_timeout, self.ws.send(msg))
            .await
            .map_err(|_| PrivControlStreamError::SendTimeout)?
            .map_err(PrivControlStreamError::StreamError)?;
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
    StreamError(#[from] tungstenite::Error),
    #[error("serialization error: {0}")]
    Ser(#[from] serde_json::Error),
    #[error("internal receiver went away")]
    NoReceiver(#[from] mpsc::error::SendError<ServerEvent>),
}
