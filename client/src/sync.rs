use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use peerview_ws_proto::{
    ChatMessage, ClientEvent, ErrorReport, Image, OnlineUsers, OnlineUsersCheck, ServerEvent,
};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::capture::FrameSource;
use crate::ws::StopHandle;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerFrame {
    pub data: String,
    pub seq: Option<u64>,
}

/// What a participant currently shows: the latest frame per peer, who is
/// online and the chat so far.
#[derive(Clone, Debug, Default)]
pub struct ViewState {
    frames: HashMap<String, PeerFrame>,
    members: Vec<String>,
    /// Set once the first membership arrived, until then frames from anyone are shown.
    membership_known: bool,
    chat_log: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    Frame(String),
    /// Older than the frame already shown for that peer.
    StaleFrame(String),
    /// From a peer missing from the last membership received.
    Departed(String),
    Membership { dropped: Vec<String> },
    Chat(String),
    Error(String),
}

impl Applied {
    fn changed_view(&self) -> bool {
        !matches!(
            self,
            Applied::StaleFrame(_) | Applied::Departed(_) | Applied::Error(_)
        )
    }
}

impl ViewState {
    pub fn apply(&mut self, evt: ServerEvent) -> Applied {
        match evt {
            ServerEvent::Image(image) => self.apply_image(image),
            ServerEvent::OnlineUsers(OnlineUsers { users }) => self.apply_membership(users),
            ServerEvent::ChatMessage(msg) => self.apply_chat(msg),
            ServerEvent::Error(ErrorReport { error }) => {
                tracing::warn!("hub reported: {}", error);
                Applied::Error(error)
            }
        }
    }

    fn apply_image(&mut self, image: Image) -> Applied {
        let Image {
            data,
            username,
            seq,
        } = image;
        if self.membership_known && !self.members.contains(&username) {
            return Applied::Departed(username);
        }
        match self.frames.entry(username) {
            Entry::Occupied(mut shown) => {
                if let (Some(new), Some(old)) = (seq, shown.get().seq) {
                    if new <= old {
                        return Applied::StaleFrame(shown.key().clone());
                    }
                }
                *shown.get_mut() = PeerFrame { data, seq };
                Applied::Frame(shown.key().clone())
            }
            Entry::Vacant(slot) => {
                let identity = slot.key().clone();
                slot.insert(PeerFrame { data, seq });
                Applied::Frame(identity)
            }
        }
    }

    fn apply_membership(&mut self, users: Vec<String>) -> Applied {
        let mut dropped = Vec::new();
        self.frames.retain(|identity, _| {
            let keep = users.contains(identity);
            if !keep {
                dropped.push(identity.clone());
            }
            keep
        });
        dropped.sort();
        self.members = users;
        self.membership_known = true;
        Applied::Membership { dropped }
    }

    fn apply_chat(&mut self, msg: ChatMessage) -> Applied {
        let line = format!("{}: {}", msg.username, msg.content);
        self.chat_log.push(line.clone());
        Applied::Chat(line)
    }

    pub fn frame_for(&self, identity: &str) -> Option<&str> {
        self.frames.get(identity).map(|frame| frame.data.as_str())
    }

    pub fn frames(&self) -> &HashMap<String, PeerFrame> {
        &self.frames
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn chat_log(&self) -> &[String] {
        &self.chat_log
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.members.clear();
        self.membership_known = false;
        self.chat_log.clear();
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SyncConfig {
    pub heartbeat_interval: Duration,
    pub publish_interval: Duration,
    pub publish: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            publish_interval: Duration::from_millis(100),
            publish: true,
        }
    }
}

/// A logged-in participant.
///
/// Heartbeats, publishing and applying hub events run as independent tasks
/// until [`SyncClient::logout`] or until the hub closes the connection.
pub struct SyncClient {
    identity: String,
    out: mpsc::Sender<ClientEvent>,
    view: Arc<watch::Sender<ViewState>>,
    publishing: watch::Sender<bool>,
    has_source: bool,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    transport: Option<StopHandle>,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("identity", &self.identity)
            .field("publishing", &self.is_publishing())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl SyncClient {
    pub fn start(
        identity: String,
        out: mpsc::Sender<ClientEvent>,
        inc: mpsc::Receiver<ServerEvent>,
        source: Option<Box<dyn FrameSource>>,
        config: SyncConfig,
    ) -> Self {
        let stop = CancellationToken::new();
        let (view, _) = watch::channel(ViewState::default());
        let view = Arc::new(view);
        let has_source = source.is_some();
        if config.publish && !has_source {
            tracing::warn!("publishing requested without a frame source");
        }
        let (publishing, enabled) = watch::channel(config.publish);
        let mut tasks = vec![
            tokio::spawn(heartbeat_loop(
                out.clone(),
                identity.clone(),
                config.heartbeat_interval,
                stop.clone(),
            )),
            tokio::spawn(receive_loop(inc, view.clone(), stop.clone())),
        ];
        if let Some(source) = source {
            tasks.push(tokio::spawn(publish_loop(
                out.clone(),
                identity.clone(),
                source,
                config.publish_interval,
                enabled,
                stop.clone(),
            )));
        }
        Self {
            identity,
            out,
            view,
            publishing,
            has_source,
            stop,
            tasks,
            transport: None,
        }
    }

    /// Close `transport` on logout.
    pub fn with_transport(mut self, transport: StopHandle) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn view(&self) -> watch::Receiver<ViewState> {
        self.view.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        !self.stop.is_cancelled()
    }

    /// Resolves once the connection is gone.
    pub async fn closed(&self) {
        self.stop.cancelled().await
    }

    /// Turn publishing on or off, returns whether frames are sent from now on.
    pub fn set_publishing(&self, enabled: bool) -> bool {
        if enabled && !self.has_source {
            tracing::warn!("no frame source, nothing to publish");
            return false;
        }
        self.publishing.send_replace(enabled);
        enabled
    }

    pub fn is_publishing(&self) -> bool {
        self.has_source && *self.publishing.borrow()
    }

    pub async fn chat(&self, content: impl Into<String>) -> Result<(), crate::ClientError> {
        if !self.is_connected() {
            return Err(crate::ClientError::Disconnected);
        }
        self.out
            .send(ClientEvent::ChatMessage(ChatMessage {
                content: content.into(),
                username: self.identity.clone(),
            }))
            .await
            .map_err(|_| crate::ClientError::Disconnected)
    }

    /// Stop all loops, close the connection and forget everything shown.
    #[tracing::instrument(skip(self), fields(identity = %self.identity))]
    pub async fn logout(self) {
        let Self {
            out,
            view,
            stop,
            tasks,
            transport,
            ..
        } = self;
        stop.cancel();
        if let Some(transport) = transport {
            if let Err(e) = transport.stop().await {
                tracing::debug!("closing the connection: {}", e);
            }
        }
        drop(out);
        for res in join_all(tasks).await {
            if let Err(e) = res {
                tracing::warn!("sync task failed: {}", e);
            }
        }
        view.send_modify(ViewState::clear);
        tracing::info!("logged out");
    }
}

async fn heartbeat_loop(
    out: mpsc::Sender<ClientEvent>,
    identity: String,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            _ = stop.cancelled() => break,
            _ = ticks.tick() => {
                let check = ClientEvent::OnlineUsersCheck(OnlineUsersCheck {
                    username: identity.clone(),
                });
                if out.send(check).await.is_err() {
                    tracing::debug!("connection gone, heartbeat stops");
                    break;
                }
            }
        }
    }
}

async fn publish_loop(
    out: mpsc::Sender<ClientEvent>,
    identity: String,
    mut source: Box<dyn FrameSource>,
    period: Duration,
    enabled: watch::Receiver<bool>,
    stop: CancellationToken,
) {
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        select! {
            _ = stop.cancelled() => break,
            _ = ticks.tick() => {
                let on = *enabled.borrow();
                if !on {
                    continue;
                }
                let data = match source.capture() {
                    Ok(Some(data)) => data,
                    Ok(None) => {
                        tracing::trace!("no frame available");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("capturing frame failed: {:#}", e);
                        continue;
                    }
                };
                let image = ClientEvent::Image(Image {
                    data,
                    username: identity.clone(),
                    seq: None,
                });
                if out.send(image).await.is_err() {
                    tracing::debug!("connection gone, publishing stops");
                    break;
                }
            }
        }
    }
}

async fn receive_loop(
    mut inc: mpsc::Receiver<ServerEvent>,
    view: Arc<watch::Sender<ViewState>>,
    stop: CancellationToken,
) {
    loop {
        let evt = select! {
            _ = stop.cancelled() => break,
            evt = inc.recv() => evt,
        };
        match evt {
            Some(evt) => {
                view.send_if_modified(|state| {
                    let applied = state.apply(evt);
                    tracing::trace!(?applied, "applied hub event");
                    applied.changed_view()
                });
            }
            None => {
                tracing::info!("connection closed by hub");
                stop.cancel();
                break;
            }
        }
    }
}
