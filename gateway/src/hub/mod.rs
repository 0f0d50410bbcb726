pub mod cache;
pub mod presence;
pub mod registry;
pub mod router;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peerview_ws_proto::{ChatMessage, Image, OnlineUsers, ServerEvent};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use cache::{MediaCache, MediaRecord};
pub use presence::{Expired, Liveness, PresenceTracker};
pub use registry::{Connection, MembershipSnapshot, Registration, Registry};
pub use router::{Audience, Recipient, Router, Undelivered};

#[derive(thiserror::Error, Debug)]
pub enum HubError {
    #[error("{0} is not registered")]
    NotRegistered(String),
    #[error("no connection for {0}")]
    NotFound(String),
    #[error("delivery to {identity} failed: {reason}")]
    DeliveryFailure {
        identity: String,
        reason: &'static str,
    },
    #[error("connection lost")]
    ConnectionLost,
}

#[derive(Clone, Copy, Debug)]
pub struct HubConfig {
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub delivery_timeout: Duration,
    pub echo_chat_to_sender: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(2000),
            sweep_interval: Duration::from_millis(250),
            delivery_timeout: Duration::from_millis(500),
            echo_chat_to_sender: true,
        }
    }
}

struct HubState {
    registry: Registry,
    cache: MediaCache,
}

struct HubInner {
    state: RwLock<HubState>,
    members: watch::Receiver<MembershipSnapshot>,
    presence: PresenceTracker,
    router: Router,
    echo_chat_to_sender: bool,
    sweep_interval: Duration,
    next_connection: AtomicU64,
}

/// Shared presence and media relay state.
///
/// Registry and cache live behind a single lock so that registration, eviction,
/// publish and reconcile are applied atomically with respect to each other. The
/// lock is never held while delivering to peers.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("members", &*self.inner.members.borrow())
            .field("presence", &self.inner.presence)
            .field("router", &self.inner.router)
            .finish()
    }
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let registry = Registry::new();
        let members = registry.subscribe();
        Self {
            inner: Arc::new(HubInner {
                state: RwLock::new(HubState {
                    registry,
                    cache: MediaCache::new(),
                }),
                members,
                presence: PresenceTracker::new(config.heartbeat_timeout),
                router: Router::new(config.delivery_timeout),
                echo_chat_to_sender: config.echo_chat_to_sender,
                sweep_interval: config.sweep_interval,
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Bind `identity` to a new connection delivering into `tx`.
    ///
    /// A connection previously bound to the same identity is closed.
    #[tracing::instrument(skip(self, tx))]
    pub async fn register(&self, identity: &str, tx: mpsc::Sender<Arc<ServerEvent>>) -> Connection {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, tx);
        let mut state = self.inner.state.write().await;
        match state
            .registry
            .register(identity, connection.clone(), Instant::now())
        {
            Registration::Registered => {
                tracing::info!(connection = id, "registered");
            }
            Registration::Superseded(prev) => {
                tracing::info!(
                    connection = id,
                    superseded = prev.id(),
                    "reconnect supersedes previous connection"
                );
                prev.close();
            }
        }
        connection
    }

    /// Remove `identity` regardless of which connection holds it.
    #[tracing::instrument(skip(self))]
    pub async fn unregister(&self, identity: &str) {
        let mut state = self.inner.state.write().await;
        if let Some(participant) = state.registry.unregister(identity) {
            participant.connection().close();
            let membership = state.registry.snapshot();
            state.cache.reconcile(&membership);
            tracing::info!("unregistered");
        }
    }

    /// Remove the registration held by `connection`, if it still holds it.
    pub async fn disconnect(&self, identity: &str, connection: &Connection) {
        let mut state = self.inner.state.write().await;
        if state
            .registry
            .unregister_connection(identity, connection.id())
            .is_some()
        {
            let membership = state.registry.snapshot();
            state.cache.reconcile(&membership);
            tracing::info!(identity, connection = connection.id(), "disconnected");
        }
        connection.close();
    }

    pub async fn lookup(&self, identity: &str) -> Result<Connection, HubError> {
        self.inner
            .state
            .read()
            .await
            .registry
            .lookup(identity)
            .cloned()
    }

    /// Current membership, read without taking the state lock.
    pub fn snapshot(&self) -> MembershipSnapshot {
        self.inner.members.borrow().clone()
    }

    pub fn subscribe_membership(&self) -> watch::Receiver<MembershipSnapshot> {
        self.inner.members.clone()
    }

    /// Record a heartbeat and return the membership to answer it with.
    pub async fn heartbeat(&self, identity: &str) -> Result<MembershipSnapshot, HubError> {
        let mut state = self.inner.state.write().await;
        state.registry.touch(identity, Instant::now())?;
        Ok(state.registry.snapshot())
    }

    /// Cache a new payload for `identity` and relay it to every other participant.
    pub async fn publish(&self, identity: &str, payload: String) -> Result<MediaRecord, HubError> {
        let (record, recipients) = {
            let mut state = self.inner.state.write().await;
            state.registry.touch(identity, Instant::now())?;
            let HubState { registry, cache } = &mut *state;
            let record = cache.publish(registry, identity, payload)?.clone();
            let recipients = self
                .inner
                .router
                .recipients(registry, Audience::AllExcept(identity));
            (record, recipients)
        };
        tracing::trace!(seq = record.seq, peers = recipients.len(), "relaying image");
        let event = ServerEvent::Image(Image {
            data: record.payload.clone(),
            username: record.identity.clone(),
            seq: Some(record.seq),
        });
        self.fan_out(recipients, event).await;
        Ok(record)
    }

    /// Relay a chat line from `identity` to the current participants.
    pub async fn chat(&self, identity: &str, content: String) -> Result<(), HubError> {
        let recipients = {
            let mut state = self.inner.state.write().await;
            state.registry.touch(identity, Instant::now())?;
            let audience = if self.inner.echo_chat_to_sender {
                Audience::Everyone
            } else {
                Audience::AllExcept(identity)
            };
            self.inner.router.recipients(&state.registry, audience)
        };
        tracing::debug!(peers = recipients.len(), "relaying chat message");
        let event = ServerEvent::ChatMessage(ChatMessage {
            content,
            username: identity.to_owned(),
        });
        self.fan_out(recipients, event).await;
        Ok(())
    }

    /// Send the current membership to every participant.
    pub async fn broadcast_membership(&self) {
        let (membership, recipients) = {
            let state = self.inner.state.read().await;
            let recipients = self
                .inner
                .router
                .recipients(&state.registry, Audience::Everyone);
            (state.registry.snapshot(), recipients)
        };
        tracing::debug!(members = membership.len(), "broadcasting membership");
        let event = ServerEvent::OnlineUsers(OnlineUsers {
            users: membership.into_users(),
        });
        self.fan_out(recipients, event).await;
    }

    pub async fn current_for(&self, identity: &str) -> Option<MediaRecord> {
        self.inner
            .state
            .read()
            .await
            .cache
            .current_for(identity)
            .cloned()
    }

    /// Evict every participant whose liveness timed out at `now`.
    pub async fn sweep(&self, now: Instant) -> Vec<Expired> {
        let mut state = self.inner.state.write().await;
        let expired = self.inner.presence.expired(&state.registry, now);
        if expired.is_empty() {
            return expired;
        }
        for stale in &expired {
            if let Some(participant) = state
                .registry
                .unregister_connection(&stale.identity, stale.connection_id)
            {
                tracing::info!(
                    identity = %stale.identity,
                    idle_ms = stale.idle.as_millis() as u64,
                    "evicting stale participant"
                );
                participant.connection().close();
            }
        }
        let membership = state.registry.snapshot();
        state.cache.reconcile(&membership);
        expired
    }

    async fn fan_out(&self, recipients: Vec<Recipient>, event: ServerEvent) {
        let failed = self.inner.router.deliver(recipients, Arc::new(event)).await;
        if failed.is_empty() {
            return;
        }
        let mut state = self.inner.state.write().await;
        for Undelivered { recipient, error } in failed {
            if let Some(participant) = state
                .registry
                .unregister_connection(&recipient.identity, recipient.connection.id())
            {
                tracing::info!(identity = %recipient.identity, "unregistering after {}", error);
                participant.connection().close();
            }
        }
        let membership = state.registry.snapshot();
        state.cache.reconcile(&membership);
    }

    /// Spawn the liveness sweeper and the membership broadcaster.
    ///
    /// The task stops once every [`Hub`] handle is gone.
    pub fn spawn_background(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let mut members = self.subscribe_membership();
        let mut sweep = tokio::time::interval(self.inner.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let hub = Hub { inner };
                        hub.sweep(Instant::now()).await;
                    }
                    changed = members.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let Some(inner) = weak.upgrade() else { break };
                        Hub { inner }.broadcast_membership().await;
                    }
                }
            }
            tracing::debug!("hub background task stopped");
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use peerview_ws_proto::{Image, OnlineUsers, ServerEvent};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::{Hub, HubConfig, HubError};

    fn hub() -> Hub {
        Hub::new(HubConfig::default())
    }

    async fn join(hub: &Hub, name: &str) -> (super::Connection, mpsc::Receiver<Arc<ServerEvent>>) {
        let (tx, rx) = mpsc::channel(16);
        (hub.register(name, tx).await, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn publish_relays_to_others_only() {
        let hub = hub();
        let (_a, mut a_rx) = join(&hub, "a").await;
        let (_b, mut b_rx) = join(&hub, "b").await;

        let record = hub.publish("a", "img1".into()).await.unwrap();
        assert_eq!(hub.current_for("a").await, Some(record.clone()));
        assert_matches!(b_rx.recv().await.as_deref(), Some(ServerEvent::Image(Image { data, username, seq })) => {
            assert_eq!(data, "img1");
            assert_eq!(username, "a");
            assert_eq!(*seq, Some(record.seq));
        });
        assert_matches!(a_rx.try_recv(), Err(_));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_requires_registration() {
        let hub = hub();
        assert_matches!(
            hub.publish("ghost", "x".into()).await,
            Err(HubError::NotRegistered(_))
        );
        assert_eq!(hub.current_for("ghost").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn chat_echoes_to_sender() {
        let hub = hub();
        let (_a, mut a_rx) = join(&hub, "a").await;
        let (_b, mut b_rx) = join(&hub, "b").await;
        hub.chat("b", "hello".into()).await.unwrap();
        for rx in [&mut a_rx, &mut b_rx] {
            assert_matches!(rx.recv().await.as_deref(), Some(ServerEvent::ChatMessage(m)) => {
                assert_eq!(m.username, "b");
                assert_eq!(m.content, "hello");
            });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn chat_without_echo() {
        let hub = Hub::new(HubConfig {
            echo_chat_to_sender: false,
            ..HubConfig::default()
        });
        let (_a, mut a_rx) = join(&hub, "a").await;
        let (_b, mut b_rx) = join(&hub, "b").await;
        hub.chat("b", "hello".into()).await.unwrap();
        assert_matches!(a_rx.recv().await.as_deref(), Some(ServerEvent::ChatMessage(_)));
        assert_matches!(b_rx.try_recv(), Err(_));
    }

    #[tokio::test(start_paused = true)]
    async fn chat_order_per_sender() {
        let hub = hub();
        let (_a, mut a_rx) = join(&hub, "a").await;
        for i in 0..5 {
            hub.chat("a", format!("m{i}")).await.unwrap();
        }
        for i in 0..5 {
            assert_matches!(a_rx.recv().await.as_deref(), Some(ServerEvent::ChatMessage(m)) => {
                assert_eq!(m.content, format!("m{i}"));
            });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_silent_participants() {
        let hub = hub();
        let (a, _a_rx) = join(&hub, "a").await;
        let (_b, _b_rx) = join(&hub, "b").await;
        hub.publish("a", "img".into()).await.unwrap();

        tokio::time::advance(Duration::from_millis(1500)).await;
        hub.heartbeat("b").await.unwrap();
        assert!(hub.sweep(Instant::now()).await.is_empty());

        tokio::time::advance(Duration::from_millis(1000)).await;
        let expired = hub.sweep(Instant::now()).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].identity, "a");
        assert!(a.is_closed());
        assert_eq!(hub.snapshot().users(), ["b"]);
        assert_eq!(hub.current_for("a").await, None);
        assert_matches!(hub.heartbeat("a").await, Err(HubError::NotRegistered(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_is_idempotent() {
        let hub = hub();
        let (a, _a_rx) = join(&hub, "a").await;
        hub.publish("a", "img".into()).await.unwrap();

        hub.unregister("a").await;
        hub.unregister("a").await;
        assert!(a.is_closed());
        assert!(hub.snapshot().is_empty());
        assert_eq!(hub.current_for("a").await, None);
        assert_matches!(hub.lookup("a").await, Err(HubError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn publish_racing_eviction_leaves_no_record() {
        let hub = hub();
        for _ in 0..100 {
            let (tx, _watcher_rx) = mpsc::channel(64);
            let _watcher = hub.register("watcher", tx).await;
            let (_a, _a_rx) = join(&hub, "a").await;
            let publishers = (0..50)
                .map(|i| {
                    let hub = hub.clone();
                    tokio::spawn(async move { hub.publish("a", format!("img{i}")).await })
                })
                .collect::<Vec<_>>();
            let sweeper = {
                let hub = hub.clone();
                tokio::spawn(async move {
                    // far enough ahead that "a" is stale no matter when it was touched
                    hub.sweep(Instant::now() + Duration::from_secs(3600)).await
                })
            };
            for publisher in publishers {
                assert_matches!(
                    publisher.await.unwrap(),
                    Ok(_) | Err(HubError::NotRegistered(_))
                );
            }
            sweeper.await.unwrap();

            assert!(hub.snapshot().is_empty());
            assert_eq!(hub.current_for("a").await, None);
            assert_matches!(hub.publish("a", "late".into()).await, Err(HubError::NotRegistered(_)));
            assert_eq!(hub.current_for("a").await, None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_closes_previous_connection() {
        let hub = hub();
        let (first, _rx1) = join(&hub, "a").await;
        let (second, _rx2) = join(&hub, "a").await;
        assert!(first.is_closed());
        assert!(!second.is_closed());

        // the old session ending must not remove the new registration
        hub.disconnect("a", &first).await;
        assert_eq!(hub.snapshot().users(), ["a"]);
        assert_eq!(hub.lookup("a").await.unwrap().id(), second.id());

        hub.disconnect("a", &second).await;
        assert!(hub.snapshot().is_empty());
        assert_matches!(hub.lookup("a").await, Err(HubError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_unregisters_recipient() {
        let hub = hub();
        let (_a, _a_rx) = join(&hub, "a").await;
        let (b, b_rx) = join(&hub, "b").await;
        hub.publish("b", "img".into()).await.unwrap();
        drop(b_rx);
        hub.publish("a", "img".into()).await.unwrap();
        assert!(b.is_closed());
        assert_eq!(hub.snapshot().users(), ["a"]);
        assert_eq!(hub.current_for("b").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn background_broadcasts_membership_and_evicts() {
        let hub = hub();
        let task = hub.spawn_background();
        let (_a, mut a_rx) = join(&hub, "a").await;
        assert_matches!(a_rx.recv().await.as_deref(), Some(ServerEvent::OnlineUsers(OnlineUsers { users })) => {
            assert_eq!(users, &["a"]);
        });
        let (_b, mut b_rx) = join(&hub, "b").await;
        assert_matches!(b_rx.recv().await.as_deref(), Some(ServerEvent::OnlineUsers(OnlineUsers { users })) => {
            assert_eq!(users, &["a", "b"]);
        });

        // b keeps beating, a goes silent
        let beats = {
            let hub = hub.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(500));
                loop {
                    tick.tick().await;
                    if hub.heartbeat("b").await.is_err() {
                        break;
                    }
                }
            })
        };
        let users = loop {
            match b_rx.recv().await.as_deref() {
                Some(ServerEvent::OnlineUsers(OnlineUsers { users })) if users.len() == 1 => {
                    break users.clone()
                }
                Some(_) => continue,
                None => panic!("b was disconnected"),
            }
        };
        assert_eq!(users, ["b"]);
        assert!(hub.snapshot().contains("b"));

        beats.abort();
        task.abort();
    }
}
