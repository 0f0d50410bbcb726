use std::collections::BTreeMap;
use std::sync::Arc;

use peerview_ws_proto::ServerEvent;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::HubError;

/// Outbound half of a participant's live connection.
///
/// Cloning is cheap, all clones refer to the same connection. Closing cancels the
/// token the owning session waits on.
#[derive(Clone, Debug)]
pub struct Connection {
    id: u64,
    tx: mpsc::Sender<Arc<ServerEvent>>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(id: u64, tx: mpsc::Sender<Arc<ServerEvent>>) -> Self {
        Self {
            id,
            tx,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sender(&self) -> &mpsc::Sender<Arc<ServerEvent>> {
        &self.tx
    }

    /// Ask the owning session to shut down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`Connection::close`] was called on any clone.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

#[derive(Debug)]
pub struct Participant {
    identity: String,
    connection: Connection,
    last_seen: Instant,
}

impl Participant {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

/// Set of live identities at one point in time, ordered by identity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    users: Vec<String>,
}

impl MembershipSnapshot {
    pub fn contains(&self, identity: &str) -> bool {
        self.users
            .binary_search_by(|probe| probe.as_str().cmp(identity))
            .is_ok()
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn into_users(self) -> Vec<String> {
        self.users
    }
}

impl<S: Into<String>> FromIterator<S> for MembershipSnapshot {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut users = iter.into_iter().map(Into::into).collect::<Vec<_>>();
        users.sort();
        users.dedup();
        Self { users }
    }
}

#[derive(Debug)]
pub enum Registration {
    Registered,
    /// The identity was bound to another connection which is now replaced.
    Superseded(Connection),
}

/// Canonical map from identity to live connection.
///
/// Every mutation of the participant set publishes a fresh [`MembershipSnapshot`]
/// on a watch channel, readers never see a half-applied change.
#[derive(Debug)]
pub struct Registry {
    participants: BTreeMap<String, Participant>,
    members: watch::Sender<MembershipSnapshot>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (members, _) = watch::channel(MembershipSnapshot::default());
        Self {
            participants: BTreeMap::new(),
            members,
        }
    }

    pub fn register(&mut self, identity: &str, connection: Connection, now: Instant) -> Registration {
        let participant = Participant {
            identity: identity.to_owned(),
            connection,
            last_seen: now,
        };
        let prev = self.participants.insert(identity.to_owned(), participant);
        self.publish_membership();
        match prev {
            Some(prev) => Registration::Superseded(prev.connection),
            None => Registration::Registered,
        }
    }

    /// Removes the binding for `identity`, no-op if there is none.
    pub fn unregister(&mut self, identity: &str) -> Option<Participant> {
        let removed = self.participants.remove(identity);
        if removed.is_some() {
            self.publish_membership();
        }
        removed
    }

    /// Removes the binding only if it still belongs to connection `connection_id`.
    pub fn unregister_connection(&mut self, identity: &str, connection_id: u64) -> Option<Participant> {
        match self.participants.get(identity) {
            Some(p) if p.connection.id == connection_id => self.unregister(identity),
            _ => None,
        }
    }

    pub fn lookup(&self, identity: &str) -> Result<&Connection, HubError> {
        self.participants
            .get(identity)
            .map(|p| &p.connection)
            .ok_or_else(|| HubError::NotFound(identity.to_owned()))
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.participants.contains_key(identity)
    }

    /// Record liveness for `identity`.
    pub fn touch(&mut self, identity: &str, now: Instant) -> Result<(), HubError> {
        let participant = self
            .participants
            .get_mut(identity)
            .ok_or_else(|| HubError::NotRegistered(identity.to_owned()))?;
        participant.last_seen = now;
        Ok(())
    }

    pub fn snapshot(&self) -> MembershipSnapshot {
        self.members.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MembershipSnapshot> {
        self.members.subscribe()
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    fn publish_membership(&self) {
        let snapshot = MembershipSnapshot {
            users: self.participants.keys().cloned().collect(),
        };
        self.members.send_replace(snapshot);
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::{Connection, MembershipSnapshot, Registration, Registry};
    use crate::hub::HubError;

    fn conn(id: u64) -> Connection {
        let (tx, _) = mpsc::channel(1);
        Connection::new(id, tx)
    }

    #[test]
    fn snapshot_tracks_registrations() {
        let mut registry = Registry::new();
        let now = Instant::now();
        assert!(registry.snapshot().is_empty());
        registry.register("bob", conn(1), now);
        registry.register("alice", conn(2), now);
        assert_eq!(registry.snapshot().users(), ["alice", "bob"]);

        registry.unregister("bob");
        assert_eq!(registry.snapshot().users(), ["alice"]);
        assert!(!registry.snapshot().contains("bob"));
        assert!(registry.snapshot().contains("alice"));
    }

    #[test]
    fn reregister_supersedes() {
        let mut registry = Registry::new();
        let now = Instant::now();
        assert_matches!(registry.register("a", conn(1), now), Registration::Registered);
        let prev = assert_matches!(
            registry.register("a", conn(2), now),
            Registration::Superseded(prev) => prev
        );
        assert_eq!(prev.id(), 1);
        assert_eq!(registry.lookup("a").unwrap().id(), 2);
        assert_eq!(registry.snapshot().users(), ["a"]);
    }

    #[test]
    fn unregister_is_idempotent() {
        let mut registry = Registry::new();
        registry.register("a", conn(1), Instant::now());
        assert!(registry.unregister("a").is_some());
        assert!(registry.unregister("a").is_none());
        assert_matches!(registry.lookup("a"), Err(HubError::NotFound(id)) => assert_eq!(id, "a"));
    }

    #[test]
    fn stale_connection_does_not_unregister_reconnect() {
        let mut registry = Registry::new();
        let now = Instant::now();
        registry.register("a", conn(1), now);
        registry.register("a", conn(2), now);
        assert!(registry.unregister_connection("a", 1).is_none());
        assert!(registry.contains("a"));
        assert!(registry.unregister_connection("a", 2).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn touch_unknown_is_not_registered() {
        let mut registry = Registry::new();
        assert_matches!(
            registry.touch("ghost", Instant::now()),
            Err(HubError::NotRegistered(_))
        );
    }

    #[test]
    fn watchers_see_every_change() {
        let mut registry = Registry::new();
        let mut rx = registry.subscribe();
        registry.register("a", conn(1), Instant::now());
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().users(), ["a"]);
        registry.unregister("missing");
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn snapshot_from_iter_dedups() {
        let snapshot: MembershipSnapshot = ["b", "a", "b"].into_iter().collect();
        assert_eq!(snapshot.users(), ["a", "b"]);
        assert_eq!(snapshot.len(), 2);
    }

    /// Random register/unregister interleavings keep the snapshot equal to the live set.
    #[test]
    fn snapshot_matches_live_set() {
        let mut registry = Registry::new();
        let names = ["a", "b", "c", "d"];
        let mut live = std::collections::BTreeSet::new();
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        for i in 0..500u64 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let name = names[(state % names.len() as u64) as usize];
            if state & 0x100 == 0 {
                registry.register(name, conn(i), Instant::now());
                live.insert(name);
            } else {
                registry.unregister(name);
                live.remove(name);
            }
            let expected: Vec<_> = live.iter().map(|s| s.to_string()).collect();
            assert_eq!(registry.snapshot().users(), expected.as_slice());
        }
    }
}
