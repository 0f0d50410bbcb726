use std::time::Duration;

use tokio::time::Instant;

use super::registry::Registry;

/// Liveness of a registered participant.
///
/// `Active` on registration and after every heartbeat or publish, `Stale` once
/// no sign of life arrived within the timeout. Stale participants get evicted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Active,
    Stale,
}

/// Stale participant found by a sweep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expired {
    pub identity: String,
    pub connection_id: u64,
    pub idle: Duration,
}

#[derive(Clone, Copy, Debug)]
pub struct PresenceTracker {
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn liveness(&self, last_seen: Instant, now: Instant) -> Liveness {
        if now.saturating_duration_since(last_seen) > self.timeout {
            Liveness::Stale
        } else {
            Liveness::Active
        }
    }

    /// Participants of `registry` that turned stale at `now`.
    pub fn expired(&self, registry: &Registry, now: Instant) -> Vec<Expired> {
        registry
            .participants()
            .filter(|p| self.liveness(p.last_seen(), now) == Liveness::Stale)
            .map(|p| Expired {
                identity: p.identity().to_owned(),
                connection_id: p.connection().id(),
                idle: now.saturating_duration_since(p.last_seen()),
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::{Liveness, PresenceTracker};
    use crate::hub::registry::{Connection, Registry};

    #[test]
    fn timeout_boundary() {
        let tracker = PresenceTracker::new(Duration::from_millis(2000));
        let seen = Instant::now();
        assert_eq!(tracker.liveness(seen, seen), Liveness::Active);
        assert_eq!(
            tracker.liveness(seen, seen + Duration::from_millis(2000)),
            Liveness::Active
        );
        assert_eq!(
            tracker.liveness(seen, seen + Duration::from_millis(2001)),
            Liveness::Stale
        );
    }

    #[test]
    fn clock_skew_is_active() {
        let tracker = PresenceTracker::new(Duration::from_millis(10));
        let now = Instant::now();
        assert_eq!(
            tracker.liveness(now + Duration::from_secs(1), now),
            Liveness::Active
        );
    }

    #[test]
    fn touch_returns_to_active() {
        let tracker = PresenceTracker::new(Duration::from_millis(100));
        let mut registry = Registry::new();
        let start = Instant::now();
        let (tx, _) = mpsc::channel(1);
        registry.register("a", Connection::new(3, tx), start);
        let (tx, _) = mpsc::channel(1);
        registry.register("b", Connection::new(4, tx), start);

        let later = start + Duration::from_millis(150);
        registry.touch("b", later).unwrap();
        let expired = tracker.expired(&registry, later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].identity, "a");
        assert_eq!(expired[0].connection_id, 3);
        assert_eq!(expired[0].idle, Duration::from_millis(150));
    }
}
