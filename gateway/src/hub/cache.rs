use std::collections::hash_map::Entry;
use std::collections::HashMap;

use super::registry::{MembershipSnapshot, Registry};
use super::HubError;

/// Latest published artifact of one participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaRecord {
    pub identity: String,
    pub payload: String,
    pub seq: u64,
}

/// Per-participant latest media, keyed by the registry's identities.
///
/// Only the newest payload is kept, so memory is bounded by the number of
/// registered participants. Sequence numbers are issued here and never reused.
#[derive(Debug, Default)]
pub struct MediaCache {
    records: HashMap<String, MediaRecord>,
    seq: u64,
}

impl MediaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the record of `identity`, rejecting identities the registry doesn't know.
    pub fn publish(
        &mut self,
        registry: &Registry,
        identity: &str,
        payload: String,
    ) -> Result<&MediaRecord, HubError> {
        if !registry.contains(identity) {
            return Err(HubError::NotRegistered(identity.to_owned()));
        }
        self.seq += 1;
        let record = MediaRecord {
            identity: identity.to_owned(),
            payload,
            seq: self.seq,
        };
        let slot = match self.records.entry(identity.to_owned()) {
            Entry::Occupied(mut o) => {
                o.insert(record);
                o.into_mut()
            }
            Entry::Vacant(v) => v.insert(record),
        };
        Ok(slot)
    }

    pub fn current_for(&self, identity: &str) -> Option<&MediaRecord> {
        self.records.get(identity)
    }

    /// Drops every record whose identity is not part of `membership`.
    ///
    /// Returns the identities that were dropped.
    pub fn reconcile(&mut self, membership: &MembershipSnapshot) -> Vec<String> {
        let mut dropped = Vec::new();
        self.records.retain(|identity, _| {
            let keep = membership.contains(identity);
            if !keep {
                dropped.push(identity.clone());
            }
            keep
        });
        dropped
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::MediaCache;
    use crate::hub::registry::{Connection, MembershipSnapshot, Registry};
    use crate::hub::HubError;

    fn registry_with(names: &[&str]) -> Registry {
        let mut registry = Registry::new();
        for (i, name) in names.iter().enumerate() {
            let (tx, _) = mpsc::channel(1);
            registry.register(name, Connection::new(i as u64, tx), Instant::now());
        }
        registry
    }

    #[test]
    fn last_write_wins() {
        let registry = registry_with(&["a"]);
        let mut cache = MediaCache::new();
        let first = cache.publish(&registry, "a", "p1".into()).unwrap().seq;
        let second = cache.publish(&registry, "a", "p2".into()).unwrap().seq;
        assert!(second > first);
        let current = cache.current_for("a").unwrap();
        assert_eq!(current.payload, "p2");
        assert_eq!(current.seq, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unregistered_publish_is_rejected() {
        let registry = registry_with(&["a"]);
        let mut cache = MediaCache::new();
        assert_matches!(
            cache.publish(&registry, "ghost", "p".into()),
            Err(HubError::NotRegistered(id)) => assert_eq!(id, "ghost")
        );
        assert!(cache.current_for("ghost").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn reconcile_keeps_members_only() {
        let registry = registry_with(&["a", "b", "c"]);
        let mut cache = MediaCache::new();
        for id in ["a", "b", "c"] {
            cache.publish(&registry, id, format!("{id}-img")).unwrap();
        }
        let before_b = cache.current_for("b").cloned();

        let membership: MembershipSnapshot = ["b"].into_iter().collect();
        let mut dropped = cache.reconcile(&membership);
        dropped.sort();
        assert_eq!(dropped, ["a", "c"]);
        assert!(cache.current_for("a").is_none());
        assert!(cache.current_for("c").is_none());
        assert_eq!(cache.current_for("b").cloned(), before_b);
    }

    #[test]
    fn sequence_is_monotonic_across_identities() {
        let registry = registry_with(&["a", "b"]);
        let mut cache = MediaCache::new();
        let s1 = cache.publish(&registry, "a", "x".into()).unwrap().seq;
        let s2 = cache.publish(&registry, "b", "x".into()).unwrap().seq;
        cache.reconcile(&["b"].into_iter().collect());
        let s3 = cache.publish(&registry, "a", "y".into()).unwrap().seq;
        assert!(s1 < s2 && s2 < s3);
    }
}
