//! Deduplication of concurrent, identical requests.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::cache_key::RequestKey;
use crate::error::CoalescerError;
use crate::types::{BatchId, RequestId};

/// The outcome of one execution, as shared between its owner and all followers.
#[derive(Debug, Clone, PartialEq)]
pub struct Shared {
    pub data: Value,
    pub batch_id: Option<BatchId>,
    /// The number of followers that were attached when the execution resolved.
    pub coalesced_count: usize,
}

pub type SharedOutcome = Result<Shared, CoalescerError>;

/// The result of [`Deduplicator::claim`].
#[derive(Debug)]
pub enum Claim {
    /// The caller is the first for this key within the window and must eventually resolve or
    /// reject it.
    Owner,
    /// An identical request is in flight; the receiver yields its outcome.
    Follower(oneshot::Receiver<SharedOutcome>),
}

type Follower = (RequestId, oneshot::Sender<SharedOutcome>);

#[derive(Debug)]
struct InFlight {
    owner: RequestId,
    claimed_at: Instant,
    followers: Vec<Follower>,
}

impl InFlight {
    fn new(owner: RequestId) -> Self {
        Self {
            owner,
            claimed_at: Instant::now(),
            followers: Vec::new(),
        }
    }
}

/// Maps identity keys to the single in-flight execution serving them.
///
/// Once an owner resolves or rejects, its key is removed, and the next identical request
/// starts a fresh execution. Keeping results around is the job of the
/// [`CacheStore`](crate::caching::CacheStore).
///
/// When an owner outlives its window, the next identical request takes over the key. The
/// previous owner keeps serving the followers it already has.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    in_flight: HashMap<RequestKey, InFlight>,
    /// Owners that lost their key to a newer owner, by owner id.
    superseded: HashMap<RequestId, InFlight>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            in_flight: HashMap::new(),
            superseded: HashMap::new(),
        }
    }

    /// Claims `key` for the request `id`, or attaches to an existing owner.
    pub fn claim(&mut self, key: &RequestKey, id: RequestId) -> Claim {
        let now = Instant::now();
        match self.in_flight.get_mut(key) {
            Some(in_flight) if now.duration_since(in_flight.claimed_at) <= self.window => {
                let (sender, receiver) = oneshot::channel();
                in_flight.followers.push((id, sender));
                tracing::trace!(%key, owner = %in_flight.owner, "Attached to in-flight request");
                Claim::Follower(receiver)
            }
            Some(in_flight) => {
                let previous = std::mem::replace(in_flight, InFlight::new(id));
                tracing::trace!(
                    %key,
                    previous = %previous.owner,
                    owner = %id,
                    "Deduplication window elapsed, taking over key"
                );
                self.superseded.insert(previous.owner, previous);
                Claim::Owner
            }
            None => {
                self.in_flight.insert(key.clone(), InFlight::new(id));
                Claim::Owner
            }
        }
    }

    /// Delivers `outcome` to every follower of `owner` and releases its key.
    ///
    /// Does nothing unless `owner` actually owns the key. Returns the number of followers,
    /// which is also stored in the delivered [`Shared::coalesced_count`].
    pub fn resolve(&mut self, key: &RequestKey, owner: RequestId, mut outcome: Shared) -> usize {
        let Some(in_flight) = self.take(key, owner) else {
            return 0;
        };

        let count = in_flight.followers.len();
        outcome.coalesced_count = count;
        // followers are notified in the order they attached
        for (_, follower) in in_flight.followers {
            follower.send(Ok(outcome.clone())).ok();
        }
        count
    }

    /// Rejects every follower of `owner` with `error` and releases its key.
    ///
    /// Returns the ids of the rejected followers.
    pub fn reject(
        &mut self,
        key: &RequestKey,
        owner: RequestId,
        error: CoalescerError,
    ) -> Vec<RequestId> {
        let Some(in_flight) = self.take(key, owner) else {
            return Vec::new();
        };

        let mut ids = Vec::with_capacity(in_flight.followers.len());
        for (id, follower) in in_flight.followers {
            follower.send(Err(error.clone())).ok();
            ids.push(id);
        }
        ids
    }

    /// Detaches a single follower, which then no longer counts towards its owner.
    pub fn detach(&mut self, key: &RequestKey, id: RequestId) {
        let in_flight = self
            .in_flight
            .get_mut(key)
            .filter(|in_flight| in_flight.followers.iter().any(|(f, _)| *f == id));
        if let Some(in_flight) = in_flight {
            in_flight.followers.retain(|(f, _)| *f != id);
            return;
        }
        for in_flight in self.superseded.values_mut() {
            in_flight.followers.retain(|(f, _)| *f != id);
        }
    }

    /// Rejects all in-flight keys, used on teardown.
    pub fn reject_all(&mut self, error: CoalescerError) {
        let in_flight = self.in_flight.drain().map(|(_, in_flight)| in_flight);
        let superseded = self.superseded.drain().map(|(_, in_flight)| in_flight);
        for in_flight in in_flight.chain(superseded) {
            for (_, follower) in in_flight.followers {
                follower.send(Err(error.clone())).ok();
            }
        }
    }

    #[cfg(test)]
    pub fn follower_count(&self, key: &RequestKey) -> usize {
        self.in_flight
            .get(key)
            .map_or(0, |in_flight| in_flight.followers.len())
    }

    pub fn is_owner(&self, key: &RequestKey, id: RequestId) -> bool {
        self.in_flight
            .get(key)
            .is_some_and(|in_flight| in_flight.owner == id)
    }

    /// The number of keys currently in flight.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty() && self.superseded.is_empty()
    }

    fn take(&mut self, key: &RequestKey, owner: RequestId) -> Option<InFlight> {
        if self.is_owner(key, owner) {
            return self.in_flight.remove(key);
        }
        self.superseded.remove(&owner)
    }
}
