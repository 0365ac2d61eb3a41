//! Pending lookup bookkeeping: concurrent lookups for one key coalesce onto
//! a single request, each negative reply extends the exclusion set, and a
//! request dies after 7 floodfills or 5 seconds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use garliccraft_core::{Hash, LeaseSet, RouterInfo};

/// Per-request budget of floodfills to consult.
pub const MAX_LOOKUP_FLOODFILLS: usize = 7;

/// Wall-clock budget per lookup.
pub const MAX_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// What a successful lookup produced.
#[derive(Debug, Clone)]
pub enum LookupResult {
    Router(Arc<RouterInfo>),
    Lease(Arc<LeaseSet>),
}

/// What to do after a DatabaseSearchReply for a pending key.
#[derive(Debug, PartialEq, Eq)]
pub enum NextStep {
    /// Ask the next-closest floodfill, excluding these.
    Retry(Vec<Hash>),
    /// Budget exhausted.
    GiveUp,
    /// No request is waiting on this key.
    NotPending,
}

struct PendingRequest {
    excluded: Vec<Hash>,
    attempts: usize,
    exploratory: bool,
    started_at: Instant,
    waiters: Vec<oneshot::Sender<Option<LookupResult>>>,
}

#[derive(Default)]
pub struct PendingRequests {
    pending: HashMap<Hash, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_exploratory(&self, key: &Hash) -> bool {
        self.pending.get(key).is_some_and(|r| r.exploratory)
    }

    /// Join (or create) the request for `key`. Returns the waiter channel
    /// and whether the request is new and needs its first send.
    pub fn subscribe(
        &mut self,
        key: Hash,
        exploratory: bool,
    ) -> (oneshot::Receiver<Option<LookupResult>>, bool) {
        let (tx, rx) = oneshot::channel();
        match self.pending.get_mut(&key) {
            Some(request) => {
                request.waiters.push(tx);
                (rx, false)
            }
            None => {
                self.pending.insert(
                    key,
                    PendingRequest {
                        excluded: Vec::new(),
                        attempts: 0,
                        exploratory,
                        started_at: Instant::now(),
                        waiters: vec![tx],
                    },
                );
                (rx, true)
            }
        }
    }

    /// Note that `floodfill` was asked, so it never gets asked twice.
    pub fn record_attempt(&mut self, key: &Hash, floodfill: Hash) {
        if let Some(request) = self.pending.get_mut(key) {
            request.attempts += 1;
            if !request.excluded.contains(&floodfill) {
                request.excluded.push(floodfill);
            }
        }
    }

    /// Deliver a found entry to every waiter.
    pub fn complete(&mut self, key: &Hash, result: LookupResult) {
        if let Some(request) = self.pending.remove(key) {
            for waiter in request.waiters {
                let _ = waiter.send(Some(result.clone()));
            }
        }
    }

    /// Fail every waiter.
    pub fn fail(&mut self, key: &Hash) {
        if let Some(request) = self.pending.remove(key) {
            for waiter in request.waiters {
                let _ = waiter.send(None);
            }
        }
    }

    /// A floodfill answered "not found, try these"; decide the next move.
    pub fn on_negative_reply(&mut self, key: &Hash, responder: Hash) -> NextStep {
        let Some(request) = self.pending.get_mut(key) else {
            return NextStep::NotPending;
        };
        if !request.excluded.contains(&responder) {
            request.excluded.push(responder);
        }
        if request.attempts >= MAX_LOOKUP_FLOODFILLS {
            return NextStep::GiveUp;
        }
        NextStep::Retry(request.excluded.clone())
    }

    /// Fail requests past the deadline.
    pub fn expire(&mut self) {
        let now = Instant::now();
        let stale: Vec<Hash> = self
            .pending
            .iter()
            .filter(|(_, r)| now.duration_since(r.started_at) > MAX_LOOKUP_TIMEOUT)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            self.fail(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_lookups_coalesce() {
        let mut requests = PendingRequests::new();
        let key = Hash::digest(b"key");
        let (_rx1, first) = requests.subscribe(key, false);
        let (_rx2, second) = requests.subscribe(key, false);
        assert!(first);
        assert!(!second);
        assert_eq!(requests.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_reaches_all_waiters() {
        let mut requests = PendingRequests::new();
        let key = Hash::digest(b"key");
        let (rx1, _) = requests.subscribe(key, false);
        let (rx2, _) = requests.subscribe(key, false);

        let keys = garliccraft_core::PrivateKeys::generate(garliccraft_crypto::SigType::Ed25519)
            .unwrap();
        let mut info = RouterInfo::new(
            keys.identity().clone(),
            1,
            vec![],
            garliccraft_core::Capabilities::empty(),
        );
        info.sign(&keys).unwrap();
        requests.complete(&key, LookupResult::Router(Arc::new(info)));

        assert!(matches!(rx1.await, Ok(Some(LookupResult::Router(_)))));
        assert!(matches!(rx2.await, Ok(Some(LookupResult::Router(_)))));
        assert!(requests.is_empty());
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut requests = PendingRequests::new();
        let key = Hash::digest(b"key");
        let (_rx, _) = requests.subscribe(key, false);

        for i in 0..MAX_LOOKUP_FLOODFILLS {
            let ff = Hash::digest(&[i as u8]);
            requests.record_attempt(&key, ff);
            let step = requests.on_negative_reply(&key, ff);
            if i + 1 < MAX_LOOKUP_FLOODFILLS {
                assert!(matches!(step, NextStep::Retry(_)), "attempt {i}");
            } else {
                assert_eq!(step, NextStep::GiveUp);
            }
        }
    }

    #[test]
    fn test_reply_for_unknown_key() {
        let mut requests = PendingRequests::new();
        assert_eq!(
            requests.on_negative_reply(&Hash::digest(b"nobody"), Hash::digest(b"ff")),
            NextStep::NotPending
        );
    }

    #[tokio::test]
    async fn test_expired_request_fails_waiters() {
        let mut requests = PendingRequests::new();
        let key = Hash::digest(b"key");
        let (rx, _) = requests.subscribe(key, false);
        requests.pending.get_mut(&key).unwrap().started_at =
            Instant::now() - MAX_LOOKUP_TIMEOUT - Duration::from_secs(1);
        requests.expire();
        assert!(matches!(rx.await, Ok(None)));
    }
}
