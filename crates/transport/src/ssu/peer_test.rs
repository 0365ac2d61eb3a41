//! The 3-party SSU peer test and the router reachability status it drives.
//!
//! Alice asks Bob to find a Charlie; Charlie contacts Alice directly with an
//! intro key conveyed by Bob. Whether Charlie's packet arrives tells Alice
//! if she is directly reachable, firewalled, or still undetermined.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RouterStatus {
    Ok = 0,
    Testing = 1,
    Firewalled = 2,
}

/// Shared, lock-free view of the router's reachability status. Firewalled
/// routers must advertise introducers in their RouterInfo.
#[derive(Clone)]
pub struct StatusHandle(Arc<AtomicU8>);

impl StatusHandle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(RouterStatus::Testing as u8)))
    }

    pub fn get(&self) -> RouterStatus {
        match self.0.load(Ordering::Relaxed) {
            0 => RouterStatus::Ok,
            2 => RouterStatus::Firewalled,
            _ => RouterStatus::Testing,
        }
    }

    pub fn set(&self, status: RouterStatus) {
        self.0.store(status as u8, Ordering::Relaxed);
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTestOutcome {
    /// Charlie reached us directly: not firewalled.
    Ok,
    /// Bob answered but Charlie never got through: symmetric NAT.
    Firewalled,
    /// Nobody answered; try again later.
    Timeout,
}

/// A test Alice is currently running, keyed by nonce.
struct TestRun {
    started_at: Instant,
    bob_replied: bool,
    charlie_contacted: bool,
}

const PEER_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Alice-side bookkeeping for in-flight peer tests.
pub struct PeerTestManager {
    runs: HashMap<u32, TestRun>,
}

impl PeerTestManager {
    pub fn new() -> Self {
        Self {
            runs: HashMap::new(),
        }
    }

    pub fn start(&mut self, nonce: u32) {
        self.runs.insert(
            nonce,
            TestRun {
                started_at: Instant::now(),
                bob_replied: false,
                charlie_contacted: false,
            },
        );
    }

    pub fn is_running(&self, nonce: u32) -> bool {
        self.runs.contains_key(&nonce)
    }

    /// Bob echoed the test back over the session.
    pub fn on_bob_reply(&mut self, nonce: u32) {
        if let Some(run) = self.runs.get_mut(&nonce) {
            run.bob_replied = true;
        }
    }

    /// Charlie's packet arrived from an address with no session: direct
    /// reachability confirmed.
    pub fn on_charlie_contact(&mut self, nonce: u32) -> Option<PeerTestOutcome> {
        if let Some(run) = self.runs.get_mut(&nonce) {
            run.charlie_contacted = true;
            self.runs.remove(&nonce);
            return Some(PeerTestOutcome::Ok);
        }
        None
    }

    /// Sweep timed-out runs into outcomes.
    pub fn evaluate(&mut self) -> Vec<(u32, PeerTestOutcome)> {
        let now = Instant::now();
        let mut finished = Vec::new();
        self.runs.retain(|nonce, run| {
            if now.duration_since(run.started_at) < PEER_TEST_TIMEOUT {
                return true;
            }
            let outcome = if run.charlie_contacted {
                PeerTestOutcome::Ok
            } else if run.bob_replied {
                PeerTestOutcome::Firewalled
            } else {
                PeerTestOutcome::Timeout
            };
            finished.push((*nonce, outcome));
            false
        });
        finished
    }

    /// Fold an outcome into the router status.
    pub fn apply_outcome(status: &StatusHandle, outcome: PeerTestOutcome) {
        match outcome {
            PeerTestOutcome::Ok => status.set(RouterStatus::Ok),
            PeerTestOutcome::Firewalled => status.set(RouterStatus::Firewalled),
            PeerTestOutcome::Timeout => status.set(RouterStatus::Testing),
        }
    }
}

impl Default for PeerTestManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charlie_contact_means_ok() {
        let mut mgr = PeerTestManager::new();
        mgr.start(1);
        mgr.on_bob_reply(1);
        assert_eq!(mgr.on_charlie_contact(1), Some(PeerTestOutcome::Ok));
        assert!(!mgr.is_running(1));
    }

    #[test]
    fn test_bob_only_means_firewalled_after_timeout() {
        let mut mgr = PeerTestManager::new();
        mgr.start(2);
        mgr.on_bob_reply(2);
        // force the deadline
        mgr.runs.get_mut(&2).unwrap().started_at =
            Instant::now() - PEER_TEST_TIMEOUT - Duration::from_secs(1);
        let outcomes = mgr.evaluate();
        assert_eq!(outcomes, vec![(2, PeerTestOutcome::Firewalled)]);
    }

    #[test]
    fn test_silence_means_testing() {
        let mut mgr = PeerTestManager::new();
        mgr.start(3);
        mgr.runs.get_mut(&3).unwrap().started_at =
            Instant::now() - PEER_TEST_TIMEOUT - Duration::from_secs(1);
        let outcomes = mgr.evaluate();
        assert_eq!(outcomes, vec![(3, PeerTestOutcome::Timeout)]);

        let status = StatusHandle::new();
        PeerTestManager::apply_outcome(&status, PeerTestOutcome::Timeout);
        assert_eq!(status.get(), RouterStatus::Testing);
    }

    #[test]
    fn test_status_transitions() {
        let status = StatusHandle::new();
        assert_eq!(status.get(), RouterStatus::Testing);
        PeerTestManager::apply_outcome(&status, PeerTestOutcome::Ok);
        assert_eq!(status.get(), RouterStatus::Ok);
        PeerTestManager::apply_outcome(&status, PeerTestOutcome::Firewalled);
        assert_eq!(status.get(), RouterStatus::Firewalled);
    }
}
