//! The common session contract both transports implement.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use garliccraft_core::i2np::{I2npMessage, I2npMessageRef};
use garliccraft_core::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Ntcp,
    Ssu,
}

/// Commands accepted by a session's writer task.
#[derive(Debug)]
pub enum SessionCommand {
    Send(Vec<I2npMessageRef>),
    Close,
}

/// Per-session byte counters, shared with the handle.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub sent_bytes: AtomicU64,
    pub received_bytes: AtomicU64,
}

/// A cheap handle onto a live transport session.
#[derive(Clone)]
pub struct SessionHandle {
    remote: Hash,
    kind: TransportKind,
    tx: mpsc::Sender<SessionCommand>,
    counters: Arc<SessionCounters>,
    closed: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(
        remote: Hash,
        kind: TransportKind,
        tx: mpsc::Sender<SessionCommand>,
    ) -> (Self, Arc<SessionCounters>, Arc<AtomicBool>) {
        let counters = Arc::new(SessionCounters::default());
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                remote,
                kind,
                tx,
                counters: counters.clone(),
                closed: closed.clone(),
            },
            counters,
            closed,
        )
    }

    pub fn remote_identity(&self) -> Hash {
        self.remote
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn sent_bytes(&self) -> u64 {
        self.counters.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn received_bytes(&self) -> u64 {
        self.counters.received_bytes.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Hand messages to the writer task; drops the batch under backpressure
    /// rather than blocking the caller.
    pub fn send(&self, msgs: Vec<I2npMessageRef>) {
        if self.tx.try_send(SessionCommand::Send(msgs)).is_err() {
            tracing::debug!(peer = ?self.remote, "session queue full, dropping batch");
        }
    }

    pub async fn close(&self) {
        let _ = self.tx.send(SessionCommand::Close).await;
    }
}

/// An I2NP message delivered by some session to the router's dispatcher.
#[derive(Debug)]
pub struct InboundMessage {
    pub from: Hash,
    pub msg: I2npMessage,
}
