//! Pending request table
//!
//! Owns every outgoing request from id allocation until it settles. Ids are
//! strictly increasing for the lifetime of the table and never reused, even
//! across reconnects. Deadlines are armed when a request is handed to the
//! transport; one sweeper task sleeps until the soonest deadline instead of
//! keeping a timer per request.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tokio::time::{Instant, sleep_until};

use crate::error::LspError;
use crate::workspace::lock;

/// Final states remembered for `state()` after an entry settles
const SETTLED_HISTORY: usize = 256;

type Settle = oneshot::Sender<Result<Value, LspError>>;

/// Lifecycle of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for the handshake before it can be sent
    Queued,
    InFlight,
    /// `$/cancelRequest` sent; still waiting for the server's answer
    CancelRequested,
    Resolved,
    Rejected,
    TimedOut,
    Cancelled,
}

impl RequestState {
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Resolved | Self::Rejected | Self::TimedOut | Self::Cancelled
        )
    }
}

/// Stable handle for cancelling a request by identity rather than by id.
/// Clones refer to the same request.
///
/// A key stays cancelled once [`LspClient::cancel`](super::LspClient::cancel)
/// has been called with it, so retries under the same key stop.
#[derive(Debug, Clone)]
pub struct RequestKey(Arc<KeyState>);

#[derive(Debug)]
struct KeyState {
    id: u64,
    cancelled: AtomicBool,
}

impl RequestKey {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(Arc::new(KeyState {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            cancelled: AtomicBool::new(false),
        }))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn mark_cancelled(&self) {
        self.0.cancelled.store(true, Ordering::Release);
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for RequestKey {}

impl Hash for RequestKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl Default for RequestKey {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingEntry {
    method: String,
    key: Option<RequestKey>,
    timeout: Duration,
    deadline: Option<Instant>,
    state: RequestState,
    settle: Settle,
}

/// Receiving half of a pending request
#[derive(Debug)]
pub struct RequestHandle {
    id: u64,
    rx: oneshot::Receiver<Result<Value, LspError>>,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for RequestHandle {
    type Output = Result<Value, LspError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(LspError::NotConnected)))
    }
}

#[derive(Default)]
struct Entries {
    pending: HashMap<u64, PendingEntry>,
    settled: VecDeque<(u64, RequestState)>,
}

impl Entries {
    fn settle(&mut self, id: u64, outcome: Result<Value, LspError>) -> bool {
        let Some(entry) = self.pending.remove(&id) else {
            return false;
        };
        let state = match &outcome {
            Ok(_) => RequestState::Resolved,
            Err(LspError::Timeout { .. }) => RequestState::TimedOut,
            Err(LspError::RequestCancelled) => RequestState::Cancelled,
            Err(_) => RequestState::Rejected,
        };
        tracing::trace!("Request {} ({}) settled as {:?}", id, entry.method, state);

        if self.settled.len() == SETTLED_HISTORY {
            self.settled.pop_front();
        }
        self.settled.push_back((id, state));

        // The caller may have stopped waiting; that is not an error here.
        let _ = entry.settle.send(outcome);
        true
    }
}

pub struct PendingRequestTable {
    next_id: AtomicU64,
    entries: Mutex<Entries>,
    rearm: Notify,
}

impl Default for PendingRequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Entries::default()),
            rearm: Notify::new(),
        }
    }

    /// Allocate an id and register a queued request
    pub fn create(
        &self,
        method: &str,
        timeout: Duration,
        key: Option<RequestKey>,
    ) -> RequestHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (settle, rx) = oneshot::channel();
        lock(&self.entries).pending.insert(
            id,
            PendingEntry {
                method: method.to_string(),
                key,
                timeout,
                deadline: None,
                state: RequestState::Queued,
                settle,
            },
        );
        RequestHandle { id, rx }
    }

    /// The request was handed to the transport: arm its deadline.
    /// Returns false if it settled in the meantime.
    pub fn mark_dispatched(&self, id: u64, now: Instant) -> bool {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.pending.get_mut(&id) else {
            return false;
        };
        entry.deadline = Some(now + entry.timeout);
        if entry.state == RequestState::Queued {
            entry.state = RequestState::InFlight;
        }
        drop(entries);
        self.rearm.notify_one();
        true
    }

    pub fn resolve(&self, id: u64, result: Value) -> bool {
        let settled = lock(&self.entries).settle(id, Ok(result));
        if !settled {
            tracing::warn!("Ignoring result for unknown request id {}", id);
        }
        settled
    }

    pub fn reject(&self, id: u64, error: LspError) -> bool {
        let settled = lock(&self.entries).settle(id, Err(error));
        if !settled {
            tracing::warn!("Ignoring error for unknown request id {}", id);
        }
        settled
    }

    /// Id and state of the live request registered under `key`
    pub fn find_by_key(&self, key: &RequestKey) -> Option<(u64, RequestState)> {
        lock(&self.entries)
            .pending
            .iter()
            .find(|(_, entry)| entry.key.as_ref() == Some(key))
            .map(|(id, entry)| (*id, entry.state))
    }

    pub fn mark_cancel_requested(&self, id: u64) {
        if let Some(entry) = lock(&self.entries).pending.get_mut(&id) {
            entry.state = RequestState::CancelRequested;
        }
    }

    pub fn method(&self, id: u64) -> Option<String> {
        lock(&self.entries)
            .pending
            .get(&id)
            .map(|entry| entry.method.clone())
    }

    /// Current state of a live request, or the final state of a recent one
    pub fn state(&self, id: u64) -> Option<RequestState> {
        let entries = lock(&self.entries);
        entries.pending.get(&id).map(|entry| entry.state).or_else(|| {
            entries
                .settled
                .iter()
                .rev()
                .find(|(settled, _)| *settled == id)
                .map(|(_, state)| *state)
        })
    }

    pub fn contains(&self, id: u64) -> bool {
        lock(&self.entries).pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Soonest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        lock(&self.entries)
            .pending
            .values()
            .filter_map(|entry| entry.deadline)
            .min()
    }

    /// Reject every request whose deadline has passed. Returns their ids.
    pub fn sweep(&self, now: Instant) -> Vec<u64> {
        let mut entries = lock(&self.entries);
        let mut expired: Vec<(u64, String, Duration)> = entries
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|d| d <= now))
            .map(|(id, entry)| (*id, entry.method.clone(), entry.timeout))
            .collect();
        expired.sort_by_key(|(id, _, _)| *id);

        for (id, method, timeout) in &expired {
            tracing::debug!("Request {} ({}) timed out after {:?}", id, method, timeout);
            entries.settle(
                *id,
                Err(LspError::Timeout {
                    method: method.clone(),
                    timeout: *timeout,
                }),
            );
        }
        expired.into_iter().map(|(id, _, _)| id).collect()
    }

    /// Reject every request handed to a connection that went away. Ids in
    /// `queued` never left the pre-initialization queue and survive.
    pub fn reject_unqueued(&self, queued: &HashSet<u64>) -> usize {
        let mut entries = lock(&self.entries);
        let lost: Vec<u64> = entries
            .pending
            .keys()
            .filter(|id| !queued.contains(id))
            .copied()
            .collect();
        for id in &lost {
            entries.settle(*id, Err(LspError::NotConnected));
        }
        lost.len()
    }

    /// Sleep until the soonest deadline, sweep, repeat. Runs until aborted.
    pub async fn drive_timeouts(self: Arc<Self>) {
        loop {
            match self.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {
                            self.sweep(Instant::now());
                        }
                        _ = self.rearm.notified() => {}
                    }
                }
                None => self.rearm.notified().await,
            }
        }
    }
}
