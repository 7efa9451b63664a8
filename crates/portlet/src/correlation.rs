//! Outstanding-call bookkeeping.
//!
//! Owned by the session actor; every mutation happens on that one task, so a
//! late response and a firing deadline can never both reach the same waiter.

use std::collections::HashMap;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;

use crate::bridge::protocol::{CallResult, RequestId};
use crate::error::BridgeError;

/// Upper bound on a single deadline (DelayQueue cannot schedule past ~2 years).
const MAX_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Resolves the caller blocked in `Session::call`.
pub type Waiter = oneshot::Sender<Result<Value, BridgeError>>;

struct Pending {
    waiter: Waiter,
    deadline: Key,
    target: String,
    timeout: Duration,
}

pub struct CorrelationTable {
    next_id: RequestId,
    pending: HashMap<RequestId, Pending>,
    deadlines: DelayQueue<RequestId>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::starting_at(RequestId::ZERO)
    }

    pub(crate) fn starting_at(first: RequestId) -> Self {
        Self {
            next_id: first,
            pending: HashMap::new(),
            deadlines: DelayQueue::new(),
        }
    }

    /// Next identifier, skipping any still outstanding after wraparound.
    pub fn allocate_id(&mut self) -> RequestId {
        loop {
            let id = self.next_id;
            self.next_id = id.next();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Track an outstanding call and arm its deadline.
    ///
    /// `target` is only used to describe the call in a timeout error.
    pub fn register(
        &mut self,
        id: RequestId,
        waiter: Waiter,
        target: String,
        timeout: Duration,
    ) -> Key {
        let deadline = self.deadlines.insert(id, timeout.min(MAX_DEADLINE));
        let previous = self.pending.insert(
            id,
            Pending {
                waiter,
                deadline,
                target,
                timeout,
            },
        );
        debug_assert!(previous.is_none(), "request id {id} registered twice");
        deadline
    }

    /// Deliver a response. Returns false if the id is not outstanding
    /// (already timed out, or never issued).
    pub fn resolve(&mut self, id: RequestId, result: CallResult) -> bool {
        self.settle(id, result.into_result().map_err(BridgeError::Remote))
    }

    /// Fail one outstanding call, e.g. when its request could not be written.
    pub fn fail(&mut self, id: RequestId, error: BridgeError) -> bool {
        self.settle(id, Err(error))
    }

    fn settle(&mut self, id: RequestId, outcome: Result<Value, BridgeError>) -> bool {
        match self.pending.remove(&id) {
            Some(pending) => {
                self.deadlines.remove(&pending.deadline);
                let _ = pending.waiter.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolve the caller with a timeout failure and cancel its deadline.
    pub fn expire(&mut self, id: RequestId) -> bool {
        match self.pending.remove(&id) {
            Some(pending) => {
                self.deadlines.remove(&pending.deadline);
                Self::time_out(pending);
                true
            }
            None => false,
        }
    }

    fn time_out(pending: Pending) {
        let _ = pending.waiter.send(Err(BridgeError::Timeout {
            target: pending.target,
            timeout: pending.timeout,
        }));
    }

    /// Poll for the next fired deadline, timing out its caller.
    ///
    /// Ready(None) when no deadline is armed.
    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<Option<RequestId>> {
        while let Some(expired) = ready!(self.deadlines.poll_expired(cx)) {
            let id = expired.into_inner();
            // The queue entry is gone already; only the waiter remains.
            if let Some(pending) = self.pending.remove(&id) {
                Self::time_out(pending);
                return Poll::Ready(Some(id));
            }
        }
        Poll::Ready(None)
    }

    pub async fn next_expired(&mut self) -> Option<RequestId> {
        std::future::poll_fn(|cx| self.poll_expired(cx)).await
    }

    /// Resolve every outstanding call with an error from `make_error`.
    pub fn fail_all(&mut self, make_error: impl Fn() -> BridgeError) -> usize {
        self.deadlines.clear();
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            let _ = pending.waiter.send(Err(make_error()));
        }
        count
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Outstanding identifiers in ascending order.
    pub fn ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
