//! Registry of in-flight calls awaiting their response.

use crate::error::{Error, Result};
use crate::protocol::{RequestId, Response};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Identifies the connection a call was written to.
pub type ConnectionId = u64;

/// Type alias for response sender channel.
pub type ResponseSender = oneshot::Sender<Result<Response>>;

struct PendingCall {
    connection: ConnectionId,
    sender: ResponseSender,
}

/// Shared map of request id to the waiting caller.
///
/// Every entry sees exactly one terminal transition (resolve, fail, or
/// removal by the waiter); the entry is gone from the map by the time the
/// waiter observes it.
#[derive(Clone, Default)]
pub struct PendingCalls {
    calls: Arc<DashMap<RequestId, PendingCall>>,
}

impl PendingCalls {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call about to be written to `connection`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SendFailed`] if a call with the same id is in flight.
    pub fn register(
        &self,
        request_id: impl Into<RequestId>,
        connection: ConnectionId,
    ) -> Result<PendingResponse> {
        let request_id = request_id.into();
        let (sender, receiver) = oneshot::channel();

        match self.calls.entry(request_id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::SendFailed(format!(
                    "request {request_id} is already in flight"
                )));
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingCall { connection, sender });
            }
        }
        trace!(
            "registered pending call {} on connection {} (total: {})",
            request_id,
            connection,
            self.calls.len()
        );

        Ok(PendingResponse {
            request_id,
            receiver,
            calls: self.clone(),
        })
    }

    /// Deliver a response to the call with the matching id.
    ///
    /// Returns `false` (and drops the response) if no such call is waiting,
    /// which happens for late responses after a timeout or duplicates.
    pub fn resolve(&self, response: Response) -> bool {
        match self.calls.remove(response.request_id()) {
            Some((_, call)) => {
                // The waiter may have just gone away; nothing else to do then.
                let _ = call.sender.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Fail the call with the given id. Unknown ids are ignored.
    pub fn fail(&self, request_id: &str, error: Error) -> bool {
        match self.calls.remove(request_id) {
            Some((_, call)) => {
                let _ = call.sender.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every call matching `predicate`, building a fresh error for each.
    ///
    /// Returns how many calls were failed.
    pub fn cancel_all<P, F>(&self, predicate: P, error: F) -> usize
    where
        P: Fn(&str, ConnectionId) -> bool,
        F: Fn() -> Error,
    {
        let matching: Vec<RequestId> = self
            .calls
            .iter()
            .filter(|entry| predicate(entry.key(), entry.value().connection))
            .map(|entry| entry.key().clone())
            .collect();

        let failed = matching
            .iter()
            .filter(|request_id| self.fail(request_id, error()))
            .count();

        if failed > 0 {
            debug!("cancelled {} pending calls", failed);
        }
        failed
    }

    /// Fail every call written to `connection`.
    pub fn cancel_connection<F>(&self, connection: ConnectionId, error: F) -> usize
    where
        F: Fn() -> Error,
    {
        self.cancel_all(|_, c| c == connection, error)
    }

    /// Drop a call without resolving it.
    pub fn remove(&self, request_id: &str) -> bool {
        self.calls.remove(request_id).is_some()
    }

    /// Whether a call with this id is waiting.
    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.calls.contains_key(request_id)
    }

    /// Number of calls in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no call is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// The caller's side of a registered call.
///
/// Dropping it (after a timeout, or because the caller gave up) removes the
/// registry entry, so a late response is discarded rather than delivered.
pub struct PendingResponse {
    request_id: RequestId,
    receiver: oneshot::Receiver<Result<Response>>,
    calls: PendingCalls,
}

impl PendingResponse {
    /// The id this call is registered under.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the outcome, up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if nothing arrived in time, or whatever
    /// error the call was failed with.
    pub async fn wait(self, timeout: Duration) -> Result<Response> {
        self.wait_until(Instant::now() + timeout, timeout).await
    }

    /// Wait for the outcome until `deadline`, reporting a timeout as
    /// `Error::Timeout(timeout)`.
    ///
    /// # Errors
    ///
    /// As [`PendingResponse::wait`].
    pub async fn wait_until(mut self, deadline: Instant, timeout: Duration) -> Result<Response> {
        match tokio::time::timeout_at(deadline, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an outcome: the registry itself is gone.
            Ok(Err(_)) => Err(crate::error::ConnectionError::Closed.into()),
            Err(_) => {
                debug!("request {} timed out after {:?}", self.request_id, timeout);
                Err(Error::Timeout(timeout))
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.calls.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionError;
    use crate::protocol::Value;
    use assert_matches::assert_matches;
    use tokio_test::{assert_pending, assert_ready_ok};

    #[tokio::test]
    async fn test_resolve_delivers_to_matching_call() {
        let calls = PendingCalls::new();
        let r1 = calls.register("r1", 1).unwrap();
        let r2 = calls.register("r2", 1).unwrap();

        // Out of issue order
        assert!(calls.resolve(Response::success("r2", Value::Int(2))));
        assert!(calls.resolve(Response::success("r1", Value::Int(1))));

        let a = r1.wait(Duration::from_secs(1)).await.unwrap();
        let b = r2.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(a.data(), Some(&Value::Int(1)));
        assert_eq!(b.data(), Some(&Value::Int(2)));
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_resolution() {
        let calls = PendingCalls::new();
        let pending = calls.register("r1", 1).unwrap();
        let mut waiter = tokio_test::task::spawn(pending.wait(Duration::from_secs(60)));

        assert_pending!(waiter.poll());
        assert!(calls.resolve(Response::success("r1", Value::Int(1))));
        assert!(waiter.is_woken());

        let response = assert_ready_ok!(waiter.poll());
        assert_eq!(response.request_id(), "r1");
    }

    #[tokio::test]
    async fn test_second_resolution_is_noop() {
        let calls = PendingCalls::new();
        let pending = calls.register("r1", 1).unwrap();

        assert!(calls.resolve(Response::success("r1", Value::Int(1))));
        assert!(!calls.resolve(Response::success("r1", Value::Int(99))));
        assert!(!calls.fail("r1", Error::Timeout(Duration::ZERO)));

        let response = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.data(), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_unknown_ids_are_ignored() {
        let calls = PendingCalls::new();
        assert!(!calls.resolve(Response::success("nope", Value::Null)));
        assert!(!calls.fail("nope", ConnectionError::Closed.into()));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let calls = PendingCalls::new();
        let _first = calls.register("r1", 1).unwrap();

        assert_matches!(calls.register("r1", 2).err(), Some(Error::SendFailed(_)));
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_purges_entry() {
        let calls = PendingCalls::new();
        let pending = calls.register("r1", 1).unwrap();
        assert_eq!(calls.len(), 1);

        let result = pending.wait(Duration::from_millis(20)).await;

        assert_matches!(result, Err(Error::Timeout(_)));
        assert!(calls.is_empty());
        // A late response finds nobody to deliver to
        assert!(!calls.resolve(Response::success("r1", Value::Int(1))));
    }

    #[tokio::test]
    async fn test_spent_deadline_reports_full_budget() {
        let calls = PendingCalls::new();
        let pending = calls.register("r1", 1).unwrap();
        let budget = Duration::from_secs(3);

        let result = pending.wait_until(Instant::now(), budget).await;

        assert_matches!(result, Err(Error::Timeout(t)) if t == budget);
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_waiter_purges_entry() {
        let calls = PendingCalls::new();
        drop(calls.register("r1", 1).unwrap());
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_connection_only_hits_that_connection() {
        let calls = PendingCalls::new();
        let a = calls.register("a", 1).unwrap();
        let b = calls.register("b", 1).unwrap();
        let c = calls.register("c", 2).unwrap();

        let cancelled = calls.cancel_connection(1, || ConnectionError::Closed.into());

        assert_eq!(cancelled, 2);
        assert_matches!(
            a.wait(Duration::from_secs(1)).await,
            Err(Error::Connection(ConnectionError::Closed))
        );
        assert_matches!(
            b.wait(Duration::from_secs(1)).await,
            Err(Error::Connection(ConnectionError::Closed))
        );
        assert!(calls.contains("c"));
        drop(c);
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_resolution_from_other_task() {
        let calls = PendingCalls::new();
        let mut waiters = Vec::new();
        for i in 0..64 {
            waiters.push((i, calls.register(format!("r{i}"), 1).unwrap()));
        }

        let resolver = calls.clone();
        tokio::spawn(async move {
            for i in (0..64).rev() {
                resolver.resolve(Response::success(format!("r{i}"), Value::Int(i)));
            }
        });

        for (i, waiter) in waiters {
            let response = waiter.wait(Duration::from_secs(5)).await.unwrap();
            assert_eq!(response.request_id(), format!("r{i}"));
            assert_eq!(response.data(), Some(&Value::Int(i)));
        }
        assert!(calls.is_empty());
    }
}
