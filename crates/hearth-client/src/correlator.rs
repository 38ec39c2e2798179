//! Pending request bookkeeping.
//!
//! Owned by the session task. Every entry leaves the map exactly once, through
//! [`resolve`](Correlator::resolve), [`expire`](Correlator::expire) or
//! [`reject_all`](Correlator::reject_all); whichever comes first takes the
//! reply sender, so a late response after a timeout (or the reverse) is a no-op.

use crate::ClientError;
use hearth_core::Response;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) type Reply = oneshot::Sender<Result<serde_json::Value, ClientError>>;

struct PendingRequest {
    method: String,
    submitted_at: Instant,
    deadline: Instant,
    timeout: Duration,
    reply: Reply,
}

#[derive(Default)]
pub(crate) struct Correlator {
    next_id: u64,
    pending: HashMap<String, PendingRequest>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Ids are never reused for the lifetime of the client, across reconnects.
    pub(crate) fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    pub(crate) fn insert(&mut self, id: String, method: String, timeout: Duration, reply: Reply) {
        let submitted_at = Instant::now();
        self.pending.insert(
            id,
            PendingRequest {
                method,
                submitted_at,
                deadline: submitted_at + timeout,
                timeout,
                reply,
            },
        );
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Earliest deadline among pending requests.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Settle the request a response belongs to. Returns `false` for unknown ids.
    pub(crate) fn resolve(&mut self, response: Response) -> bool {
        let Some(pending) = self.pending.remove(&response.id) else {
            return false;
        };
        tracing::debug!(
            "{} #{} answered in {:?}",
            pending.method,
            response.id,
            pending.submitted_at.elapsed()
        );
        let outcome = response.into_result().map_err(ClientError::from);
        // The caller may have stopped waiting.
        let _ = pending.reply.send(outcome);
        true
    }

    /// Time out every request whose deadline has passed, and drop entries whose
    /// caller went away. Returns the number of timeouts.
    pub(crate) fn expire(&mut self, now: Instant) -> usize {
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now || p.reply.is_closed())
            .map(|(id, _)| id.clone())
            .collect();

        let mut timed_out = 0;
        for id in due {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            if pending.reply.is_closed() {
                tracing::debug!("{} #{} cancelled by caller", pending.method, id);
                continue;
            }
            tracing::debug!("{} #{} timed out", pending.method, id);
            timed_out += 1;
            let _ = pending.reply.send(Err(ClientError::Timeout {
                method: pending.method,
                timeout: pending.timeout,
            }));
        }
        timed_out
    }

    /// Reject everything outstanding with `connection lost`.
    pub(crate) fn reject_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(ClientError::ConnectionLost));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submit(
        correlator: &mut Correlator,
        method: &str,
        timeout: Duration,
    ) -> (String, oneshot::Receiver<Result<serde_json::Value, ClientError>>) {
        let (tx, rx) = oneshot::channel();
        let id = correlator.next_id();
        correlator.insert(id.clone(), method.to_string(), timeout, tx);
        (id, rx)
    }

    #[tokio::test]
    async fn responses_match_by_id_not_order() {
        let mut c = Correlator::new();
        let (a, rx_a) = submit(&mut c, "a", Duration::from_secs(5));
        let (b, rx_b) = submit(&mut c, "b", Duration::from_secs(5));

        assert!(c.resolve(Response::ok(b, json!("second"))));
        assert!(c.resolve(Response::ok(a, json!("first"))));
        assert_eq!(rx_a.await.unwrap().unwrap(), json!("first"));
        assert_eq!(rx_b.await.unwrap().unwrap(), json!("second"));
        assert_eq!(c.len(), 0);
    }

    #[tokio::test]
    async fn application_error_rejects_request() {
        let mut c = Correlator::new();
        let (id, rx) = submit(&mut c, "sessions.get", Duration::from_secs(5));
        c.resolve(Response::err(id, "not_found", "gone"));
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Application { ref code, .. } if code == "not_found"));
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_noop() {
        let mut c = Correlator::new();
        let (id, rx) = submit(&mut c, "slow", Duration::from_millis(10));
        assert_eq!(c.expire(Instant::now() + Duration::from_millis(20)), 1);
        assert!(!c.resolve(Response::ok(id, json!(1))));
        assert!(matches!(
            rx.await.unwrap(),
            Err(ClientError::Timeout { ref method, .. }) if method == "slow"
        ));
    }

    #[tokio::test]
    async fn timeout_after_response_is_noop() {
        let mut c = Correlator::new();
        let (id, rx) = submit(&mut c, "fast", Duration::from_millis(10));
        assert!(c.resolve(Response::ok(id, json!(1))));
        assert_eq!(c.expire(Instant::now() + Duration::from_secs(1)), 0);
        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn expire_leaves_future_deadlines() {
        let mut c = Correlator::new();
        let (_, _rx_short) = submit(&mut c, "short", Duration::from_millis(10));
        let (_, _rx_long) = submit(&mut c, "long", Duration::from_secs(60));
        let earliest = c.next_deadline().unwrap();
        assert_eq!(c.expire(earliest), 1);
        assert_eq!(c.len(), 1);
    }

    #[tokio::test]
    async fn dropped_callers_are_pruned() {
        let mut c = Correlator::new();
        let (_, rx) = submit(&mut c, "abandoned", Duration::from_secs(60));
        drop(rx);
        assert_eq!(c.expire(Instant::now()), 0);
        assert_eq!(c.len(), 0);
    }

    #[tokio::test]
    async fn reject_all_settles_each_once() {
        let mut c = Correlator::new();
        let receivers: Vec<_> = (0..4)
            .map(|i| submit(&mut c, &format!("m{i}"), Duration::from_secs(5)).1)
            .collect();
        assert_eq!(c.reject_all(), 4);
        assert_eq!(c.reject_all(), 0);
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(ClientError::ConnectionLost));
        }
    }

    #[test]
    fn ids_are_unique() {
        let mut c = Correlator::new();
        let ids: std::collections::HashSet<_> = (0..100).map(|_| c.next_id()).collect();
        assert_eq!(ids.len(), 100);
    }
}
