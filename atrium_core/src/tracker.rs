use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::CoreError;
use crate::packet::Packet;
use crate::sequence::SeqGenerator;

/// Outcome delivered to a request's completer: the reply packet (which may
/// itself carry a wire error code) or a local failure such as a timeout.
pub type RequestResult = Result<Packet, CoreError>;

/// Awaitable handle on a tracked request.
pub struct ReplyFuture {
    rx: oneshot::Receiver<RequestResult>,
}

impl Future for ReplyFuture {
    type Output = RequestResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(outcome) => outcome,
            // Tracker dropped without resolving; treat as a closed scope
            Err(_) => Err(CoreError::ConnectionClosed),
        })
    }
}

struct PendingRequest {
    completer: oneshot::Sender<RequestResult>,
    peer: Option<String>,
    created_at: Instant,
}

/// Pairs each outbound request with exactly one inbound reply or a timeout.
///
/// One instance per correlation scope: the connector owns one for its
/// connection, the server owns one for all peer traffic (the pending entry
/// remembers which peer it went to so a dead link can fail its own entries).
/// The completer fires exactly once; whichever of reply, failure, or
/// deadline removes the entry from the map wins.
#[derive(Clone)]
pub struct RequestTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    pending: DashMap<u16, PendingRequest>,
    seq: SeqGenerator,
    late_replies: AtomicU64,
    timeouts: AtomicU64,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                pending: DashMap::new(),
                seq: SeqGenerator::new(),
                late_replies: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
            }),
        }
    }

    pub fn next_seq(&self) -> u16 {
        self.inner.seq.next()
    }

    /// Register a pending entry for `seq`. Fails if the sequence is already
    /// in flight. A deadline task fires the completer with `RequestTimeout`
    /// if nothing resolves it within `timeout`.
    pub fn track(
        &self,
        seq: u16,
        timeout: Duration,
        peer: Option<String>,
        completer: oneshot::Sender<RequestResult>,
    ) -> Result<(), CoreError> {
        use dashmap::mapref::entry::Entry;

        match self.inner.pending.entry(seq) {
            Entry::Occupied(_) => return Err(CoreError::SequenceInUse(seq)),
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    completer,
                    peer,
                    created_at: Instant::now(),
                });
            }
        }

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                if let Some((_, pending)) = inner.pending.remove(&seq) {
                    inner.timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        seq,
                        elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                        "request timed out"
                    );
                    let _ = pending.completer.send(Err(CoreError::RequestTimeout));
                }
            }
        });
        Ok(())
    }

    /// Allocate a sequence, register it, and return the awaitable reply.
    pub fn begin(
        &self,
        timeout: Duration,
        peer: Option<String>,
    ) -> Result<(u16, ReplyFuture), CoreError> {
        // A colliding sequence means the previous request with that number
        // is still pending a full wrap later; step past it.
        for _ in 0..16 {
            let seq = self.next_seq();
            let (tx, rx) = oneshot::channel();
            match self.track(seq, timeout, peer.clone(), tx) {
                Ok(()) => return Ok((seq, ReplyFuture { rx })),
                Err(CoreError::SequenceInUse(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::Backpressure)
    }

    /// Resolve `seq` with a reply. Returns false for a late or duplicate
    /// reply, which is dropped and counted.
    pub fn complete(&self, seq: u16, reply: Packet) -> bool {
        match self.inner.pending.remove(&seq) {
            Some((_, pending)) => {
                let _ = pending.completer.send(Ok(reply));
                true
            }
            None => {
                self.inner.late_replies.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(seq, "late reply dropped");
                false
            }
        }
    }

    /// Drop a pending entry without firing its completer. For unwinding a
    /// registration whose send never left the building.
    pub fn abort(&self, seq: u16) -> bool {
        self.inner.pending.remove(&seq).is_some()
    }

    /// Resolve `seq` with a failure.
    pub fn fail(&self, seq: u16, err: CoreError) -> bool {
        match self.inner.pending.remove(&seq) {
            Some((_, pending)) => {
                let _ = pending.completer.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Fail every entry bound to `peer` (a lost link).
    pub fn fail_peer(&self, peer: &str) {
        let seqs: Vec<u16> = self
            .inner
            .pending
            .iter()
            .filter(|entry| entry.value().peer.as_deref() == Some(peer))
            .map(|entry| *entry.key())
            .collect();
        for seq in seqs {
            if let Some((_, pending)) = self.inner.pending.remove(&seq) {
                let _ = pending.completer.send(Err(CoreError::ConnectionClosed));
            }
        }
    }

    /// Fail everything; used when the whole scope (connection) goes away.
    pub fn cancel_all(&self) {
        let seqs: Vec<u16> = self.inner.pending.iter().map(|e| *e.key()).collect();
        for seq in seqs {
            if let Some((_, pending)) = self.inner.pending.remove(&seq) {
                let _ = pending.completer.send(Err(CoreError::ConnectionClosed));
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn late_replies(&self) -> u64 {
        self.inner.late_replies.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.inner.timeouts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_complete_resolves_future() {
        let tracker = RequestTracker::new();
        let (seq, reply) = tracker
            .begin(Duration::from_secs(5), None)
            .unwrap();

        assert!(tracker.complete(seq, Packet::new("Reply", Bytes::from_static(b"ok"))));
        let packet = reply.await.unwrap();
        assert_eq!(packet.msg_id, "Reply");
        assert_eq!(tracker.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_timeout_fires_once_and_late_reply_dropped() {
        let tracker = RequestTracker::new();
        let (seq, reply) = tracker
            .begin(Duration::from_millis(50), None)
            .unwrap();

        let result = reply.await;
        assert!(matches!(result, Err(CoreError::RequestTimeout)));
        assert_eq!(tracker.timeouts(), 1);

        // The reply arriving after the deadline is dropped and counted
        assert!(!tracker.complete(seq, Packet::empty("Late")));
        assert_eq!(tracker.late_replies(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_sequence_rejected() {
        let tracker = RequestTracker::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        tracker.track(7, Duration::from_secs(5), None, tx1).unwrap();
        let err = tracker.track(7, Duration::from_secs(5), None, tx2).unwrap_err();
        assert!(matches!(err, CoreError::SequenceInUse(7)));
    }

    #[tokio::test]
    async fn test_fail_peer_only_touches_that_peer() {
        let tracker = RequestTracker::new();
        let (_seq_a, reply_a) = tracker
            .begin(Duration::from_secs(5), Some("play:2".into()))
            .unwrap();
        let (seq_b, reply_b) = tracker
            .begin(Duration::from_secs(5), Some("api:1".into()))
            .unwrap();

        tracker.fail_peer("play:2");
        assert!(matches!(reply_a.await, Err(CoreError::ConnectionClosed)));
        assert_eq!(tracker.pending_len(), 1);

        assert!(tracker.complete(seq_b, Packet::empty("Ok")));
        assert!(reply_b.await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let tracker = RequestTracker::new();
        let (_s1, r1) = tracker.begin(Duration::from_secs(5), None).unwrap();
        let (_s2, r2) = tracker.begin(Duration::from_secs(5), None).unwrap();
        tracker.cancel_all();
        assert!(matches!(r1.await, Err(CoreError::ConnectionClosed)));
        assert!(matches!(r2.await, Err(CoreError::ConnectionClosed)));
        assert_eq!(tracker.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_completer_fires_exactly_once() {
        let tracker = RequestTracker::new();
        let (seq, reply) = tracker
            .begin(Duration::from_millis(80), None)
            .unwrap();

        assert!(tracker.complete(seq, Packet::empty("Ok")));
        // The deadline task wakes later and must find nothing
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(tracker.timeouts(), 0);
        assert!(reply.await.is_ok());
    }
}
