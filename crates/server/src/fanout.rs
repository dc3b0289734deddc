use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Single-producer multi-consumer broadcast of ingress datagrams.
///
/// Delivery is best-effort and non-blocking per consumer: a full queue drops
/// the datagram for that consumer only, and the producer is never delayed by
/// a slow reader. The registry mutex is held only across bookkeeping and the
/// enqueue attempt, never across I/O.
pub struct FanOut {
    consumers: Mutex<HashMap<Uuid, mpsc::Sender<Bytes>>>,
    capacity: usize,
}

impl FanOut {
    pub fn new(capacity: usize) -> Self {
        Self {
            consumers: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Register a new consumer queue and return its id plus the read end.
    /// A consumer registered here sees every later broadcast it has capacity
    /// for, and nothing broadcast before it registered.
    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<Bytes>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
        consumers.insert(id, tx);
        tracing::debug!(%id, total = consumers.len(), "fan-out consumer added");
        (id, rx)
    }

    /// Remove a consumer. Dropping the write end closes its queue exactly
    /// once; unknown ids are a no-op.
    pub fn unsubscribe(&self, id: Uuid) {
        let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
        if consumers.remove(&id).is_some() {
            tracing::debug!(%id, total = consumers.len(), "fan-out consumer removed");
        }
    }

    /// Deliver one datagram to every registered consumer that has capacity.
    /// Consumers whose read end is gone are evicted.
    pub fn broadcast(&self, datagram: Bytes) {
        let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
        let mut dead = Vec::new();
        for (id, queue) in consumers.iter() {
            match queue.try_send(datagram.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!(consumer = %id, "fan-out queue full, datagram dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            consumers.remove(&id);
            tracing::debug!(consumer = %id, "fan-out consumer gone, evicted");
        }
    }

    /// Close every remaining queue and clear the registry.
    pub fn close(&self) {
        let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
        let count = consumers.len();
        consumers.clear();
        if count > 0 {
            tracing::debug!(count, "fan-out closed, all consumers removed");
        }
    }

    pub fn len(&self) -> usize {
        self.consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_consumer_receives_each_broadcast_once() {
        let fanout = FanOut::new(8);
        let (_, mut a) = fanout.subscribe();
        let (_, mut b) = fanout.subscribe();

        fanout.broadcast(Bytes::from_static(b"one"));
        fanout.broadcast(Bytes::from_static(b"two"));

        assert_eq!(a.recv().await.unwrap(), "one");
        assert_eq!(a.recv().await.unwrap(), "two");
        assert_eq!(b.recv().await.unwrap(), "one");
        assert_eq!(b.recv().await.unwrap(), "two");
        assert!(a.try_recv().is_err(), "no duplicate delivery");
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_broadcasts() {
        let fanout = FanOut::new(8);
        fanout.broadcast(Bytes::from_static(b"early"));

        let (_, mut rx) = fanout.subscribe();
        fanout.broadcast(Bytes::from_static(b"late"));

        assert_eq!(rx.recv().await.unwrap(), "late");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_consumer_drops_while_others_receive() {
        let fanout = FanOut::new(1);
        let (_, mut slow) = fanout.subscribe();
        let (_, mut fast) = fanout.subscribe();

        // fast drains between broadcasts, slow never reads
        fanout.broadcast(Bytes::from_static(b"1"));
        assert_eq!(fast.recv().await.unwrap(), "1");
        fanout.broadcast(Bytes::from_static(b"2"));
        assert_eq!(fast.recv().await.unwrap(), "2");
        fanout.broadcast(Bytes::from_static(b"3"));
        assert_eq!(fast.recv().await.unwrap(), "3");

        // slow got exactly the first datagram, the rest were dropped
        assert_eq!(slow.recv().await.unwrap(), "1");
        assert!(slow.try_recv().is_err());
    }

    #[tokio::test]
    async fn survivors_keep_fifo_order_across_drops() {
        let fanout = FanOut::new(2);
        let (_, mut rx) = fanout.subscribe();

        fanout.broadcast(Bytes::from_static(b"a"));
        fanout.broadcast(Bytes::from_static(b"b"));
        fanout.broadcast(Bytes::from_static(b"c")); // dropped, queue full

        assert_eq!(rx.recv().await.unwrap(), "a");
        assert_eq!(rx.recv().await.unwrap(), "b");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_closes_queue_and_is_idempotent() {
        let fanout = FanOut::new(8);
        let (id, mut rx) = fanout.subscribe();
        assert_eq!(fanout.len(), 1);

        fanout.unsubscribe(id);
        assert_eq!(fanout.len(), 0);
        assert!(rx.recv().await.is_none(), "queue closed on unsubscribe");

        // unknown / already-removed id is a no-op
        fanout.unsubscribe(id);
        fanout.unsubscribe(Uuid::new_v4());
    }

    #[tokio::test]
    async fn dead_consumer_is_evicted_on_broadcast() {
        let fanout = FanOut::new(8);
        let (_, rx) = fanout.subscribe();
        drop(rx);

        fanout.broadcast(Bytes::from_static(b"x"));
        assert_eq!(fanout.len(), 0);
    }

    #[tokio::test]
    async fn close_drops_every_consumer() {
        let fanout = FanOut::new(8);
        let (_, mut a) = fanout.subscribe();
        let (_, mut b) = fanout.subscribe();

        fanout.close();
        assert_eq!(fanout.len(), 0);
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
    }
}
