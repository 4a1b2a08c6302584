//! Incoming Packet Queue
//!
//! Unbounded, lock-free FIFO of received packets used in queue dispatch
//! mode. Producers never block; there is no backpressure, so a consumer
//! that falls behind lets the queue grow without limit.

use crossbeam_queue::SegQueue;
use tokio::sync::Notify;

use crate::connection::PacketEnvelope;

/// Multi-producer, multi-consumer queue of received packets
#[derive(Debug, Default)]
pub struct IncomingPacketQueue {
    inner: SegQueue<PacketEnvelope>,
    available: Notify,
}

impl IncomingPacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a packet. Never blocks.
    pub fn push(&self, envelope: PacketEnvelope) {
        self.inner.push(envelope);
        self.available.notify_one();
    }

    /// Dequeue the oldest packet, if any
    pub fn try_pop(&self) -> Option<PacketEnvelope> {
        self.inner.pop()
    }

    /// Wait for the next packet
    pub async fn pop(&self) -> PacketEnvelope {
        loop {
            if let Some(envelope) = self.inner.pop() {
                // Hand the wakeup on so other waiting consumers see what is left.
                if !self.inner.is_empty() {
                    self.available.notify_one();
                }
                return envelope;
            }
            self.available.notified().await;
        }
    }

    /// Dequeue up to `max` packets in FIFO order
    pub fn pop_batch(&self, max: usize) -> Vec<PacketEnvelope> {
        let mut batch = Vec::with_capacity(max.min(self.inner.len()));
        while batch.len() < max {
            match self.inner.pop() {
                Some(envelope) => batch.push(envelope),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    fn envelope(id: ConnectionId, n: u32) -> PacketEnvelope {
        PacketEnvelope::new(id, Bytes::from(n.to_be_bytes().to_vec()))
    }

    #[test]
    fn test_fifo_order() {
        let queue = IncomingPacketQueue::new();
        let id = ConnectionId::new();
        for n in 0..5 {
            queue.push(envelope(id, n));
        }

        assert_eq!(queue.len(), 5);
        for n in 0..5 {
            assert_eq!(queue.try_pop(), Some(envelope(id, n)));
        }
        assert!(queue.try_pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_batch() {
        let queue = IncomingPacketQueue::new();
        let id = ConnectionId::new();
        for n in 0..3 {
            queue.push(envelope(id, n));
        }

        let batch = queue.pop_batch(2);
        assert_eq!(batch, vec![envelope(id, 0), envelope(id, 1)]);
        assert_eq!(queue.pop_batch(10), vec![envelope(id, 2)]);
        assert!(queue.pop_batch(10).is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(IncomingPacketQueue::new());
        let id = ConnectionId::new();

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(envelope(id, 7));

        let received = timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
        assert_eq!(received, envelope(id, 7));
    }

    #[tokio::test]
    async fn test_concurrent_producers_keep_per_producer_order() {
        let queue = Arc::new(IncomingPacketQueue::new());
        let ids: Vec<ConnectionId> = (0..4).map(|_| ConnectionId::new()).collect();

        let producers: Vec<_> = ids
            .iter()
            .map(|&id| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    for n in 0..100 {
                        queue.push(envelope(id, n));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        let all = queue.pop_batch(usize::MAX);
        assert_eq!(all.len(), 400);
        for id in ids {
            let sequence: Vec<u32> = all
                .iter()
                .filter(|e| e.connection_id == id)
                .map(|e| u32::from_be_bytes(e.payload[..4].try_into().unwrap()))
                .collect();
            assert_eq!(sequence, (0..100).collect::<Vec<_>>());
        }
    }
}
