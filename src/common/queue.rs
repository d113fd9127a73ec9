//! Message queues for inter-component communication.
//!
//! Provides both point-to-point (Queue) and broadcast (BroadcastQueue) messaging.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{OrchflowError, Result};

/// Bounded MPMC (multi-producer, multi-consumer) queue.
///
/// Used for run command queues where every event is consumed by exactly one
/// coordinator loop.
/// Backed by flume for high-performance message passing.
#[derive(Clone)]
pub struct Queue<T> {
    receiver: Arc<flume::Receiver<T>>,
    sender: Arc<flume::Sender<T>>,
}

#[allow(unused)]
impl<T> Queue<T> {
    /// create a new queue
    pub fn new(cap: usize) -> Arc<Self> {
        let (tx, rx) = flume::bounded(cap);

        Arc::new(Self {
            receiver: Arc::new(rx),
            sender: Arc::new(tx),
        })
    }

    /// receive a message without waiting
    pub fn try_next(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// send a message to the queue, failing instead of blocking when it is full
    pub fn send(
        &self,
        msg: T,
    ) -> Result<()> {
        self.sender.try_send(msg).map_err(|e| OrchflowError::Queue(e.to_string()))
    }

    /// receive a message from the queue asynchronously
    pub async fn next_async(&self) -> Option<T> {
        self.receiver.recv_async().await.ok()
    }

    /// number of queued messages
    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}

/// Broadcast queue for one-to-many message distribution.
///
/// Used for run and node events where every subscriber receives every message.
/// Backed by tokio's broadcast channel.
#[derive(Clone)]
pub struct BroadcastQueue<T> {
    sender: Arc<broadcast::Sender<T>>,
}

impl<T: Clone> BroadcastQueue<T> {
    /// create a new broadcast queue
    pub fn new(cap: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(cap);

        Arc::new(Self {
            sender: Arc::new(tx),
        })
    }

    /// send a message to the queue
    pub fn send(
        &self,
        msg: T,
    ) -> Result<()> {
        // no subscribers is not an error for fire-and-forget events
        let _ = self.sender.send(msg);
        Ok(())
    }

    /// subscribe to the queue
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let queue = Queue::new(4);
        queue.send(1).unwrap();
        queue.send(2).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next_async().await, Some(1));
        assert_eq!(queue.try_next(), Some(2));
        assert_eq!(queue.try_next(), None);
    }

    #[test]
    fn test_queue_full_is_an_error() {
        let queue = Queue::new(1);
        queue.send("a").unwrap();
        assert!(matches!(queue.send("b"), Err(OrchflowError::Queue(_))));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let queue = BroadcastQueue::new(8);
        let mut a = queue.subscribe();
        let mut b = queue.subscribe();
        queue.send("event").unwrap();
        assert_eq!(a.recv().await.unwrap(), "event");
        assert_eq!(b.recv().await.unwrap(), "event");
    }
}
