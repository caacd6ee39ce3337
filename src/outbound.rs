//! Serialized delivery of frames onto one client connection.
//!
//! Producers (stream readers, the read loop, keep-alive) call
//! [`OutboundChannel::send`], which never waits: a full queue drops the frame.
//! A single delivery task owns the write half of the connection and drains
//! the queue in enqueue order.

use futures_util::{Sink, SinkExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Cloneable handle to a connection's outbound queue.
pub struct OutboundChannel<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    tx: mpsc::Sender<T>,
    capacity: usize,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Clone for OutboundChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> OutboundChannel<T> {
    /// Start the delivery task writing into `sink`.
    pub fn spawn<S>(sink: S, capacity: usize) -> Self
    where
        S: Sink<T> + Send + Unpin + 'static,
        S::Error: Display,
    {
        let (tx, rx) = mpsc::channel(capacity);
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(deliver(rx, sink, Arc::clone(&shutdown)));
        Self {
            inner: Arc::new(Inner {
                tx,
                capacity,
                closed: AtomicBool::new(false),
                shutdown,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Enqueue a frame. Returns `false` if it was dropped because the queue
    /// is full or the channel is closed.
    pub fn send(&self, frame: T) -> bool {
        if self.is_closed() {
            trace!("Outbound channel closed, discarding frame");
            return false;
        }
        match self.inner.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    capacity = self.inner.capacity,
                    "Message queue full, dropping message"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Delivery task gone, discarding frame");
                false
            }
        }
    }

    /// Stop the delivery task. Safe to call any number of times.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Wait for the delivery task to finish. Only the first caller waits.
    pub async fn finished(&self) {
        let task = self.inner.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn deliver<T, S>(mut rx: mpsc::Receiver<T>, mut sink: S, shutdown: Arc<Notify>)
where
    S: Sink<T> + Unpin,
    S::Error: Display,
{
    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        debug!("Error sending message: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    rx.close();
    let _ = sink.close().await;
}


#[cfg(test)]
mod tests {
    use super::testing::collecting_channel;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_in_enqueue_order() {
        let (out, mut rx) = collecting_channel::<u32>(16);
        for i in 0..10 {
            assert!(out.send(i));
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn full_queue_drops_newest_without_blocking() {
        // current-thread runtime: the delivery task cannot drain until we yield
        let (out, mut rx) = collecting_channel::<u32>(2);
        assert!(out.send(1));
        assert!(out.send(2));
        assert!(!out.send(3));
        assert!(!out.send(4));

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert!(out.send(5));
        assert_eq!(rx.recv().await, Some(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_keep_their_own_order() {
        let (out, mut rx) = collecting_channel::<(u8, u32)>(4096);
        let mut producers = Vec::new();
        for p in 0..4u8 {
            let out = out.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..200u32 {
                    out.send((p, i));
                    if i % 17 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let mut next = [0u32; 4];
        for _ in 0..800 {
            let (p, i) = rx.recv().await.unwrap();
            assert_eq!(next[p as usize], i);
            next[p as usize] += 1;
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_delivery() {
        let (out, mut rx) = collecting_channel::<u32>(8);
        out.close();
        out.close();
        assert!(out.is_closed());
        assert!(!out.send(1));

        tokio::time::timeout(Duration::from_secs(1), out.finished())
            .await
            .unwrap();
        // Sink was dropped with the delivery task.
        assert_eq!(rx.recv().await, None);
    }
}
