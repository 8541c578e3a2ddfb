//! Buffered-retry pusher.
//!
//! Adapter between the router and a peer that may be transiently
//! unreachable: failed pushes are parked in an in-memory FIFO and drained,
//! in order, ahead of the next push. Callers never see transient errors
//! and no message is dropped or reordered around a newer one.

use crate::error::Result;
use crate::message::Message;
use crate::router::Pusher;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct ReliablePusher {
    inner: Arc<dyn Pusher>,
    buffer: Mutex<VecDeque<(String, Message)>>,
}

impl ReliablePusher {
    pub fn new(inner: Arc<dyn Pusher>) -> ReliablePusher {
        ReliablePusher {
            inner,
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    /// Messages currently parked for retry.
    pub async fn buffered_messages(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

#[async_trait]
impl Pusher for ReliablePusher {
    async fn push(&self, name: &str, msg: &Message) -> Result<()> {
        let mut buffer = self.buffer.lock().await;

        // Drain older intents first so order is preserved. A failed drain
        // parks the current push behind them.
        while let Some((queued_name, queued_msg)) = buffer.front() {
            match self.inner.push(queued_name, queued_msg).await {
                Ok(()) => {
                    buffer.pop_front();
                }
                Err(err) => {
                    debug!(error = %err, "retry drain stalled, buffering push");
                    buffer.push_back((name.to_string(), msg.clone()));
                    return Ok(());
                }
            }
        }

        if let Err(err) = self.inner.push(name, msg).await {
            debug!(error = %err, "push failed, buffering for retry");
            buffer.push_back((name.to_string(), msg.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Pusher;
    use parking_lot::Mutex as SyncMutex;

    /// Fails the first `failures` pushes, then records the rest.
    struct FlakyPusher {
        failures: SyncMutex<usize>,
        seen: SyncMutex<Vec<Vec<u8>>>,
    }

    impl FlakyPusher {
        fn new(failures: usize) -> FlakyPusher {
            FlakyPusher {
                failures: SyncMutex::new(failures),
                seen: SyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Pusher for FlakyPusher {
        async fn push(&self, _name: &str, msg: &Message) -> Result<()> {
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(crate::error::Error::Disconnected);
                }
            }
            self.seen.lock().push(msg.body.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn buffers_failures_and_drains_in_order() {
        let flaky = Arc::new(FlakyPusher::new(2));
        let reliable = ReliablePusher::new(flaky.clone());

        reliable.push("q", &Message::new(b"1".to_vec())).await.unwrap();
        reliable.push("q", &Message::new(b"2".to_vec())).await.unwrap();
        assert_eq!(reliable.buffered_messages().await, 2);

        // Peer is healthy again; the next push drains the backlog first.
        reliable.push("q", &Message::new(b"3".to_vec())).await.unwrap();
        assert_eq!(reliable.buffered_messages().await, 0);
        assert_eq!(
            flaky.seen.lock().clone(),
            vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]
        );
    }

    #[tokio::test]
    async fn never_reorders_around_a_stalled_drain() {
        let flaky = Arc::new(FlakyPusher::new(3));
        let reliable = ReliablePusher::new(flaky.clone());

        reliable.push("q", &Message::new(b"1".to_vec())).await.unwrap();
        // Every drain of "1" keeps failing, so later pushes park behind it.
        reliable.push("q", &Message::new(b"2".to_vec())).await.unwrap();
        reliable.push("q", &Message::new(b"3".to_vec())).await.unwrap();
        assert_eq!(reliable.buffered_messages().await, 3);
        assert!(flaky.seen.lock().is_empty());

        reliable.push("q", &Message::new(b"4".to_vec())).await.unwrap();
        assert_eq!(reliable.buffered_messages().await, 0);
        assert_eq!(
            flaky.seen.lock().clone(),
            vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]
        );
    }

    #[tokio::test]
    async fn healthy_pushes_bypass_the_buffer() {
        let flaky = Arc::new(FlakyPusher::new(0));
        let reliable = ReliablePusher::new(flaky.clone());
        reliable.push("q", &Message::new(b"x".to_vec())).await.unwrap();
        assert_eq!(reliable.buffered_messages().await, 0);
        assert_eq!(flaky.seen.lock().len(), 1);
    }
}
