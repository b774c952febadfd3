//! Batching with a flush timer
//!
//! Groups a stream of items into batches of at most `max_items`,
//! flushing a partial batch once `flush_interval` has passed so quiet
//! periods still make progress. The output channel is bounded at one
//! batch, which keeps the producer from racing ahead of a consumer
//! that persists each batch before taking the next.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Batch shape: size cap and flush interval.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub max_items: usize,
    pub flush_interval: Duration,
}

impl BatchConfig {
    pub fn new(max_items: usize, flush_interval: Duration) -> Self {
        Self {
            max_items: max_items.max(1),
            flush_interval,
        }
    }
}

/// Turn a channel of items into a channel of batches.
///
/// The returned receiver yields non-empty batches until the input
/// channel closes; a final partial batch is flushed on close.
pub fn batches<T: Send + 'static>(
    mut rx: mpsc::Receiver<T>,
    config: BatchConfig,
) -> mpsc::Receiver<Vec<T>> {
    let (batch_tx, batch_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut buffer: Vec<T> = Vec::with_capacity(config.max_items);
        let mut timer = interval_at(
            Instant::now() + config.flush_interval,
            config.flush_interval,
        );
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = rx.recv() => {
                    match item {
                        Some(item) => {
                            buffer.push(item);
                            if buffer.len() >= config.max_items {
                                let batch = std::mem::take(&mut buffer);
                                if batch_tx.send(batch).await.is_err() {
                                    return;
                                }
                                timer.reset();
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                let _ = batch_tx.send(buffer).await;
                            }
                            return;
                        }
                    }
                }
                _ = timer.tick() => {
                    if !buffer.is_empty() {
                        let batch = std::mem::take(&mut buffer);
                        if batch_tx.send(batch).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    batch_rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_items: usize, millis: u64) -> BatchConfig {
        BatchConfig::new(max_items, Duration::from_millis(millis))
    }

    #[tokio::test]
    async fn test_flush_by_count() {
        let (tx, rx) = mpsc::channel(16);
        let mut batches = batches(rx, config(3, 60_000));

        for i in 0..7 {
            tx.send(i).await.unwrap();
        }

        assert_eq!(batches.recv().await, Some(vec![0, 1, 2]));
        assert_eq!(batches.recv().await, Some(vec![3, 4, 5]));

        // Closing flushes the remainder
        drop(tx);
        assert_eq!(batches.recv().await, Some(vec![6]));
        assert_eq!(batches.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_by_timer() {
        let (tx, rx) = mpsc::channel(16);
        let mut batches = batches(rx, config(1000, 500));

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();

        // Well under max_items, so only the timer can flush
        let batch = batches.recv().await;
        assert_eq!(batch, Some(vec![1, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_skips_empty_batches() {
        let (tx, rx) = mpsc::channel(16);
        let mut batches = batches(rx, config(10, 100));

        // Several idle intervals pass before the item arrives
        tokio::time::sleep(Duration::from_millis(450)).await;
        tx.send(42).await.unwrap();

        assert_eq!(batches.recv().await, Some(vec![42]));
    }

    #[tokio::test]
    async fn test_close_without_items() {
        let (tx, rx) = mpsc::channel::<u32>(16);
        let mut batches = batches(rx, config(10, 50));

        drop(tx);
        assert_eq!(batches.recv().await, None);
    }
}
