//! Single-consumer scheduling contexts.
//!
//! A [`ThreadContext`] pins a logical actor to one event channel: the task
//! draining the receiver is the only code that touches the actor's state, so
//! callbacks within a context run in submission order and no lock is ever
//! needed. Timers deliver events, not closures; one-shot and periodic
//! schedules return handles that cancel the timer when dropped.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a scheduled timer; aborts the timer task on cancel or drop
pub struct Scheduled {
    handle: JoinHandle<()>,
}

impl Scheduled {
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for Scheduled {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serial event executor handle for one subsystem
pub struct ThreadContext<E: Send + 'static> {
    name: String,
    tx: mpsc::Sender<E>,
}

impl<E: Send + 'static> Clone for ThreadContext<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<E: Send + 'static> ThreadContext<E> {
    /// Create a context; the caller owns the receiver and drains it from a
    /// single task
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<E>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue an event; returns false when the consumer is gone
    pub async fn submit(&self, event: E) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Deliver an event once after `delay`
    pub fn schedule(&self, delay: Duration, event: E) -> Scheduled {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event).await;
        });
        Scheduled { handle }
    }

    /// Deliver a cloned event every `interval` until cancelled
    pub fn schedule_repeating(&self, interval: Duration, event: E) -> Scheduled
    where
        E: Clone,
    {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.send(event.clone()).await.is_err() {
                    break;
                }
            }
        });
        Scheduled { handle }
    }
}
