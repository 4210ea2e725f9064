//! A shutdown-aware multi-producer/multi-consumer queue.
//!
//! Every producer/consumer pairing in the workspace (the DB worker's input
//! queue, the dispatch queue, the per-agent worker submission queue) goes
//! through one of these rather than a bare channel, so that shutting down
//! one stage reliably wakes every thread blocked on it instead of leaving
//! some of them parked forever.

use crossbeam_channel::{Receiver, Sender};
use snafu::Snafu;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Snafu)]
pub enum QueueError {
    #[snafu(display("queue has shut down"))]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, QueueError>;

enum Msg<T> {
    Item(T),
    Shutdown,
}

/// A hook run when the queue shuts down, e.g. writing a wakeup byte to a
/// notify FIFO so a thread blocked on a different fd also wakes up.
pub type ShutdownHook = Arc<dyn Fn() + Send + Sync>;

pub struct Queue<T> {
    tx: Sender<Msg<T>>,
    rx: Receiver<Msg<T>>,
    closed: Arc<AtomicBool>,
    on_shutdown: Option<ShutdownHook>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            closed: Arc::clone(&self.closed),
            on_shutdown: self.on_shutdown.clone(),
        }
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            closed: Arc::new(AtomicBool::new(false)),
            on_shutdown: None,
        }
    }

    pub fn with_shutdown_hook(mut self, hook: ShutdownHook) -> Self {
        self.on_shutdown = Some(hook);
        self
    }

    /// Enqueues an item. Fails once `shutdown` has been called.
    pub fn put(&self, item: T) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::ShutDown);
        }
        self.tx.send(Msg::Item(item)).map_err(|_| QueueError::ShutDown)
    }

    /// Blocks for the next item. Returns `Err(ShutDown)` once the queue has
    /// been shut down and drained of real items.
    pub fn get(&self) -> Result<T> {
        match self.rx.recv() {
            Ok(Msg::Item(item)) => Ok(item),
            Ok(Msg::Shutdown) => {
                // Re-push the sentinel so every other blocked consumer also
                // observes shutdown instead of just the one that won the race.
                let _ = self.tx.send(Msg::Shutdown);
                Err(QueueError::ShutDown)
            }
            Err(_) => Err(QueueError::ShutDown),
        }
    }

    /// Flips the shutdown flag, pushes the sentinel, and runs the shutdown
    /// hook (if any). Idempotent.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(hook) = &self.on_shutdown {
            hook();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn put_then_get_preserves_fifo_order() {
        let q: Queue<u32> = Queue::new();
        q.put(1).unwrap();
        q.put(2).unwrap();
        assert_eq!(q.get().unwrap(), 1);
        assert_eq!(q.get().unwrap(), 2);
    }

    #[test]
    fn put_after_shutdown_fails() {
        let q: Queue<u32> = Queue::new();
        q.shutdown();
        assert!(matches!(q.put(1), Err(QueueError::ShutDown)));
    }

    #[test]
    fn get_after_drain_and_shutdown_fails() {
        let q: Queue<u32> = Queue::new();
        q.put(1).unwrap();
        q.shutdown();
        assert_eq!(q.get().unwrap(), 1);
        assert!(matches!(q.get(), Err(QueueError::ShutDown)));
    }

    #[test]
    fn shutdown_wakes_all_blocked_consumers() {
        let q: Queue<u32> = Queue::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || q.get().is_err())
            })
            .collect();

        // give the consumers a moment to block on recv
        thread::sleep(std::time::Duration::from_millis(20));
        q.shutdown();

        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn shutdown_hook_runs_once_per_call() {
        let q: Queue<u32> = Queue::new();
        let calls = Arc::new(AtomicBool::new(false));
        let calls2 = Arc::clone(&calls);
        let q = q.with_shutdown_hook(Arc::new(move || calls2.store(true, Ordering::SeqCst)));
        q.shutdown();
        assert!(calls.load(Ordering::SeqCst));
    }
}
