use crossbeam::channel::{self, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Process-wide stop signal shared by the producer, the broadcast loop and
/// the signal handler.
///
/// Triggering drops the only sender of an internal channel, so every clone of
/// [`Shutdown::receiver`] becomes permanently ready inside a `select!`.
#[derive(Clone)]
pub struct Shutdown {
    triggered: Arc<AtomicBool>,
    notify: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Mutex::new(Some(tx))),
            receiver: rx,
        }
    }

    /// Request shutdown. Safe to call more than once.
    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            log::debug!("🛑 Shutdown requested");
        }
        if let Ok(mut notify) = self.notify.lock() {
            notify.take();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Becomes disconnected (always ready) once shutdown is triggered.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_trigger_wakes_receivers() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        assert!(!clone.is_triggered());
        assert!(clone
            .receiver()
            .recv_timeout(Duration::from_millis(10))
            .is_err());

        shutdown.trigger();
        assert!(clone.is_triggered());
        assert_eq!(
            clone.receiver().recv_timeout(Duration::from_secs(1)),
            Err(channel::RecvTimeoutError::Disconnected)
        );

        // Second trigger is harmless
        shutdown.trigger();
        assert!(shutdown.is_triggered());
    }
}
