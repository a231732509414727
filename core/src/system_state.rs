use tokio::sync::watch;

/// Cooperative shutdown handle shared between the orchestrator, the sync
/// engines and the dispatcher.
///
/// Cancellation is a first-class signal rather than an exception: components
/// poll [`ShutdownSignal::is_shutdown`] at suspension points and short-circuit
/// outstanding work. The sentinel error each module maps this to is
/// distinguishable from real failures so callers can treat it as a graceful
/// termination.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn new() -> (ShutdownHandle, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownHandle { tx }, ShutdownSignal { rx })
    }

    /// Flip the signal. All clones of the paired [`ShutdownSignal`] observe it.
    pub fn initiate_shutdown(&self) {
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal { rx: self.tx.subscribe() }
    }
}

impl ShutdownSignal {
    /// A signal that never fires, for tests and standalone components.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the receiver never errors.
        std::mem::forget(tx);
        ShutdownSignal { rx }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when shutdown is initiated. Intended for `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without signalling: treat as shutdown so
                // orphaned tasks wind down rather than spin.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal_propagates_to_clones() {
        let (handle, signal) = ShutdownHandle::new();
        let clone = signal.clone();
        assert!(!clone.is_shutdown());

        handle.initiate_shutdown();
        assert!(signal.is_shutdown());
        assert!(clone.is_shutdown());
        clone.cancelled().await;
    }

    #[tokio::test]
    async fn test_never_signal_stays_live() {
        let signal = ShutdownSignal::never();
        assert!(!signal.is_shutdown());
    }
}
