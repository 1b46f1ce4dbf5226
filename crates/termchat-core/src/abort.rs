use tokio::sync::watch;

/// Handle used to request cancellation of a running turn.
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Requests cancellation.
    ///
    /// Cancellation is observed while dispatching, while backing off between
    /// attempts, and while reading the response body. The turn then fails
    /// with `ChatError::Cancelled` and nothing partial is persisted.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving side of an [`AbortHandle`].
#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

/// Creates a connected handle/signal pair.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, signal) = abort_pair();
        signal
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the handle
    /// is dropped without aborting.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
