use crate::coordinator::CoordinatorState;
use crate::error::{ObegransadError, Result};
use std::sync::Arc;
use tokio::sync::watch;

/// Receiver for coordinator snapshots
///
/// Every receiver sees the latest published state; intermediate states may be
/// skipped if the reader is slower than the poll interval.
#[derive(Clone)]
pub struct StateReceiver {
    rx: watch::Receiver<Arc<CoordinatorState>>,
}

impl StateReceiver {
    pub(crate) fn new(rx: watch::Receiver<Arc<CoordinatorState>>) -> Self {
        Self { rx }
    }

    /// Wait for the next published change and return it
    ///
    /// Fails with `ConnectionClosed` once the coordinator has been dropped.
    pub async fn changed(&mut self) -> Result<Arc<CoordinatorState>> {
        self.rx
            .changed()
            .await
            .map_err(|_| ObegransadError::ConnectionClosed)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// The most recently published snapshot, without waiting
    pub fn current(&self) -> Arc<CoordinatorState> {
        self.rx.borrow().clone()
    }

    /// Whether a snapshot newer than the last one seen is available
    pub fn has_changed(&self) -> Result<bool> {
        self.rx
            .has_changed()
            .map_err(|_| ObegransadError::ConnectionClosed)
    }
}
