// src/task/cancel.rs

//! Out-of-band cancellation signal for agent executors.

use tokio::sync::watch;

/// Receiving side of a task's cancellation signal.
///
/// Canceling a task moves it to `canceled` in the store *and* flips this
/// signal, so an executor that is mid-work can stop. The signal is sticky:
/// handles obtained after the cancel still observe it.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the task is canceled.
    ///
    /// Resolves immediately if it already is. If the store drops the task's
    /// sender without canceling, this never resolves.
    pub async fn canceled(&mut self) {
        if self.rx.wait_for(|canceled| *canceled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
