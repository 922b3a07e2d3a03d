use log::{debug, error};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Collapses bursts of change notifications into single refreshes.
///
/// The first notification arms the delay timer; anything arriving while the
/// timer runs or the refresh executes is dropped. The busy state clears when
/// the refresh finishes, success or failure. Dropping the `Refresher` ends
/// the loop.
pub struct Refresher {
    notify_tx: mpsc::Sender<()>,
}

impl Refresher {
    /// Spawn the refresh loop. `refresh` runs once per collapsed burst; a
    /// failed refresh is logged and the loop keeps going.
    pub fn spawn<F, Fut>(delay: Duration, mut refresh: F) -> (Self, JoinHandle<()>)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(async move {
            while notify_rx.recv().await.is_some() {
                tokio::time::sleep(delay).await;
                // Everything that arrived during the delay belongs to this burst.
                while notify_rx.try_recv().is_ok() {}

                if let Err(e) = refresh().await {
                    error!("Refresh failed: {:#}", e);
                }

                // Notifications that raced the refresh saw pre-refresh state.
                while notify_rx.try_recv().is_ok() {}
            }
            debug!("Refresher: notification channel closed");
        });
        (Self { notify_tx }, handle)
    }

    /// Mark the node state dirty. Never blocks; while a refresh is already
    /// pending or running the notification is dropped.
    pub fn notify(&self) {
        let _ = self.notify_tx.try_send(());
    }
}
