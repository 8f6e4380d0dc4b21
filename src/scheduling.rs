//! Debounce and deadline primitives.
//!
//! The broker batches client edits behind a trailing-edge debounce window and
//! bounds every handshake wait with a wall-clock deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::trace;

use crate::error::{Error, Result};

/// Wraps a future with a wall-clock deadline. The timer is dropped as soon as
/// the inner future settles; on expiry the inner future is abandoned and
/// [`Error::Timeout`] surfaces.
pub async fn with_timeout<T>(duration: Duration, future: impl Future<Output = T>) -> Result<T> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| Error::Timeout(duration))
}

pub type DebounceAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

enum Command {
    Trigger,
    Flush(oneshot::Sender<()>),
    Clear,
}

/// Trailing-edge debouncer. `trigger` (re)arms the window; when it elapses
/// without another trigger the action runs once. `flush` runs a pending
/// action immediately and only returns after it completed, so state observed
/// right after a flush is post-action state. `clear` drops any pending
/// trigger without running the action.
///
/// The worker task ends when the `Debouncer` is dropped.
pub struct Debouncer {
    tx: mpsc::UnboundedSender<Command>,
}

impl Debouncer {
    pub fn new(window: Duration, action: DebounceAction) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

        tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;
            loop {
                let window_elapsed = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    command = rx.recv() => match command {
                        None => break,
                        Some(Command::Trigger) => {
                            deadline = Some(Instant::now() + window);
                        }
                        Some(Command::Clear) => {
                            deadline = None;
                        }
                        Some(Command::Flush(done)) => {
                            if deadline.take().is_some() {
                                action().await;
                            }
                            let _ = done.send(());
                        }
                    },
                    _ = window_elapsed => {
                        deadline = None;
                        action().await;
                    }
                }
            }
            trace!("debouncer task terminated");
        });

        Debouncer { tx }
    }

    /// (Re)arms the trailing window.
    pub fn trigger(&self) {
        let _ = self.tx.send(Command::Trigger);
    }

    /// Runs a pending action now; resolves once it completed. No-op when
    /// nothing is pending.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Drops any pending trigger without running the action.
    pub fn clear(&self) {
        let _ = self.tx.send(Command::Clear);
    }
}
