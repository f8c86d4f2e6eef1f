//! Cancelable trailing-edge debounce timer.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

type Action<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs `action` with the most recent value once no new value has been
/// pushed for `delay`.
///
/// Every push restarts the timer and replaces the buffered value. When the
/// timer fires the action is spawned as its own task, so a later push or
/// [`cancel`](Debouncer::cancel) never aborts an action already running.
pub struct Debouncer<T> {
    label: &'static str,
    delay: Duration,
    action: Action<T>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new<F, Fut>(label: &'static str, delay: Duration, action: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            label,
            delay,
            action: Arc::new(move |value| Box::pin(action(value))),
            timer: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Buffer `value` and restart the timer
    pub fn push(&self, value: T) {
        let action = self.action.clone();
        let delay = self.delay;
        let label = self.label;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trace!(debouncer = label, "Debounce fired");
            tokio::spawn(action(value));
        });

        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Drop the buffered value. Returns whether a timer was still pending.
    pub fn cancel(&self) -> bool {
        match self.timer.lock().take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}
