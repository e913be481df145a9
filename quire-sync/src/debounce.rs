//! Cancel-and-reschedule timer.
//!
//! Every `schedule` call restarts the quiescence window. Only the sleep is
//! cancellable: once the window elapses the action is spawned as its own task,
//! so a later `schedule` or `cancel` never cuts an in-flight write short.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Debouncer {
    window: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(None),
        }
    }

    /// Arm the timer, replacing any pending one.
    pub fn schedule<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let window = self.window;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            tokio::spawn(action());
        });

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = pending.replace(timer) {
            previous.abort();
        }
    }

    /// Disarm the timer. Returns whether a pending timer was cancelled.
    pub fn cancel(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.take() {
            Some(timer) if !timer.is_finished() => {
                timer.abort();
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.as_ref().is_some_and(|timer| !timer.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_action(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn test_fires_once_after_window() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        let fired = Arc::new(AtomicUsize::new(0));

        debouncer.schedule(counting_action(&fired));
        assert!(debouncer.is_pending());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test]
    async fn test_reschedule_coalesces() {
        let debouncer = Debouncer::new(Duration::from_millis(60));
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            debouncer.schedule(counting_action(&fired));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let debouncer = Debouncer::new(Duration::from_millis(30));
        let fired = Arc::new(AtomicUsize::new(0));

        debouncer.schedule(counting_action(&fired));
        assert!(debouncer.cancel());
        assert!(!debouncer.cancel());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
