//! Deferred destruction.
//!
//! Teardown of pipes and endpoints must join (`stop`) the very AIOs whose
//! callbacks may be the caller's own stack frame; doing that inline would
//! self-deadlock. Instead, teardown futures are queued here and run on a
//! dedicated worker task, guaranteed to be outside any callback stack of
//! the object being destroyed. The worker drains the queue serially.

use std::future::Future;
use std::pin::Pin;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::mpsc;

type Teardown = Pin<Box<dyn Future<Output = ()> + Send>>;

// The worker is respawned if its runtime went away (each tokio runtime
// that uses the reaper gets one as needed).
static WORKER: Lazy<Mutex<Option<mpsc::UnboundedSender<Teardown>>>> =
    Lazy::new(|| Mutex::new(None));

/// Queue a teardown future for deferred execution.
///
/// Must be called from within a tokio runtime (the worker is spawned
/// lazily on first use).
pub fn schedule(teardown: impl Future<Output = ()> + Send + 'static) {
    let mut teardown: Teardown = Box::pin(teardown);
    let mut guard = WORKER.lock();
    if let Some(tx) = guard.as_ref() {
        match tx.send(teardown) {
            Ok(()) => return,
            Err(mpsc::error::SendError(t)) => teardown = t,
        }
    }
    let (tx, mut rx) = mpsc::unbounded_channel::<Teardown>();
    tokio::spawn(async move {
        while let Some(teardown) = rx.recv().await {
            teardown.await;
        }
    });
    // Cannot fail: the receiver was just created.
    let _ = tx.send(teardown);
    *guard = Some(tx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn teardown_runs_off_the_calling_stack() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        schedule(async move {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while !ran.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queued_teardowns_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            schedule(async move {
                order.lock().push(i);
            });
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while order.lock().len() < 4 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }
}
