use log::debug;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::logic::notification::{Channel, Notifier};

/// Handle on a background worker started with [`spawn_worker`]
pub struct WorkerHandle {
    name: String,
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker to stop. Its result, if any, is disregarded.
    pub fn cancel(&self) {
        debug!("Cancelling worker {}", self.name);
        let _ = self.cancel.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the worker task to end, whether it completed or was cancelled
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

async fn cancelled(receiver: &mut watch::Receiver<bool>) {
    while !*receiver.borrow() {
        if receiver.changed().await.is_err() {
            // sender gone: nobody can cancel any more
            std::future::pending::<()>().await;
        }
    }
}

/// Run `work` on the runtime and hand its result to `on_done` on the UI thread
/// through the loader queue, unless the worker was cancelled first.
pub fn spawn_worker<T, W, D>(notifier: &Arc<Notifier>, name: &str, work: W, on_done: D) -> WorkerHandle
where
    T: Send + 'static,
    W: Future<Output = T> + Send + 'static,
    D: FnOnce(T) + Send + 'static,
{
    let (cancel, mut cancel_rx) = watch::channel(false);
    let notifier = Arc::clone(notifier);
    let worker_name = name.to_string();
    let join = tokio::spawn(async move {
        let result = tokio::select! {
            result = work => Some(result),
            _ = cancelled(&mut cancel_rx) => None,
        };
        match result {
            Some(result) if !*cancel_rx.borrow() => {
                // cancel may still arrive while the result waits in the queue
                let cancel_rx = cancel_rx.clone();
                notifier.post(
                    Channel::Loader,
                    Box::new(move || {
                        if *cancel_rx.borrow() {
                            debug!("Worker {} was cancelled before delivery", worker_name);
                        } else {
                            on_done(result);
                        }
                    }),
                );
            }
            _ => debug!("Worker {} was cancelled, disregarding its result", worker_name),
        }
    });
    WorkerHandle {
        name: name.to_string(),
        cancel,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_completed_worker_delivers_on_ui_thread() {
        let notifier = Notifier::start().unwrap();
        let delivered = Arc::new(Mutex::new(None));

        let sink = Arc::clone(&delivered);
        let ui = Arc::clone(notifier.ui());
        let worker = spawn_worker(&notifier, "answer", async { 42 }, move |value| {
            *sink.lock() = Some((value, ui.is_dispatch_thread()));
        });
        worker.join().await;
        notifier.flush().await;

        assert_eq!(*delivered.lock(), Some((42, true)));
    }

    #[tokio::test]
    async fn test_cancelled_worker_never_delivers() {
        let notifier = Notifier::start().unwrap();
        let delivered = Arc::new(Mutex::new(false));

        let sink = Arc::clone(&delivered);
        let worker = spawn_worker(
            &notifier,
            "slow",
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                1
            },
            move |_| *sink.lock() = true,
        );
        worker.cancel();
        assert!(worker.is_cancelled());
        worker.join().await;
        notifier.flush().await;

        assert!(!*delivered.lock());
    }

    #[tokio::test]
    async fn test_cancel_after_post_is_disregarded() {
        let notifier = Notifier::start().unwrap();
        let delivered = Arc::new(Mutex::new(false));

        // hold the UI thread so the posted result waits in the queue
        let (release, wait) = std::sync::mpsc::channel::<()>();
        notifier.ui().invoke_later(Box::new(move || {
            let _ = wait.recv();
        }));

        let sink = Arc::clone(&delivered);
        let worker = spawn_worker(&notifier, "quick", async { 1 }, move |_| *sink.lock() = true);
        while !worker.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        worker.cancel();
        release.send(()).unwrap();
        notifier.flush().await;

        assert!(!*delivered.lock());
    }
}
