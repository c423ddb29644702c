use log::{debug, error, trace};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tokio::sync::{mpsc, oneshot};

/// Unit of work delivered to a queue
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Spawn a named thread draining `receiver` until every sender is gone.
/// A panicking task is logged and does not take the thread down.
fn spawn_consumer(name: &str, mut receiver: mpsc::UnboundedReceiver<Task>) -> std::io::Result<ThreadId> {
    let thread_name = name.to_string();
    let handle = thread::Builder::new().name(thread_name.clone()).spawn(move || {
        while let Some(task) = receiver.blocking_recv() {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("Task panicked on {}", thread_name);
            }
        }
        debug!("{} stopped", thread_name);
    })?;
    Ok(handle.thread().id())
}

/// The UI-affinity thread. Observer callbacks only ever run here.
pub struct UiDispatcher {
    sender: mpsc::UnboundedSender<Task>,
    thread_id: ThreadId,
}

impl UiDispatcher {
    pub fn start(name: &str) -> std::io::Result<Arc<Self>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let thread_id = spawn_consumer(name, receiver)?;
        Ok(Arc::new(Self { sender, thread_id }))
    }

    pub fn is_dispatch_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Queue a task on the UI thread
    pub fn invoke_later(&self, task: Task) {
        if self.sender.send(task).is_err() {
            debug!("UI dispatcher is shut down, dropping task");
        }
    }

    /// Run the task right away when already on the UI thread, otherwise queue it
    pub fn invoke(&self, task: Task) {
        if self.is_dispatch_thread() {
            task();
        } else {
            self.invoke_later(task);
        }
    }
}

/// Single-threaded FIFO queue whose tasks are redispatched onto the UI thread
pub struct DeliveryQueue {
    name: String,
    sender: mpsc::UnboundedSender<Task>,
    ui: Arc<UiDispatcher>,
}

impl DeliveryQueue {
    pub fn start(name: &str, ui: Arc<UiDispatcher>) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        spawn_consumer(name, receiver)?;
        Ok(Self {
            name: name.to_string(),
            sender,
            ui,
        })
    }

    pub fn post(&self, task: Task) {
        let ui = Arc::clone(&self.ui);
        let hop: Task = Box::new(move || ui.invoke(task));
        if self.sender.send(hop).is_err() {
            debug!("{} is shut down, dropping task", self.name);
        }
    }

    /// Resolves once everything posted before the call has run on the UI thread
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.post(Box::new(move || {
            let _ = done.send(());
        }));
        let _ = wait.await;
    }
}

/// Which delivery queue a notification travels through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Observer and event bus notifications
    Notification,
    /// Completions of background workers
    Loader,
}

/// The two delivery queues and the UI thread they feed
pub struct Notifier {
    ui: Arc<UiDispatcher>,
    notification: DeliveryQueue,
    loader: DeliveryQueue,
}

impl Notifier {
    pub fn start() -> std::io::Result<Arc<Self>> {
        let ui = UiDispatcher::start("ui-dispatch")?;
        Self::with_dispatcher(ui)
    }

    pub fn with_dispatcher(ui: Arc<UiDispatcher>) -> std::io::Result<Arc<Self>> {
        let notification = DeliveryQueue::start("notification-queue", Arc::clone(&ui))?;
        let loader = DeliveryQueue::start("loader-queue", Arc::clone(&ui))?;
        Ok(Arc::new(Self {
            ui,
            notification,
            loader,
        }))
    }

    pub fn ui(&self) -> &Arc<UiDispatcher> {
        &self.ui
    }

    pub fn post(&self, channel: Channel, task: Task) {
        trace!("Posting task on {:?} queue", channel);
        match channel {
            Channel::Notification => self.notification.post(task),
            Channel::Loader => self.loader.post(task),
        }
    }

    pub fn notify(&self, task: Task) {
        self.notification.post(task);
    }

    /// Wait until both queues have delivered everything posted so far
    pub async fn flush(&self) {
        self.notification.flush().await;
        self.loader.flush().await;
    }
}
