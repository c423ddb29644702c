use log::{error, info};
use std::future::Future;
use std::sync::Arc;

use crate::config::ModelConfig;
use crate::logic::command::Command;
use crate::logic::entity_model::EntityModel;
use crate::logic::event_bus::{EventBus, ModelEventListener, SubscriptionId};
use crate::logic::modify_mgr::ModifyMgr;
use crate::logic::notification::Notifier;
use crate::logic::worker::{spawn_worker, WorkerHandle};
use crate::error::CommandError;
use crate::model::ModelEvent;
use crate::store::Facade;

/// Central error handler: log the error with its whole source chain
pub fn handle_error(err: &dyn std::error::Error) {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    error!("{}", message);
}

/// Entry point wiring the entity model, the command stack and the
/// notification pipeline around one facade
pub struct ModelMgr {
    facade: Arc<dyn Facade>,
    notifier: Arc<Notifier>,
    event_bus: Arc<EventBus>,
    entity_model: Arc<EntityModel>,
    modify_mgr: Arc<ModifyMgr>,
}

impl ModelMgr {
    pub fn new(facade: Arc<dyn Facade>, config: &ModelConfig) -> std::io::Result<Self> {
        let notifier = Notifier::start()?;
        let event_bus = Arc::new(EventBus::new(Arc::clone(&notifier)));
        let entity_model = Arc::new(EntityModel::new(
            Arc::clone(&facade),
            Arc::clone(&event_bus),
            Arc::clone(notifier.ui()),
            config.cache_capacity,
        ));
        let modify_mgr = Arc::new(ModifyMgr::new(Arc::clone(&notifier), config.dump_stacks));
        info!(
            "Model manager ready for {} (cache capacity {})",
            facade.subject_key(),
            config.cache_capacity
        );
        Ok(Self {
            facade,
            notifier,
            event_bus,
            entity_model,
            modify_mgr,
        })
    }

    pub fn facade(&self) -> &Arc<dyn Facade> {
        &self.facade
    }

    pub fn subject_key(&self) -> &str {
        self.facade.subject_key()
    }

    pub fn entity_model(&self) -> &Arc<EntityModel> {
        &self.entity_model
    }

    pub fn modify_mgr(&self) -> &Arc<ModifyMgr> {
        &self.modify_mgr
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn handle_error(&self, err: &dyn std::error::Error) {
        handle_error(err);
    }

    pub fn register_on_event_bus(&self, listener: Arc<dyn ModelEventListener>) -> SubscriptionId {
        self.event_bus.register(listener)
    }

    pub fn unregister_on_event_bus(&self, id: SubscriptionId) -> bool {
        self.event_bus.unregister(id)
    }

    pub fn post_on_event_bus(&self, event: ModelEvent) {
        self.event_bus.post(event);
    }

    pub async fn do_command(&self, command: Box<dyn Command>) -> Result<(), CommandError> {
        self.modify_mgr.do_command(command).await
    }

    pub async fn undo(&self) -> Result<(), CommandError> {
        self.modify_mgr.undo_command().await
    }

    pub async fn redo(&self) -> Result<(), CommandError> {
        self.modify_mgr.redo_command().await
    }

    /// Run `work` in the background; `on_done` runs on the UI thread unless
    /// the worker is cancelled first
    pub fn spawn_worker<T, W, D>(&self, name: &str, work: W, on_done: D) -> WorkerHandle
    where
        T: Send + 'static,
        W: Future<Output = T> + Send + 'static,
        D: FnOnce(T) + Send + 'static,
    {
        spawn_worker(&self.notifier, name, work, on_done)
    }

    /// Wait until every queued notification has been delivered
    pub async fn flush(&self) {
        self.notifier.flush().await;
    }
}
