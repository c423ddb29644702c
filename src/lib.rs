pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

pub use error::{CommandError, ModelError, ModelResult};

// Export logic types
pub use logic::{
    Command, CommandId, CommandKind, CompositeCommand, EntityModel, EventBus, ModelEventListener,
    ModelMgr, ModifyMgr, ModifyNotification, ModifyObserver, Notifier, WorkerHandle,
};

// Export all model types
pub use model::*;

// Export seed module
pub use seed::*;

// Export store types
pub use store::{EntityCache, Facade, InMemoryFacade};

/// Build a model manager over an in-memory facade loaded from the configured seed
pub fn build_model_mgr(config: &crate::config::AppConfig) -> anyhow::Result<ModelMgr> {
    use std::sync::Arc;

    let seed = match &config.facade.seed_path {
        Some(path) => seed::load_seed_data(path)?,
        None => seed::sample_seed(&config.facade.subject),
    };
    let facade = Arc::new(seed.into_facade(&config.facade.subject));
    Ok(ModelMgr::new(facade, &config.model)?)
}
