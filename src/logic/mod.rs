pub mod command;
pub mod commands;
pub mod entity_model;
pub mod event_bus;
pub mod model_mgr;
pub mod modify_mgr;
pub mod notification;
pub mod worker;

pub use command::*;
pub use commands::*;
pub use entity_model::EntityModel;
pub use event_bus::*;
pub use model_mgr::*;
pub use modify_mgr::*;
pub use notification::*;
pub use worker::*;
