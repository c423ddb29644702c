pub mod common;
pub mod entity;
pub mod events;
pub mod fields;
pub mod rooted;

pub use common::*;
pub use entity::*;
pub use events::*;
pub use fields::*;
pub use rooted::*;
