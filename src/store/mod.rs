pub mod entity_cache;
pub mod memory;
pub mod traits;

pub use entity_cache::*;
pub use memory::*;
pub use traits::*;
