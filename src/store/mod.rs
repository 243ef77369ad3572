pub mod element_cache;
pub mod memory;
pub mod traits;

pub use element_cache::*;
pub use memory::*;
pub use traits::*;
