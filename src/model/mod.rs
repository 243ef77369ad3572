pub mod change;
pub mod elem_id;
pub mod element;
pub mod query;
pub mod shared_context;
pub mod value;

pub use change::*;
pub use elem_id::*;
pub use element::*;
pub use query::*;
pub use shared_context::*;
pub use value::*;
