pub mod dependency_changers;
pub mod filtering;
pub mod pipeline;
pub mod validators;

pub use dependency_changers::*;
pub use filtering::*;
pub use pipeline::*;
pub use validators::*;
