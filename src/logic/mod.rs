pub mod alias;
pub mod builder;
pub mod deploy;
pub mod fetch;
pub mod filter;
pub mod fix_elements;
pub mod graph;
pub mod naming;
pub mod references;
pub mod transform;

pub use alias::*;
pub use builder::*;
pub use deploy::*;
pub use fetch::*;
pub use filter::*;
pub use fix_elements::*;
pub use graph::*;
pub use naming::*;
pub use references::*;
pub use transform::*;
