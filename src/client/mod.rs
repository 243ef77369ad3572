pub mod deploy_client;
pub mod paginator;

pub use deploy_client::*;
pub use paginator::*;
