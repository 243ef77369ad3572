pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod filters;
pub mod logic;
pub mod model;
pub mod store;

pub use config::EngineConfig;
pub use error::EngineError;

// Pipelines and the filter contract
pub use logic::{
    DeployOutcome, DeployPipeline, FetchPipeline, FetchResult, Filter, FilterCreator, FilterOptions,
    FiltersRunner,
};

pub use model::*;

pub use store::{CachedElementsSource, ElementsSource, InMemoryElementsSource};
