//! The engine: the analyzer registry, dispatch of flows to analyzers and the workers
//! which drive them.
//!
//! The host runs in two phases. [`initialize`] activates every plugin once and freezes the
//! resulting [`Registry`]. The frozen registry is then shared by the workers of an
//! [`engine::Engine`], each of which dispatches the flows it owns through a [`Dispatcher`].

pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod flow;
pub mod packet;
pub mod registry;
pub mod worker;

use std::sync::Arc;

use nt_ruleset::Ruleset;

pub use dispatcher::Dispatcher;
pub use engine::{Engine, EngineHandle, EngineStats};
pub use error::{DispatchError, EngineError, RegistryError};
pub use flow::{Binding, FlowContext, FlowTable};
pub use registry::{initialize, initialize_with, LookupKey, PluginInfo, Registry};

/// Config is the configuration for the engine.
pub struct Config {
    /// The frozen registry shared by every worker.
    pub registry: Arc<Registry>,

    /// The initial analyzer tree.
    pub ruleset: Arc<dyn Ruleset>,

    /// Number of workers. Zero means auto (number of CPU cores).
    pub workers: usize,

    pub worker_queue_size: usize,

    /// Flows tracked per worker before the least recently used one is torn down.
    pub worker_max_flows: usize,
}

impl Config {
    /// A configuration with the default worker settings.
    pub fn new(registry: Arc<Registry>, ruleset: Arc<dyn Ruleset>) -> Self {
        Self {
            registry,
            ruleset,
            workers: 0,
            worker_queue_size: 0,
            worker_max_flows: 0,
        }
    }
}
