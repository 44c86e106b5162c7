//! Errors raised by the engine.
//!
//! Everything in `RegistryError` happens during the load phase and is fatal: the host must
//! refuse to start. `DispatchError` is local to a single flow.

use nt_analyzer::{AnalyzerTag, InstantiateError, Transport};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistryError {
    #[snafu(display(
        "analyzer {} of plugin {} conflicts with the analyzer already registered by plugin {}",
        name,
        plugin,
        existing_plugin
    ))]
    DuplicateName {
        name: String,
        plugin: String,
        existing_plugin: String,
    },

    #[snafu(display("plugin {} contributes an analyzer without a name", plugin))]
    EmptyName { plugin: String },

    #[snafu(display("plugin {} is already loaded", plugin))]
    DuplicatePlugin { plugin: String },

    #[snafu(display(
        "port {}/{} claimed by analyzer {} ({}) is already bound to analyzer {} ({})",
        port,
        transport,
        analyzer,
        plugin,
        existing,
        existing_plugin
    ))]
    PortConflict {
        transport: Transport,
        port: u16,
        analyzer: String,
        plugin: String,
        existing: String,
        existing_plugin: String,
    },

    #[snafu(display("cannot register analyzer {} after the registry has been frozen", name))]
    LateRegistration { name: String },

    #[snafu(display("analyzer {} is not registered", name))]
    UnknownAnalyzer { name: String },

    #[snafu(display("the registry must be frozen before dispatching"))]
    NotFrozen,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DispatchError {
    #[snafu(display("no analyzer is registered as {}", tag))]
    UnknownTag { tag: AnalyzerTag },

    #[snafu(display("factory of analyzer {} failed: {}", tag, source))]
    FactoryFailure {
        tag: AnalyzerTag,
        source: InstantiateError,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EngineError {
    #[snafu(display("Failed to setup the engine: {}", source))]
    Setup { source: RegistryError },

    #[snafu(display("The engine has been shut down"))]
    Closed,

    #[snafu(display("Worker {} failed: {}", id, source))]
    Worker {
        id: usize,
        source: tokio::task::JoinError,
    },
}
