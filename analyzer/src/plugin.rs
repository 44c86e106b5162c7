//! Plugins: units of deployment which describe the analyzers they contribute.
//!
//! A plugin never touches the registry. The host calls [`Plugin::configure`] exactly once
//! during the load phase and incorporates the returned configuration itself.

use std::fmt;

use crate::ComponentDescriptor;

/// The version of a plugin, shown in listings only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PluginVersion {
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The configuration record a plugin returns describing itself.
#[derive(Debug, Clone)]
pub struct PluginConfiguration {
    /// The plugin name, e.g. `Zeek::UDP`.
    pub name: String,
    /// Free text for diagnostics, never parsed.
    pub description: String,
    /// The plugin version.
    pub version: PluginVersion,
    /// The components contributed by the plugin, in registration order.
    pub components: Vec<ComponentDescriptor>,
}

impl PluginConfiguration {
    /// Create an empty configuration.
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            version: PluginVersion::default(),
            components: Vec::new(),
        }
    }

    /// Set the version.
    pub fn version(mut self, major: u16, minor: u16) -> Self {
        self.version = PluginVersion { major, minor };
        self
    }

    /// Add a component.
    pub fn component(mut self, descriptor: ComponentDescriptor) -> Self {
        self.components.push(descriptor);
        self
    }
}

/// The `Plugin` trait is implemented by every loadable analyzer module.
pub trait Plugin {
    /// Describe the plugin and the components it contributes.
    ///
    /// Called exactly once by the host during the load phase.
    fn configure(&self) -> PluginConfiguration;
}
