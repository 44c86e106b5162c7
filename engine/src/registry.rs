//! The analyzer registry.
//!
//! The registry lives in two phases. During the load phase it is owned mutably by the
//! host, which activates every plugin once and merges the returned components into it.
//! [`Registry::freeze`] ends the load phase: the registry is moved behind an `Arc` and read
//! concurrently by the workers without any locking.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use nt_analyzer::{
    AnalyzerTag, ComponentDescriptor, Plugin, PluginConfiguration, PluginVersion, Signature,
    Transport,
};
use snafu::ensure;
use tracing::{debug, info};

use crate::error::{
    DuplicateNameSnafu, DuplicatePluginSnafu, EmptyNameSnafu, LateRegistrationSnafu,
    PortConflictSnafu, RegistryError, UnknownAnalyzerSnafu,
};

/// A key the registry can be queried by.
#[derive(Debug, Clone, Copy)]
pub enum LookupKey<'a> {
    /// Exact, case-sensitive analyzer name.
    Name(&'a str),
    /// Well-known port.
    Port(Transport, u16),
    /// Payload prefix, matched against the signatures in registration order.
    Payload(&'a [u8]),
}

/// What the registry remembers about a loaded plugin.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub description: String,
    pub version: PluginVersion,
    pub components: Vec<AnalyzerTag>,
}

#[derive(Debug)]
struct Entry {
    descriptor: ComponentDescriptor,
    plugin: String,
    enabled: bool,
}

#[derive(Debug, Default)]
pub struct Registry {
    /// Registration order.
    entries: Vec<Entry>,
    by_name: HashMap<AnalyzerTag, usize>,
    by_port: HashMap<(Transport, u16), usize>,
    /// Registration order, the first match wins.
    signatures: Vec<(Signature, usize)>,
    /// Longest prefix any enabled signature needs, computed at freeze.
    max_signature_len: usize,
    plugins: Vec<PluginInfo>,
    frozen: bool,
}

impl Registry {
    /// Create an empty registry in the load phase.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single descriptor on behalf of `plugin`.
    ///
    /// The descriptor's ports and signatures are registered with it. Nothing is changed if
    /// any of them conflicts.
    pub fn register(
        &mut self,
        plugin: &str,
        descriptor: ComponentDescriptor,
    ) -> Result<(), RegistryError> {
        self.register_components(plugin, vec![descriptor])
    }

    /// Register everything a plugin contributes, all or nothing.
    pub fn register_plugin(&mut self, config: PluginConfiguration) -> Result<(), RegistryError> {
        let first = config.components.first().map(|c| c.name().to_string());
        ensure!(
            !self.frozen,
            LateRegistrationSnafu {
                name: first.unwrap_or_else(|| config.name.clone())
            }
        );
        ensure!(
            self.plugins.iter().all(|p| p.name != config.name),
            DuplicatePluginSnafu {
                plugin: &config.name
            }
        );

        let components = config.components.iter().map(|c| c.tag().clone()).collect();
        self.register_components(&config.name, config.components)?;

        info!(
            "Loaded plugin {} ({}) version {}",
            config.name, config.description, config.version
        );
        self.plugins.push(PluginInfo {
            name: config.name,
            description: config.description,
            version: config.version,
            components,
        });
        Ok(())
    }

    fn register_components(
        &mut self,
        plugin: &str,
        components: Vec<ComponentDescriptor>,
    ) -> Result<(), RegistryError> {
        // Validate everything before touching the maps.
        let mut names: HashSet<&AnalyzerTag> = HashSet::new();
        let mut ports: HashMap<(Transport, u16), &str> = HashMap::new();
        for descriptor in &components {
            ensure!(
                !self.frozen,
                LateRegistrationSnafu {
                    name: descriptor.name()
                }
            );
            ensure!(!descriptor.name().is_empty(), EmptyNameSnafu { plugin });

            if let Some(&index) = self.by_name.get(descriptor.tag()) {
                return DuplicateNameSnafu {
                    name: descriptor.name(),
                    plugin,
                    existing_plugin: &self.entries[index].plugin,
                }
                .fail();
            }
            ensure!(
                names.insert(descriptor.tag()),
                DuplicateNameSnafu {
                    name: descriptor.name(),
                    plugin,
                    existing_plugin: plugin,
                }
            );

            for &(transport, port) in descriptor.ports() {
                self.check_port(transport, port, descriptor.name(), plugin)?;
                if let Some(existing) = ports.insert((transport, port), descriptor.name()) {
                    ensure!(
                        existing == descriptor.name(),
                        PortConflictSnafu {
                            transport,
                            port,
                            analyzer: descriptor.name(),
                            plugin,
                            existing,
                            existing_plugin: plugin,
                        }
                    );
                }
            }
        }

        for descriptor in components {
            let index = self.entries.len();
            for &(transport, port) in descriptor.ports() {
                self.by_port.insert((transport, port), index);
            }
            for signature in descriptor.signatures() {
                self.signatures.push((signature.clone(), index));
            }
            self.by_name.insert(descriptor.tag().clone(), index);

            debug!(
                "Registered analyzer {} from plugin {}",
                descriptor.name(),
                plugin
            );
            self.entries.push(Entry {
                descriptor,
                plugin: plugin.to_string(),
                enabled: true,
            });
        }

        Ok(())
    }

    fn check_port(
        &self,
        transport: Transport,
        port: u16,
        analyzer: &str,
        plugin: &str,
    ) -> Result<(), RegistryError> {
        match self.by_port.get(&(transport, port)) {
            Some(&index) if self.entries[index].descriptor.name() != analyzer => {
                let existing = &self.entries[index];
                PortConflictSnafu {
                    transport,
                    port,
                    analyzer,
                    plugin,
                    existing: existing.descriptor.name(),
                    existing_plugin: &existing.plugin,
                }
                .fail()
            }
            _ => Ok(()),
        }
    }

    fn index_for_load(&self, name: &str) -> Result<usize, RegistryError> {
        ensure!(!self.frozen, LateRegistrationSnafu { name });
        self.by_name
            .get(&AnalyzerTag::new(name))
            .copied()
            .ok_or_else(|| UnknownAnalyzerSnafu { name }.build())
    }

    /// Bind additional well-known ports to a registered analyzer.
    ///
    /// All ports are checked before any is bound. Re-binding a port the analyzer already
    /// owns is accepted.
    pub fn register_ports(
        &mut self,
        name: &str,
        transport: Transport,
        ports: &[u16],
    ) -> Result<(), RegistryError> {
        let index = self.index_for_load(name)?;
        let plugin = self.entries[index].plugin.clone();
        for &port in ports {
            self.check_port(transport, port, name, &plugin)?;
        }

        for &port in ports {
            self.by_port.insert((transport, port), index);
        }
        debug!("Bound {} to {} ports {:?}", name, transport, ports);
        Ok(())
    }

    /// Add a signature to a registered analyzer.
    pub fn add_signature(&mut self, name: &str, signature: Signature) -> Result<(), RegistryError> {
        let index = self.index_for_load(name)?;
        self.signatures.push((signature, index));
        Ok(())
    }

    /// Disable an analyzer. It stays registered but dispatch never selects it.
    pub fn disable(&mut self, name: &str) -> Result<(), RegistryError> {
        let index = self.index_for_load(name)?;
        self.entries[index].enabled = false;
        info!("Disabled analyzer {}", name);
        Ok(())
    }

    /// End the load phase.
    pub fn freeze(mut self) -> Arc<Registry> {
        self.max_signature_len = self
            .signatures
            .iter()
            .filter(|(_, index)| self.entries[*index].enabled)
            .map(|(signature, _)| signature.required_len())
            .max()
            .unwrap_or(0);
        self.frozen = true;
        info!(
            "Registry frozen with {} plugins and {} analyzers",
            self.plugins.len(),
            self.entries.len()
        );
        Arc::new(self)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// How many payload bytes signature matching may need before it can give up on a flow.
    pub fn max_signature_len(&self) -> usize {
        self.max_signature_len
    }

    /// Find a descriptor by name, port or payload.
    pub fn lookup(&self, key: LookupKey) -> Option<&ComponentDescriptor> {
        let index = match key {
            LookupKey::Name(name) => self.by_name.get(&AnalyzerTag::new(name)).copied(),
            LookupKey::Port(transport, port) => self.by_port.get(&(transport, port)).copied(),
            LookupKey::Payload(payload) => self
                .signatures
                .iter()
                .find(|(signature, _)| signature.matches(payload))
                .map(|&(_, index)| index),
        }?;
        Some(&self.entries[index].descriptor)
    }

    /// Signature candidates for a payload in registration order, enabled analyzers only.
    pub(crate) fn signature_matches<'a>(
        &'a self,
        payload: &'a [u8],
    ) -> impl Iterator<Item = &'a AnalyzerTag> + 'a {
        self.signatures
            .iter()
            .filter(move |(signature, index)| {
                self.entries[*index].enabled && signature.matches(payload)
            })
            .map(move |(_, index)| self.entries[*index].descriptor.tag())
    }

    /// The tag of a registered analyzer.
    pub fn tag(&self, name: &str) -> Option<AnalyzerTag> {
        self.lookup(LookupKey::Name(name)).map(|d| d.tag().clone())
    }

    /// The descriptor registered under a tag.
    pub fn descriptor(&self, tag: &AnalyzerTag) -> Option<&ComponentDescriptor> {
        self.by_name
            .get(tag)
            .map(|&index| &self.entries[index].descriptor)
    }

    /// Whether the analyzer is registered and enabled.
    pub fn is_enabled(&self, tag: &AnalyzerTag) -> bool {
        self.by_name
            .get(tag)
            .is_some_and(|&index| self.entries[index].enabled)
    }

    /// The plugin which contributed an analyzer.
    pub fn plugin_of(&self, tag: &AnalyzerTag) -> Option<&str> {
        self.by_name
            .get(tag)
            .map(|&index| self.entries[index].plugin.as_str())
    }

    /// The ports bound to an analyzer, sorted.
    pub fn ports(&self, tag: &AnalyzerTag) -> Vec<(Transport, u16)> {
        let Some(&index) = self.by_name.get(tag) else {
            return Vec::new();
        };
        let mut ports: Vec<_> = self
            .by_port
            .iter()
            .filter(|&(_, &i)| i == index)
            .map(|(&key, _)| key)
            .collect();
        ports.sort();
        ports
    }

    /// The descriptors in registration order.
    pub fn components(&self) -> impl Iterator<Item = &ComponentDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    /// The loaded plugins in load order.
    pub fn plugins(&self) -> &[PluginInfo] {
        &self.plugins
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Run the load phase: activate every plugin once, in order, and freeze the registry.
pub fn initialize(plugins: &[Box<dyn Plugin>]) -> Result<Arc<Registry>, RegistryError> {
    initialize_with(plugins, |_| Ok(()))
}

/// Like [`initialize`], but let the host adjust the registry (extra ports, signatures,
/// disabled analyzers) before it is frozen.
pub fn initialize_with<F, E>(plugins: &[Box<dyn Plugin>], configure: F) -> Result<Arc<Registry>, E>
where
    F: FnOnce(&mut Registry) -> Result<(), E>,
    E: From<RegistryError>,
{
    let mut registry = Registry::new();
    for plugin in plugins {
        registry.register_plugin(plugin.configure())?;
    }
    configure(&mut registry)?;
    Ok(registry.freeze())
}
