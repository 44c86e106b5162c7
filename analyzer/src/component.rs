//! Component descriptors: the registrable unit pairing an analyzer's identity with its
//! construction logic.

use std::{fmt, sync::Arc};

use snafu::Snafu;

use crate::{Analyzer, Signature, Transport};

/// The construction function of an analyzer.
///
/// It takes no arguments. The instance is bound to its flow afterwards through
/// [`Analyzer::on_init`].
pub type Factory = Arc<dyn Fn() -> Result<Box<dyn Analyzer>, InstantiateError> + Send + Sync>;

/// A factory could not construct an analyzer instance.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum InstantiateError {
    #[snafu(display("failed to construct analyzer {}: {}", analyzer, message))]
    Construct { analyzer: String, message: String },
}

/// Process-unique identifier of an analyzer kind.
///
/// The tag is derived from the registered name and compares on the exact name, so it
/// can be used as a key without handing out the factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnalyzerTag(Arc<str>);

impl AnalyzerTag {
    /// Create the tag for an analyzer name.
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    /// The registered name.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// The canonical form used in listings, e.g. `ANALYZER_UDP`.
    pub fn canonical(&self) -> String {
        let name: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("ANALYZER_{}", name)
    }
}

impl fmt::Display for AnalyzerTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable record pairing an analyzer name with its factory, plus the optional
/// secondary keys (well-known ports and payload signatures) it should be found by.
#[derive(Clone)]
pub struct ComponentDescriptor {
    tag: AnalyzerTag,
    factory: Factory,
    ports: Vec<(Transport, u16)>,
    signatures: Vec<Signature>,
}

impl ComponentDescriptor {
    /// Create a descriptor.
    ///
    /// # Arguments
    ///
    /// * `name` - The analyzer name. The registry refuses empty names.
    /// * `factory` - A function which builds a ready-to-use instance on every call.
    pub fn new<F>(name: &str, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Analyzer>, InstantiateError> + Send + Sync + 'static,
    {
        Self {
            tag: AnalyzerTag::new(name),
            factory: Arc::new(factory),
            ports: Vec::new(),
            signatures: Vec::new(),
        }
    }

    /// Create a descriptor whose factory builds `A::default()`.
    pub fn of<A>(name: &str) -> Self
    where
        A: Analyzer + Default + 'static,
    {
        Self::new(name, || Ok(Box::new(A::default()) as Box<dyn Analyzer>))
    }

    /// Claim a well-known port.
    pub fn with_port(mut self, transport: Transport, port: u16) -> Self {
        self.ports.push((transport, port));
        self
    }

    /// Add a payload signature for dynamic protocol detection.
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signatures.push(signature);
        self
    }

    /// The analyzer name.
    pub fn name(&self) -> &str {
        self.tag.name()
    }

    /// The analyzer tag.
    pub fn tag(&self) -> &AnalyzerTag {
        &self.tag
    }

    /// The claimed well-known ports.
    pub fn ports(&self) -> &[(Transport, u16)] {
        &self.ports
    }

    /// The payload signatures.
    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Build a new, independent analyzer instance.
    pub fn instantiate(&self) -> Result<Box<dyn Analyzer>, InstantiateError> {
        (self.factory)()
    }
}

impl fmt::Debug for ComponentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDescriptor")
            .field("name", &self.name())
            .field("ports", &self.ports)
            .field("signatures", &self.signatures.len())
            .finish()
    }
}
