//! Configuration module for parsing YAML configuration files.

use nt_analyzer::{signature::SignatureError, Signature, Transport};
use nt_engine::{Registry, RegistryError};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use tracing::info;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("Failed to read config file {}: {}", path, source))]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse config: {}", source))]
    Parse { source: serde_yaml::Error },

    #[snafu(display("Invalid signature for analyzer {}: {}", analyzer, source))]
    InvalidSignature {
        analyzer: String,
        source: SignatureError,
    },

    #[snafu(display("Unknown transport {} for analyzer {}", transport, analyzer))]
    InvalidTransport { analyzer: String, transport: String },

    #[snafu(display("{}", source))]
    Registry { source: RegistryError },
}

impl From<RegistryError> for ConfigError {
    fn from(source: RegistryError) -> Self {
        ConfigError::Registry { source }
    }
}

/// Main configuration struct that holds all configuration options for the application.
#[derive(Deserialize, Debug, Default)]
pub struct CliConfig {
    /// Worker configuration, setting parameters for worker tasks.
    #[serde(default)]
    pub workers: CliConfigWorkers,
    /// Adjustments applied to the registry before it is frozen.
    #[serde(default)]
    pub analyzers: CliConfigAnalyzers,
    /// Logging configuration.
    #[serde(default)]
    pub log: CliConfigLog,
}

/// Worker configuration struct, containing task count, queue and flow table settings.
#[derive(Deserialize, Debug)]
pub struct CliConfigWorkers {
    /// Number of workers. Zero means one per CPU core.
    #[serde(default)]
    pub count: usize,
    /// Size of the queue for each worker.
    #[serde(default)]
    pub queue_size: usize,
    /// Maximum number of flows tracked by each worker.
    #[serde(default)]
    pub max_flows: usize,
}

#[derive(Deserialize, Debug, Default)]
pub struct CliConfigAnalyzers {
    /// Analyzers which stay registered but are never selected.
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Extra well-known ports.
    #[serde(default)]
    pub ports: Vec<CliConfigPorts>,
    /// Extra payload signatures.
    #[serde(default)]
    pub signatures: Vec<CliConfigSignature>,
}

#[derive(Deserialize, Debug)]
pub struct CliConfigPorts {
    pub analyzer: String,
    /// `tcp` or `udp`.
    pub transport: String,
    pub ports: Vec<u16>,
}

#[derive(Deserialize, Debug)]
pub struct CliConfigSignature {
    pub analyzer: String,
    #[serde(default)]
    pub offset: usize,
    /// Hex-encoded.
    pub pattern: String,
    /// Hex-encoded, as long as the pattern.
    #[serde(default)]
    pub mask: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct CliConfigLog {
    /// One of trace, debug, info, warn, error.
    #[serde(default)]
    pub level: String,
}

/// Parses YAML configuration from a string and returns a `CliConfig` struct.
pub fn load_config_from_string(yaml_str: &str) -> Result<CliConfig, ConfigError> {
    serde_yaml::from_str(yaml_str).context(ParseSnafu)
}

/// Parses YAML configuration from a file and returns a `CliConfig` struct.
pub async fn load_config_from_file(file_path: &str) -> Result<CliConfig, ConfigError> {
    let file = File::open(file_path)
        .await
        .context(IoSnafu { path: file_path })?;

    let mut reader = BufReader::new(file);
    let mut contents = String::new();
    reader
        .read_to_string(&mut contents)
        .await
        .context(IoSnafu { path: file_path })?;

    load_config_from_string(&contents)
}

impl CliConfigAnalyzers {
    /// Apply the adjustments to a registry still in its load phase.
    pub fn apply(&self, registry: &mut Registry) -> Result<(), ConfigError> {
        for binding in &self.ports {
            let transport: Transport =
                binding
                    .transport
                    .parse()
                    .map_err(|_| ConfigError::InvalidTransport {
                        analyzer: binding.analyzer.clone(),
                        transport: binding.transport.clone(),
                    })?;
            registry
                .register_ports(&binding.analyzer, transport, &binding.ports)
                .context(RegistrySnafu)?;
        }

        for signature in &self.signatures {
            let parsed = Signature::from_hex(
                signature.offset,
                &signature.pattern,
                signature.mask.as_deref(),
            )
            .context(InvalidSignatureSnafu {
                analyzer: &signature.analyzer,
            })?;
            registry
                .add_signature(&signature.analyzer, parsed)
                .context(RegistrySnafu)?;
        }

        for name in &self.disabled {
            registry.disable(name).context(RegistrySnafu)?;
        }

        info!(
            "Applied {} port bindings, {} signatures and {} disabled analyzers from config",
            self.ports.len(),
            self.signatures.len(),
            self.disabled.len()
        );
        Ok(())
    }
}

impl CliConfigLog {
    /// The configured level, `INFO` when unset or unknown.
    pub fn level(&self) -> tracing::Level {
        self.level.parse().unwrap_or(tracing::Level::INFO)
    }
}

impl Default for CliConfigWorkers {
    fn default() -> Self {
        CliConfigWorkers {
            count: 0,
            queue_size: 64,
            max_flows: 4096,
        }
    }
}

impl Default for CliConfigLog {
    fn default() -> Self {
        CliConfigLog {
            level: "info".to_string(),
        }
    }
}
