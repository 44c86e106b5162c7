use std::{error::Error, process::ExitCode, sync::Arc};

use clap::Parser;
use cmd::{
    config::{load_config_from_file, CliConfig},
    pcap::read_capture_file,
    trace::{read_trace_file, TracePacket},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nt_analyzer::{udp::UDPPlugin, Plugin};
use nt_engine::{initialize_with, Engine, EngineHandle, Registry};
use nt_ruleset::{
    expr_rule::{compile_expr_rules, read_expr_rules_from_file},
    EmptyRuleset, Ruleset,
};

#[derive(Parser, Debug)]
struct Cli {
    /// The YAML config file.
    #[clap(short)]
    config_file: String,
    /// The analyzer tree, reloaded on SIGHUP.
    #[clap(short)]
    ruleset_file: Option<String>,
    /// A hex packet trace to replay.
    #[clap(short)]
    trace_file: Option<String>,
    /// A pcap capture to replay.
    #[clap(short)]
    pcap_file: Option<String>,
    /// Print the loaded plugins and analyzers, then exit.
    #[clap(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI
    let cli = Cli::parse();

    // Load config file
    let config = load_config_from_file(&cli.config_file).await;

    // Setup logger
    let level = config
        .as_ref()
        .map(|config| config.log.level())
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .init();

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("{:?}", config);

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: CliConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
    // Setup plugins
    let plugins: Vec<Box<dyn Plugin>> = vec![Box::new(UDPPlugin::new())];

    // Load phase: every plugin contributes its analyzers, then the config adjusts them.
    let registry = initialize_with(&plugins, |registry| config.analyzers.apply(registry))?;

    if cli.list {
        print_registry(&registry);
        return Ok(());
    }

    // Setup analyzer tree
    let ruleset: Arc<dyn Ruleset> = match &cli.ruleset_file {
        Some(path) => load_ruleset(path, &registry).await?,
        None => Arc::new(EmptyRuleset),
    };

    // Setup engine
    let engine_config = nt_engine::Config {
        workers: config.workers.count,
        worker_queue_size: config.workers.queue_size,
        worker_max_flows: config.workers.max_flows,
        ..nt_engine::Config::new(registry.clone(), ruleset)
    };
    let (engine, handle) = Engine::new(engine_config)?;

    let cancel = CancellationToken::new();

    // Handle Ctrl+C for graceful shutdown
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Shutting down gracefully...");
        shutdown.cancel();
    });

    // Handle SIGHUP for analyzer tree reload
    let reload = cli
        .ruleset_file
        .clone()
        .map(|path| tokio::spawn(reload_on_hangup(path, registry.clone(), handle.clone())));

    info!("Engine started");
    let engine_task = tokio::spawn(engine.run(cancel.clone()));

    if cli.trace_file.is_none() && cli.pcap_file.is_none() {
        cancel.cancelled().await;
    }

    let handle_ref = &handle;
    if let Some(path) = &cli.trace_file {
        info!("Replaying trace {}", path);
        let count = read_trace_file(path, move |packet| replay(handle_ref, packet)).await?;
        info!("Replayed {} packets", count);
    }
    if let Some(path) = &cli.pcap_file {
        info!("Replaying from pcap file {}", path);
        let count = read_capture_file(path, move |packet| replay(handle_ref, packet)).await?;
        info!("Replayed {} packets", count);
    }

    // The workers stop once every handle is gone and their queues are drained.
    drop(handle);
    if let Some(reload) = reload {
        reload.abort();
    }

    let stats = engine_task.await??;
    info!(
        "Engine stopped: {} packets ({} ignored), {} flows, {} analyzed, {} unanalyzed",
        stats.packets, stats.ignored, stats.flows, stats.analyzed, stats.unanalyzed
    );
    Ok(())
}

/// Submit a replayed packet, false once the engine is gone.
async fn replay(handle: &EngineHandle, packet: TracePacket) -> bool {
    match handle.submit(packet.stream_id, packet.data).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Stopped replaying: {}", e);
            false
        }
    }
}

/// Read and compile the analyzer tree, warning about analyzers nothing provides.
async fn load_ruleset(
    path: &str,
    registry: &Registry,
) -> Result<Arc<dyn Ruleset>, Box<dyn Error + Send + Sync>> {
    let raw_rs = read_expr_rules_from_file(path).await?;
    let rs = compile_expr_rules(raw_rs)?;
    for name in rs.analyzers() {
        if registry.tag(name).is_none() {
            warn!("Analyzer {} used by the analyzer tree is not registered", name);
        }
    }
    info!("Loaded {} rules from {}", rs.len(), path);
    Ok(Arc::new(rs))
}

#[cfg(unix)]
async fn reload_on_hangup(path: String, registry: Arc<Registry>, handle: EngineHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!("Failed to listen for SIGHUP: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!("Reloading analyzer tree...");
        match load_ruleset(&path, &registry).await {
            Ok(ruleset) => {
                handle.update_ruleset(ruleset);
                info!("Analyzer tree reloaded successfully");
            }
            Err(e) => error!("Failed to reload analyzer tree: {}", e),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_path: String, _registry: Arc<Registry>, _handle: EngineHandle) {}

fn print_registry(registry: &Registry) {
    for plugin in registry.plugins() {
        println!(
            "{} {} - {}",
            plugin.name, plugin.version, plugin.description
        );
        for tag in &plugin.components {
            let ports: Vec<String> = registry
                .ports(tag)
                .iter()
                .map(|(transport, port)| format!("{}/{}", port, transport))
                .collect();
            println!(
                "    {} [{}] ports: {}{}",
                tag.name(),
                tag.canonical(),
                if ports.is_empty() {
                    "-".to_string()
                } else {
                    ports.join(", ")
                },
                if registry.is_enabled(tag) {
                    ""
                } else {
                    " (disabled)"
                }
            );
        }
    }
}
