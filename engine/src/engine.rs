//! This module defines the `Engine` struct and its associated handle. The `Engine` owns the
//! workers and runs them until shutdown, the `EngineHandle` feeds them packets and analyzer
//! trees.

use std::sync::Arc;

use nt_ruleset::Ruleset;
use snafu::ResultExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    dispatcher::Dispatcher,
    error::{ClosedSnafu, EngineError, SetupSnafu, WorkerSnafu},
    worker::{Worker, WorkerConfig, WorkerPacket, WorkerStats},
    Config,
};

/// The totals of every worker.
pub type EngineStats = WorkerStats;

/// The analysis engine.
pub struct Engine {
    /// The workers.
    workers: Vec<Worker>,
}

/// Feeds packets and analyzer trees to a running engine.
///
/// The workers stop once every handle is dropped and their queues are drained.
#[derive(Clone)]
pub struct EngineHandle {
    /// The senders which send tasks to the workers.
    worker_senders: Vec<mpsc::Sender<WorkerPacket>>,

    ruleset_tx: Arc<watch::Sender<Arc<dyn Ruleset>>>,
}

impl Engine {
    /// Create a new engine using the provided configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - A `Config` struct containing the configuration for the engine.
    ///
    /// # Returns
    ///
    /// The engine along with the handle feeding it, or an error if the registry is still in
    /// its load phase.
    pub fn new(config: Config) -> Result<(Self, EngineHandle), EngineError> {
        let dispatcher = Dispatcher::new(config.registry).context(SetupSnafu)?;

        // Decide the number of workers.
        let worker_count = if config.workers > 0 {
            config.workers
        } else {
            num_cpus::get()
        };

        let (ruleset_tx, ruleset_rx) = watch::channel(config.ruleset);

        // Construct the workers according to the config.
        let mut workers = Vec::with_capacity(worker_count);
        let mut worker_senders = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let (worker, sender) = Worker::new(WorkerConfig {
                id,
                chan_size: config.worker_queue_size,
                max_flows: config.worker_max_flows,
                dispatcher: dispatcher.clone(),
                ruleset: ruleset_rx.clone(),
            });

            workers.push(worker);
            worker_senders.push(sender);
        }
        info!("Engine created with {} workers", worker_count);

        Ok((
            Engine { workers },
            EngineHandle {
                worker_senders,
                ruleset_tx: Arc::new(ruleset_tx),
            },
        ))
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Run the workers until `cancel` fires or every handle is dropped.
    ///
    /// # Returns
    ///
    /// The totals of every worker, or the first worker that failed.
    pub async fn run(self, cancel: CancellationToken) -> Result<EngineStats, EngineError> {
        let tasks: Vec<_> = self
            .workers
            .into_iter()
            .map(|worker| tokio::spawn(worker.run(cancel.clone())))
            .collect();

        let mut stats = EngineStats::default();
        let mut failure = None;
        for (id, task) in tasks.into_iter().enumerate() {
            match task.await.context(WorkerSnafu { id }) {
                Ok(worker_stats) => stats.merge(&worker_stats),
                Err(e) => {
                    error!("{}", e);
                    // Stop the others, but keep joining them so that their flows are torn down.
                    cancel.cancel();
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

impl EngineHandle {
    /// Submit a raw IP packet. Packets of one stream always go to the same worker.
    pub async fn submit(&self, stream_id: u32, data: Vec<u8>) -> Result<(), EngineError> {
        if data.is_empty() {
            return Ok(());
        }

        // Load balance by stream ID.
        let index = stream_id as usize % self.worker_senders.len();
        self.worker_senders[index]
            .send(WorkerPacket { stream_id, data })
            .await
            .map_err(|_| ClosedSnafu.build())
    }

    /// Swap the analyzer tree. Flows created from now on are matched against it.
    pub fn update_ruleset(&self, ruleset: Arc<dyn Ruleset>) {
        self.ruleset_tx.send_replace(ruleset);
        info!("Analyzer tree updated");
    }
}
