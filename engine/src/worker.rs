//! A worker owns a share of the flows: it decodes the packets it receives, dispatches new
//! flows to an analyzer and feeds the bound analyzers.

use std::sync::Arc;

use nt_analyzer::FlowInfo;
use nt_ruleset::Ruleset;
use snowflake::SnowflakeIdGenerator;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    dispatcher::Dispatcher,
    flow::{Binding, FlowContext, FlowTable},
    packet::{self, DecodedPacket},
};

pub(crate) const DEFAULT_CHAN_SIZE: usize = 64;

#[derive(Debug)]
pub struct WorkerPacket {
    pub stream_id: u32,

    /// A raw IP packet.
    pub data: Vec<u8>,
}

/// What a worker did during its lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub packets: u64,
    pub ignored: u64,
    pub flows: u64,
    pub analyzed: u64,
    pub unanalyzed: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.packets += other.packets;
        self.ignored += other.ignored;
        self.flows += other.flows;
        self.analyzed += other.analyzed;
        self.unanalyzed += other.unanalyzed;
    }
}

pub struct WorkerConfig {
    pub id: usize,
    pub chan_size: usize,
    pub max_flows: usize,
    pub dispatcher: Dispatcher,
    pub ruleset: watch::Receiver<Arc<dyn Ruleset>>,
}

pub struct Worker {
    id: usize,

    packet_rx: mpsc::Receiver<WorkerPacket>,

    flows: FlowTable,

    dispatcher: Dispatcher,

    ruleset: watch::Receiver<Arc<dyn Ruleset>>,

    node: SnowflakeIdGenerator,

    stats: WorkerStats,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> (Self, mpsc::Sender<WorkerPacket>) {
        let chan_size = if config.chan_size > 0 {
            config.chan_size
        } else {
            DEFAULT_CHAN_SIZE
        };
        let (tx, rx) = mpsc::channel(chan_size);

        (
            Worker {
                id: config.id,
                packet_rx: rx,
                flows: FlowTable::new(config.max_flows),
                dispatcher: config.dispatcher,
                ruleset: config.ruleset,
                node: SnowflakeIdGenerator::new(0, config.id as i32),
                stats: WorkerStats::default(),
            },
            tx,
        )
    }

    /// Process packets until cancelled or every sender is gone, then tear all flows down.
    pub async fn run(mut self, cancel: CancellationToken) -> WorkerStats {
        info!("Worker {} started", self.id);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                packet = self.packet_rx.recv() => match packet {
                    Some(packet) => self.handle_packet(packet.stream_id, &packet.data),
                    None => break,
                },
            }
        }

        self.flows.clear();
        info!("Worker {} stopped: {:?}", self.id, self.stats);
        self.stats
    }

    fn handle_packet(&mut self, stream_id: u32, data: &[u8]) {
        self.stats.packets += 1;
        let Some(packet) = packet::decode(data) else {
            self.stats.ignored += 1;
            return;
        };

        let ruleset = self.ruleset.borrow().clone();
        let node = &mut self.node;
        let created = &mut self.stats.flows;
        let (ctx, rev) = self.flows.get_or_create(stream_id, &packet, || {
            *created += 1;
            new_flow(node.generate(), &packet, ruleset.as_ref())
        });

        if *ctx.binding() == Binding::Pending {
            match self.dispatcher.dispatch(ctx, &packet.payload) {
                Binding::Bound(_) => self.stats.analyzed += 1,
                Binding::Unanalyzed => self.stats.unanalyzed += 1,
                Binding::Pending => {}
            }
        }

        if ctx.feed(rev, &packet.payload) {
            debug!("Properties of flow {} updated", ctx.info());
        }
    }
}

/// Build the context of a new flow, asking the analyzer tree for an explicit request.
fn new_flow(uid: i64, packet: &DecodedPacket, ruleset: &dyn Ruleset) -> FlowContext {
    let info = FlowInfo {
        uid,
        transport: packet.transport,
        src_ip: packet.src_ip,
        dst_ip: packet.dst_ip,
        src_port: packet.src_port,
        dst_port: packet.dst_port,
    };

    let requested = ruleset.analyzer_for(&info).map(|result| {
        debug!(
            "Rule {} requests analyzer {} for flow {}",
            result.rule, result.analyzer, info
        );
        result.analyzer
    });

    FlowContext::new(info, requested)
}
