//! Packet traces replayed through the engine.
//!
//! One raw IP packet per line, hex-encoded, optionally prefixed by its stream id:
//!
//! ```text
//! # dns query
//! 7 45000021000100004011...
//! ```
//!
//! Packets without a stream id get the one derived from their endpoints, so that both
//! directions of a flow share it.

use nt_engine::packet;
use snafu::{ResultExt, Snafu};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TraceError {
    #[snafu(display("Failed to read trace file {}: {}", path, source))]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Line {}: invalid stream id {}", line, value))]
    StreamId { line: usize, value: String },

    #[snafu(display("Line {}: invalid packet: {}", line, source))]
    Packet {
        line: usize,
        source: hex::FromHexError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracePacket {
    pub stream_id: u32,
    pub data: Vec<u8>,
}

/// Parse a single trace line.
///
/// # Returns
///
/// `None` for blank lines and comments.
pub fn parse_line(number: usize, line: &str) -> Result<Option<TracePacket>, TraceError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (stream_id, encoded) = match line.split_once(char::is_whitespace) {
        Some((id, encoded)) => {
            let stream_id = id.parse().map_err(|_| TraceError::StreamId {
                line: number,
                value: id.to_string(),
            })?;
            (Some(stream_id), encoded.trim())
        }
        None => (None, line),
    };

    let data = hex::decode(encoded).context(PacketSnafu { line: number })?;
    // The engine ignores what it cannot decode, whatever its stream id.
    let stream_id = stream_id.unwrap_or_else(|| packet::stream_id(&data).unwrap_or(0));
    Ok(Some(TracePacket { stream_id, data }))
}

pub fn parse_trace(contents: &str) -> Result<Vec<TracePacket>, TraceError> {
    let mut packets = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if let Some(packet) = parse_line(index + 1, line)? {
            packets.push(packet);
        }
    }
    Ok(packets)
}

/// Read a trace file line by line, handing each packet to `handle`.
///
/// # Returns
///
/// The number of packets read.
pub async fn read_trace_file<F, Fut>(path: &str, mut handle: F) -> Result<usize, TraceError>
where
    F: FnMut(TracePacket) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let file = File::open(path).await.context(IoSnafu { path })?;
    let mut lines = BufReader::new(file).lines();

    let mut number = 0;
    let mut count = 0;
    while let Some(line) = lines.next_line().await.context(IoSnafu { path })? {
        number += 1;
        if let Some(packet) = parse_line(number, &line)? {
            count += 1;
            if !handle(packet).await {
                break;
            }
        }
    }
    Ok(count)
}
