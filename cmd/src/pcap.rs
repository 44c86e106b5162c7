//! Packet captures replayed through the engine.
//!
//! The capture is read with libpcap. Link-layer headers are stripped and every IP packet
//! gets the stream id derived from its endpoints, so that both directions of a flow share
//! it. Everything else in the capture (ARP, non-TCP/UDP traffic) is skipped.
//!
//! For info about pcap file format, refer to:
//! <https://www.ietf.org/archive/id/draft-gharris-opsawg-pcap-01.html>

use nt_engine::packet;
use pcap::{Capture, Linktype};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::debug;

use crate::trace::TracePacket;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CaptureError {
    #[snafu(display("Failed to open capture {}: {}", path, source))]
    Open { path: String, source: pcap::Error },

    #[snafu(display("Failed to read capture {}: {}", path, source))]
    Read { path: String, source: pcap::Error },

    #[snafu(display("Capture {} has unsupported link type {}", path, linktype))]
    Linktype { path: String, linktype: i32 },
}

/// Length of the link-layer header in front of the IP packet.
fn link_header_len(linktype: Linktype) -> Option<usize> {
    match linktype.0 {
        // Ethernet
        1 => Some(14),
        // Linux cooked capture
        113 => Some(16),
        // Raw IP, raw IPv4, raw IPv6
        101 | 228 | 229 => Some(0),
        _ => None,
    }
}

/// Read a capture file, handing each IP packet to `handle`.
///
/// # Returns
///
/// The number of packets handed over.
pub async fn read_capture_file<F, Fut>(path: &str, mut handle: F) -> Result<usize, CaptureError>
where
    F: FnMut(TracePacket) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let mut capture = Capture::from_file(path).context(OpenSnafu { path })?;
    let linktype = capture.get_datalink();
    let header_len = link_header_len(linktype).context(LinktypeSnafu {
        path,
        linktype: linktype.0,
    })?;

    let mut count = 0;
    loop {
        let frame = match capture.next_packet() {
            Ok(frame) => frame,
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => return Err(e).context(ReadSnafu { path }),
        };

        let Some(data) = frame.data.get(header_len..) else {
            continue;
        };
        let Some(stream_id) = packet::stream_id(data) else {
            debug!("Skipping {} byte frame without TCP/UDP", frame.data.len());
            continue;
        };

        count += 1;
        let packet = TracePacket {
            stream_id,
            data: data.to_vec(),
        };
        if !handle(packet).await {
            break;
        }
    }
    Ok(count)
}
