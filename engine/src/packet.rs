//! Decoding of raw IP packets into the flow identity and transport payload the
//! dispatcher works with.

use std::net::IpAddr;

use nt_analyzer::Transport;
use pnet::packet::{
    ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    tcp::TcpPacket,
    udp::UdpPacket,
    Packet,
};

/// A packet reduced to what the engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub transport: Transport,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

impl DecodedPacket {
    /// A stream id shared by both directions of the packet's flow.
    ///
    /// Hashes the transport and the two endpoints in sorted order, so that replies map to
    /// the same id as the requests.
    pub fn stream_id(&self) -> u32 {
        let mut endpoints = [
            format!("{}:{}", self.src_ip, self.src_port),
            format!("{}:{}", self.dst_ip, self.dst_port),
        ];
        endpoints.sort();
        crc32fast::hash(format!("{},{}", self.transport, endpoints.join(",")).as_bytes())
    }
}

/// The stream id of a raw IP packet, see [`DecodedPacket::stream_id`].
pub fn stream_id(data: &[u8]) -> Option<u32> {
    decode(data).map(|packet| packet.stream_id())
}

/// Decode a raw IP packet.
///
/// # Returns
///
/// `None` for anything that is not TCP or UDP over IPv4/IPv6, or is truncated.
pub fn decode(data: &[u8]) -> Option<DecodedPacket> {
    let version = (data.first()? >> 4) & 0xF;
    match version {
        4 => {
            let ipv4 = Ipv4Packet::new(data)?;
            decode_transport(
                ipv4.get_next_level_protocol(),
                IpAddr::V4(ipv4.get_source()),
                IpAddr::V4(ipv4.get_destination()),
                ipv4.payload(),
            )
        }
        6 => {
            let ipv6 = Ipv6Packet::new(data)?;
            decode_transport(
                ipv6.get_next_header(),
                IpAddr::V6(ipv6.get_source()),
                IpAddr::V6(ipv6.get_destination()),
                ipv6.payload(),
            )
        }
        _ => None,
    }
}

fn decode_transport(
    protocol: IpNextHeaderProtocol,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    payload: &[u8],
) -> Option<DecodedPacket> {
    match protocol {
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(payload)?;
            Some(DecodedPacket {
                transport: Transport::UDP,
                src_ip,
                dst_ip,
                src_port: udp.get_source(),
                dst_port: udp.get_destination(),
                payload: udp.payload().to_vec(),
            })
        }
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(payload)?;
            Some(DecodedPacket {
                transport: Transport::TCP,
                src_ip,
                dst_ip,
                src_port: tcp.get_source(),
                dst_port: tcp.get_destination(),
                payload: tcp.payload().to_vec(),
            })
        }
        _ => None,
    }
}
