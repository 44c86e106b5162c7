use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// `cidr(ip, network)`: true if the address lies inside the network.
/// Unparsable input never matches.
pub fn is_ip_in_cidr(ip: &str, cidr: &str) -> bool {
    match (ip.parse::<IpAddr>(), cidr.parse::<IpNetwork>()) {
        (Ok(ip), Ok(network)) => network.contains(ip),
        _ => false,
    }
}
