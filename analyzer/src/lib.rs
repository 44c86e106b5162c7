//! The analyzer crate which defines what an analyzer is and how plugins describe them.
//!
//! Analyzers are never constructed directly by the engine. A [`plugin::Plugin`] describes
//! the analyzers it offers as [`component::ComponentDescriptor`]s, and the engine builds
//! instances through the descriptor's factory once a flow has been matched.
#![warn(missing_docs)]

pub mod component;
pub mod plugin;
pub mod signature;
pub mod udp;

use std::{collections::HashMap, fmt, fmt::Debug, net::IpAddr, sync::Arc};

pub use component::{AnalyzerTag, ComponentDescriptor, Factory, InstantiateError};
pub use plugin::{Plugin, PluginConfiguration, PluginVersion};
pub use signature::Signature;

/// The `Analyzer` trait is the capability set every analyzer instance conforms to.
///
/// An instance is bound to exactly one flow. The engine calls [`Analyzer::on_init`] once
/// right after construction, then [`Analyzer::feed`] for every payload until the analyzer
/// reports it is done, and finally [`Analyzer::close`].
pub trait Analyzer: Send + Debug {
    /// Get the name of the analyzer.
    ///
    /// # Returns
    ///
    /// $str: the name returned
    fn name(&self) -> &str;

    /// Get the byte limit for this analyzer.
    ///
    /// For example, an analyzer can return 1000 to indicate that it only ever needs
    /// the first 1000 bytes of a flow to do its job. If the flow is still not
    /// done after 1000 bytes, the engine will stop feeding it data and close it.
    /// An analyzer can return 0 to indicate that it does not have a hard limit.
    ///
    /// # Returns
    ///
    /// u32: the byte limit for this analyzer.
    fn limit(&self) -> u32;

    /// Bind the instance to the flow it was created for.
    ///
    /// # Arguments
    ///
    /// * `info`: the identity of the flow.
    #[allow(unused_variables)]
    fn on_init(&mut self, info: &FlowInfo) {}

    /// Feed a chunk of payload to the analyzer.
    ///
    /// # Arguments
    ///
    /// * `rev`: A boolean indicating if the data travels from the responder to the originator.
    /// * `data`: A slice of bytes representing the payload.
    ///
    /// # Returns
    ///
    /// A tuple containing:
    /// * An optional `PropUpdate` with the information extracted from the flow (can be `None`).
    /// * A boolean indicating whether the analyzer is "done" with this flow (i.e., no more data should be fed).
    fn feed(&mut self, rev: bool, data: &[u8]) -> (Option<PropUpdate>, bool);

    /// Close the analyzer.
    /// Either the flow is torn down, or the analyzer has reached its byte limit.
    ///
    /// # Arguments
    ///
    /// * `limited`: A boolean indicating if the analyzer is being closed due to reaching its byte limit.
    ///
    /// # Returns
    ///
    /// An optional `PropUpdate` with the final information extracted from the flow (can be `None`).
    fn close(&mut self, limited: bool) -> Option<PropUpdate>;
}

/// The transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    /// TCP
    TCP,
    /// UDP
    UDP,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let transport_str = match self {
            Transport::TCP => "tcp",
            Transport::UDP => "udp",
        };
        write!(f, "{}", transport_str)
    }
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::TCP),
            "udp" => Ok(Transport::UDP),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

/// The `FlowInfo` struct holds the identity of an observed flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowInfo {
    /// Unique id of the flow, generated when the flow is first seen.
    pub uid: i64,
    /// Transport protocol.
    pub transport: Transport,
    /// SrcIP is the source IP address of the originator.
    pub src_ip: IpAddr,
    /// DstIP is the destination IP address.
    pub dst_ip: IpAddr,
    /// SrcPort is the source port.
    pub src_port: u16,
    /// DstPort is the destination port.
    pub dst_port: u16,
}

impl FlowInfo {
    /// Checks whether a packet with the given addresses belongs to this flow.
    ///
    /// # Returns
    ///
    /// A tuple containing a boolean indicating if the packet matches and a boolean
    /// indicating if it travels in the reverse direction.
    pub fn matches(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
    ) -> (bool, bool) {
        let forward = self.src_ip == src_ip
            && self.dst_ip == dst_ip
            && self.src_port == src_port
            && self.dst_port == dst_port;

        let reverse = self.src_ip == dst_ip
            && self.dst_ip == src_ip
            && self.src_port == dst_port
            && self.dst_port == src_port;

        (forward || reverse, reverse)
    }
}

impl fmt::Display for FlowInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{} {}:{} -> {}:{}",
            self.uid, self.transport, self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Property Map for an analyzer. From String to the property.
pub type PropMap = HashMap<String, Arc<dyn std::any::Any + Send + Sync>>;

/// Combined Property Map.
/// analyzer -> PropMap
pub type CombinedPropMap = HashMap<String, PropMap>;

/// Function to extract (String, String) pairs from CombinedPropMap, sorted by key.
pub fn extract_pairs_from_combinedpropmap(combined_map: &CombinedPropMap) -> Vec<(String, String)> {
    let mut result = Vec::new();

    for (analyzer_key, prop_map) in combined_map {
        flatten_prop_map(analyzer_key, prop_map, &mut result);
    }

    result.sort();
    result
}

fn flatten_prop_map(prefix: &str, prop_map: &PropMap, result: &mut Vec<(String, String)>) {
    for (key, value) in prop_map {
        let new_key = format!("{}_{}", prefix, key);

        if let Some(string_value) = value.downcast_ref::<String>() {
            result.push((new_key, string_value.clone()));
        } else if let Some(number) = value.downcast_ref::<u64>() {
            result.push((new_key, number.to_string()));
        } else if let Some(nested_map) = value.downcast_ref::<PropMap>() {
            flatten_prop_map(&new_key, nested_map, result);
        }
    }
}

/// The `PropUpdateType` enum defines the types of property updates that can occur.
#[derive(PartialEq, Debug)]
pub enum PropUpdateType {
    /// None
    None,
    /// Merge the maps
    Merge,
    /// Replace the map
    Replace,
    /// Delete the map
    Delete,
}

/// The `PropUpdate` struct holds information about a property update.
#[derive(Debug)]
pub struct PropUpdate {
    /// The PropUpdateType
    pub update_type: PropUpdateType,
    /// The current map
    pub map: PropMap,
}
