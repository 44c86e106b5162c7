pub mod config;
pub mod pcap;
pub mod trace;
