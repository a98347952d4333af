use serde::Deserialize;

use crate::params::ParamsOverride;

/// In-memory form of a topology document (see the loader crate for parsing
/// and validation). Hosts, routers, links and flows share one namespace of
/// string identifiers assigned at load time.
#[derive(Debug, Clone, Deserialize)]
pub struct TopologySpec {
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub routers: Vec<RouterSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
    #[serde(default)]
    pub flows: Vec<FlowSpec>,
    #[serde(default)]
    pub params: ParamsOverride,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostSpec {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterSpec {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkSpec {
    pub id: String,
    /// The two nodes this bidirectional link connects.
    pub endpoints: [String; 2],
    pub capacity_bps: f64,
    pub prop_delay_s: f64,
    pub buffer_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowSpec {
    pub id: String,
    pub src: String,
    pub dst: String,
    pub payload_bytes: u64,
    pub start_time_s: f64,
    /// Defaults to `SimParams::default_mss_bits` when absent.
    pub mss_bits: Option<u64>,
}

impl TopologySpec {
    pub fn host(&self, id: &str) -> Option<&HostSpec> {
        self.hosts.iter().find(|h| h.id == id)
    }

    pub fn is_host(&self, id: &str) -> bool {
        self.hosts.iter().any(|h| h.id == id)
    }

    pub fn is_router(&self, id: &str) -> bool {
        self.routers.iter().any(|r| r.id == id)
    }

    pub fn is_node(&self, id: &str) -> bool {
        self.is_host(id) || self.is_router(id)
    }
}
