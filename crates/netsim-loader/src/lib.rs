//! Topology configuration loader: parses the JSON-shaped document described
//! by the simulator's external interface and validates every cross
//! reference before a single event runs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use netsim_abstract::TopologySpec;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed topology document")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate identifier `{0}`")]
    DuplicateId(String),
    #[error("link `{link}` references unknown node `{node}`")]
    DanglingEndpoint { link: String, node: String },
    #[error("link `{0}` connects a node to itself")]
    SelfLoop(String),
    #[error("flow `{flow}` references unknown node `{node}`")]
    DanglingFlowEndpoint { flow: String, node: String },
    #[error("flow `{flow}` endpoint `{node}` is not a host")]
    FlowEndpointNotHost { flow: String, node: String },
    #[error("flow `{0}` has identical source and destination")]
    FlowLoop(String),
    #[error("host `{0}` has no incident link")]
    IsolatedHost(String),
    #[error("{entity}: {field} must be positive")]
    NonPositive {
        entity: String,
        field: &'static str,
    },
    #[error("{entity}: {field} must be non-negative")]
    Negative {
        entity: String,
        field: &'static str,
    },
}

/// Read, parse and validate a topology document from disk.
pub fn load_topology(path: &Path) -> Result<TopologySpec, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_topology(&text)
}

/// Parse and validate a topology document held in memory.
pub fn parse_topology(text: &str) -> Result<TopologySpec, ConfigError> {
    let spec: TopologySpec = serde_json::from_str(text)?;
    validate(&spec)?;
    Ok(spec)
}

/// Check every invariant the simulation core assumes of its input: unique
/// identifiers, resolvable references, host-terminated flows, attached
/// hosts, and sane numeric ranges.
pub fn validate(spec: &TopologySpec) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();
    let all_ids = spec
        .hosts
        .iter()
        .map(|h| h.id.as_str())
        .chain(spec.routers.iter().map(|r| r.id.as_str()))
        .chain(spec.links.iter().map(|l| l.id.as_str()))
        .chain(spec.flows.iter().map(|f| f.id.as_str()));
    for id in all_ids {
        if !ids.insert(id) {
            return Err(ConfigError::DuplicateId(id.to_string()));
        }
    }

    for link in &spec.links {
        for node in &link.endpoints {
            if !spec.is_node(node) {
                return Err(ConfigError::DanglingEndpoint {
                    link: link.id.clone(),
                    node: node.clone(),
                });
            }
        }
        if link.endpoints[0] == link.endpoints[1] {
            return Err(ConfigError::SelfLoop(link.id.clone()));
        }
        if !(link.capacity_bps > 0.0) {
            return Err(ConfigError::NonPositive {
                entity: format!("link `{}`", link.id),
                field: "capacity_bps",
            });
        }
        if !(link.prop_delay_s >= 0.0) {
            return Err(ConfigError::Negative {
                entity: format!("link `{}`", link.id),
                field: "prop_delay_s",
            });
        }
    }

    for host in &spec.hosts {
        let attached = spec
            .links
            .iter()
            .any(|l| l.endpoints.contains(&host.id));
        if !attached {
            return Err(ConfigError::IsolatedHost(host.id.clone()));
        }
    }

    for flow in &spec.flows {
        for node in [&flow.src, &flow.dst] {
            if !spec.is_node(node) {
                return Err(ConfigError::DanglingFlowEndpoint {
                    flow: flow.id.clone(),
                    node: node.clone(),
                });
            }
            if !spec.is_host(node) {
                return Err(ConfigError::FlowEndpointNotHost {
                    flow: flow.id.clone(),
                    node: node.clone(),
                });
            }
        }
        if flow.src == flow.dst {
            return Err(ConfigError::FlowLoop(flow.id.clone()));
        }
        if flow.payload_bytes == 0 {
            return Err(ConfigError::NonPositive {
                entity: format!("flow `{}`", flow.id),
                field: "payload_bytes",
            });
        }
        if !(flow.start_time_s >= 0.0) {
            return Err(ConfigError::Negative {
                entity: format!("flow `{}`", flow.id),
                field: "start_time_s",
            });
        }
        if let Some(mss) = flow.mss_bits
            && mss == 0
        {
            return Err(ConfigError::NonPositive {
                entity: format!("flow `{}`", flow.id),
                field: "mss_bits",
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> String {
        r#"{
            "hosts": [{"id": "h1"}, {"id": "h2"}],
            "routers": [{"id": "r1"}],
            "links": [
                {"id": "l1", "endpoints": ["h1", "r1"],
                 "capacity_bps": 1.0e7, "prop_delay_s": 0.01, "buffer_bytes": 64000},
                {"id": "l2", "endpoints": ["r1", "h2"],
                 "capacity_bps": 1.0e7, "prop_delay_s": 0.01, "buffer_bytes": 64000}
            ],
            "flows": [
                {"id": "f1", "src": "h1", "dst": "h2",
                 "payload_bytes": 1000000, "start_time_s": 1.0, "mss_bits": 8192}
            ]
        }"#
        .to_string()
    }

    #[test]
    fn parses_valid_document() {
        let spec = parse_topology(&sample()).unwrap();
        assert_eq!(spec.hosts.len(), 2);
        assert_eq!(spec.routers.len(), 1);
        assert_eq!(spec.links.len(), 2);
        assert_eq!(spec.flows.len(), 1);
        assert_eq!(spec.flows[0].mss_bits, Some(8192));
    }

    #[test]
    fn rejects_duplicate_identifier() {
        let text = sample().replace("\"id\": \"h2\"", "\"id\": \"h1\"");
        assert!(matches!(
            parse_topology(&text),
            Err(ConfigError::DuplicateId(id)) if id == "h1"
        ));
    }

    #[test]
    fn rejects_dangling_link_endpoint() {
        let text = sample().replace("[\"r1\", \"h2\"]", "[\"r1\", \"h9\"]");
        assert!(matches!(
            parse_topology(&text),
            Err(ConfigError::DanglingEndpoint { node, .. }) if node == "h9"
        ));
    }

    #[test]
    fn rejects_flow_terminating_at_router() {
        let text = sample().replace("\"dst\": \"h2\"", "\"dst\": \"r1\"");
        assert!(matches!(
            parse_topology(&text),
            Err(ConfigError::FlowEndpointNotHost { node, .. }) if node == "r1"
        ));
    }

    #[test]
    fn rejects_isolated_host() {
        let mut spec = parse_topology(&sample()).unwrap();
        spec.hosts.push(netsim_abstract::HostSpec {
            id: "h3".to_string(),
        });
        assert!(matches!(
            validate(&spec),
            Err(ConfigError::IsolatedHost(id)) if id == "h3"
        ));
    }

    #[test]
    fn rejects_negative_start_time() {
        let text = sample().replace("\"start_time_s\": 1.0", "\"start_time_s\": -1.0");
        assert!(matches!(
            parse_topology(&text),
            Err(ConfigError::Negative { .. })
        ));
    }

    #[test]
    fn rejects_non_positive_capacity() {
        let text = sample().replacen("\"capacity_bps\": 1.0e7", "\"capacity_bps\": 0.0", 1);
        assert!(matches!(
            parse_topology(&text),
            Err(ConfigError::NonPositive { .. })
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            parse_topology("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
