use std::collections::BTreeMap;

/// Size of an acknowledgment packet in bits.
pub const ACK_SIZE_BITS: u64 = 64;

/// Size of a routing probe in bits, independent of the vector it carries.
pub const ROUTING_SIZE_BITS: u64 = 512;

/// Cost table advertised by a router: destination host id -> best known
/// path cost in seconds. BTreeMap keeps broadcast payloads deterministic.
pub type DistanceVector = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Data,
    Ack,
    Routing,
}

/// A packet travelling through the simulated network. Immutable after
/// creation; hops are modelled by re-scheduling the same value.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    pub size_bits: u64,
    /// For DATA: sequence number. For ACK: next expected DATA sequence.
    /// Unused for ROUTING.
    pub seq: u64,
    pub src: String,
    pub dst: String,
    /// Parent flow for DATA and ACK packets; routing probes have none.
    pub flow_id: Option<String>,
    /// The sender's distance vector, carried by ROUTING packets only.
    pub payload: Option<DistanceVector>,
}

impl Packet {
    pub fn data(flow_id: &str, seq: u64, size_bits: u64, src: &str, dst: &str) -> Self {
        Self {
            kind: PacketKind::Data,
            size_bits,
            seq,
            src: src.to_string(),
            dst: dst.to_string(),
            flow_id: Some(flow_id.to_string()),
            payload: None,
        }
    }

    pub fn ack(flow_id: &str, next_expected: u64, src: &str, dst: &str) -> Self {
        Self {
            kind: PacketKind::Ack,
            size_bits: ACK_SIZE_BITS,
            seq: next_expected,
            src: src.to_string(),
            dst: dst.to_string(),
            flow_id: Some(flow_id.to_string()),
            payload: None,
        }
    }

    pub fn routing(src: &str, dst: &str, vector: DistanceVector) -> Self {
        Self {
            kind: PacketKind::Routing,
            size_bits: ROUTING_SIZE_BITS,
            seq: 0,
            src: src.to_string(),
            dst: dst.to_string(),
            flow_id: None,
            payload: Some(vector),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bits.div_ceil(8)
    }

    pub fn is_data(&self) -> bool {
        self.kind == PacketKind::Data
    }

    pub fn is_ack(&self) -> bool {
        self.kind == PacketKind::Ack
    }

    pub fn is_routing(&self) -> bool {
        self.kind == PacketKind::Routing
    }
}
