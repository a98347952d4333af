pub mod packet;
pub mod params;
pub mod scenario;
pub mod topology;

pub use packet::{ACK_SIZE_BITS, DistanceVector, Packet, PacketKind, ROUTING_SIZE_BITS};
pub use params::{ParamsOverride, SimParams};
pub use scenario::{TestAction, TestAssertion, TestScenario};
pub use topology::{FlowSpec, HostSpec, LinkSpec, RouterSpec, TopologySpec};
