use serde::Deserialize;

use crate::topology::TopologySpec;

/// A self-contained, reproducible run: a topology plus deterministic fault
/// injection and post-run assertions. Serialized as TOML on disk.
#[derive(Deserialize, Debug, Clone)]
pub struct TestScenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub topology: TopologySpec,
    #[serde(default)]
    pub actions: Vec<TestAction>,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
    /// Stop the run once virtual time passes this horizon, in seconds.
    #[serde(default)]
    pub horizon_s: Option<f64>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAction {
    /// Drop the first DATA packet of the flow carrying the given sequence
    /// number, at the hop where it is first transmitted.
    DropDataSeqOnce { flow: String, seq: u64 },
    /// Drop every DATA packet of the flow until the given virtual time.
    DropAllUntil { flow: String, time: f64 },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAssertion {
    /// The flow delivered its whole payload.
    FlowCompleted { flow: String },
    /// The run finished within the given virtual duration.
    MaxDuration { seconds: f64 },
    /// Total packets lost to full buffers is at most `count`.
    MaxDrops { count: u64 },
    /// Total packets lost to full buffers is at least `count`.
    MinDrops { count: u64 },
    /// The flow's congestion window reached at least this many packets.
    CwndReached { flow: String, at_least: f64 },
    /// Bounds on the flow's retransmission-timeout count.
    Timeouts {
        flow: String,
        min: u64,
        max: Option<u64>,
    },
    /// Bounds on the flow's fast-retransmit count.
    FastRetransmits {
        flow: String,
        min: u64,
        max: Option<u64>,
    },
}
