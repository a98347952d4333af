use serde::Serialize;

/// End-of-run summary for one flow.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub id: String,
    pub total_packets: u64,
    /// Virtual time the final ACK reached the sender; None if the run
    /// stopped before the flow finished.
    pub completed_at: Option<f64>,
    pub fast_retransmits: u64,
    pub timeouts: u64,
    pub final_cwnd: f64,
    pub max_cwnd: f64,
    pub final_ssthresh: f64,
    pub final_rto: f64,
}

/// Serializable snapshot of a finished simulation, for scenario assertions
/// and operator inspection.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub duration_s: f64,
    pub events_dispatched: u64,
    /// Packets lost to full buffers.
    pub drops: u64,
    /// Packets discarded because no route was known for their destination.
    pub routing_misses: u64,
    pub flows: Vec<FlowSummary>,
    pub metric_samples: usize,
}

impl SimulationReport {
    pub fn flow(&self, id: &str) -> Option<&FlowSummary> {
        self.flows.iter().find(|f| f.id == id)
    }
}
