use serde::Deserialize;

/// Protocol and engine parameters with the conventional TCP Reno defaults.
/// A topology document may override any of them through [`ParamsOverride`].
#[derive(Debug, Clone, Copy)]
pub struct SimParams {
    /// Initial congestion window, in packets.
    pub init_cwnd: f64,
    /// Initial slow-start threshold. Unbounded by default.
    pub init_ssthresh: f64,
    /// Initial retransmission timeout in seconds.
    pub init_rto: f64,
    pub rto_min: f64,
    pub rto_max: f64,
    /// Gain of the smoothed RTT estimator.
    pub rtt_alpha: f64,
    /// Gain of the RTT variance estimator.
    pub rtt_beta: f64,
    /// Duplicate ACKs needed to trigger a fast retransmit.
    pub dup_ack_threshold: u32,
    /// Receiver deadline after which the last cumulative ACK is re-emitted.
    pub dup_ack_interval: f64,
    /// Period of the distance-vector exchange, in virtual seconds.
    pub t_routing: f64,
    /// MSS applied to flows that do not specify one, in bits.
    pub default_mss_bits: u64,
    /// Width of the windows used for rate metric samples, in seconds.
    pub sample_interval: f64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            init_cwnd: 1.0,
            init_ssthresh: f64::INFINITY,
            init_rto: 1.0,
            rto_min: 1.0,
            rto_max: 60.0,
            rtt_alpha: 1.0 / 8.0,
            rtt_beta: 1.0 / 4.0,
            dup_ack_threshold: 3,
            dup_ack_interval: 1.0,
            t_routing: 5.0,
            default_mss_bits: 8192,
            sample_interval: 0.1,
        }
    }
}

/// Optional `params` object of a topology document. Every field falls back
/// to the [`SimParams`] default when absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamsOverride {
    pub init_cwnd: Option<f64>,
    pub init_ssthresh: Option<f64>,
    pub init_rto: Option<f64>,
    pub rto_min: Option<f64>,
    pub rto_max: Option<f64>,
    pub rtt_alpha: Option<f64>,
    pub rtt_beta: Option<f64>,
    pub dup_ack_threshold: Option<u32>,
    pub dup_ack_interval: Option<f64>,
    pub t_routing: Option<f64>,
    pub default_mss_bits: Option<u64>,
    pub sample_interval: Option<f64>,
}

impl ParamsOverride {
    pub fn apply_to(&self, params: &mut SimParams) {
        if let Some(v) = self.init_cwnd {
            params.init_cwnd = v;
        }
        if let Some(v) = self.init_ssthresh {
            params.init_ssthresh = v;
        }
        if let Some(v) = self.init_rto {
            params.init_rto = v;
        }
        if let Some(v) = self.rto_min {
            params.rto_min = v;
        }
        if let Some(v) = self.rto_max {
            params.rto_max = v;
        }
        if let Some(v) = self.rtt_alpha {
            params.rtt_alpha = v;
        }
        if let Some(v) = self.rtt_beta {
            params.rtt_beta = v;
        }
        if let Some(v) = self.dup_ack_threshold {
            params.dup_ack_threshold = v;
        }
        if let Some(v) = self.dup_ack_interval {
            params.dup_ack_interval = v;
        }
        if let Some(v) = self.t_routing {
            params.t_routing = v;
        }
        if let Some(v) = self.default_mss_bits {
            params.default_mss_bits = v;
        }
        if let Some(v) = self.sample_interval {
            params.sample_interval = v;
        }
    }

    pub fn resolve(&self) -> SimParams {
        let mut params = SimParams::default();
        self.apply_to(&mut params);
        params
    }
}
