use std::collections::{BTreeMap, BTreeSet};

use netsim_abstract::{FlowSpec, SimParams};

/// Congestion-control phase of a flow's sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SlowStart,
    CongestionAvoid,
    FastRecovery,
}

/// What the sender decided upon processing one cumulative ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// `base` advanced; the window may admit new transmissions.
    Advanced { completed: bool },
    /// Third duplicate: retransmit `base` immediately.
    FastRetransmit { seq: u64 },
    /// Duplicate ACK absorbed; window may have inflated.
    Duplicate,
    /// ACK below the cumulative point; no state change.
    Stale,
}

/// Per-connection sender state: sliding window, Reno congestion control,
/// RTT estimation and retransmission timing. The receive side lives with
/// the destination host as [`ReceiveState`].
#[derive(Debug)]
pub struct Flow {
    pub id: String,
    pub src_host: String,
    pub dst_host: String,
    pub payload_bytes: u64,
    pub mss_bits: u64,
    pub start_time: f64,
    pub total_packets: u64,

    pub cwnd: f64,
    pub ssthresh: f64,
    pub phase: Phase,
    /// Oldest unacknowledged sequence number.
    pub base: u64,
    /// Lowest sequence number never transmitted.
    pub next_seq: u64,
    /// Send times of in-flight DATA, stamped when the packet leaves the
    /// source host.
    pub in_flight: BTreeMap<u64, f64>,
    pub dup_ack_count: u32,
    pub last_acked_seq: u64,

    pub srtt: Option<f64>,
    pub rttvar: f64,
    pub rto: f64,
    /// Generation of the one live retransmission timer; stale timer events
    /// are skipped by the driver.
    pub timeout_generation: u64,

    pub started: bool,
    pub completed_at: Option<f64>,
    pub fast_retransmits: u64,
    pub timeouts: u64,
    pub max_cwnd: f64,
}

impl Flow {
    pub fn new(spec: &FlowSpec, params: &SimParams) -> Self {
        let mss_bits = spec.mss_bits.unwrap_or(params.default_mss_bits);
        let total_packets = (spec.payload_bytes * 8).div_ceil(mss_bits);
        Self {
            id: spec.id.clone(),
            src_host: spec.src.clone(),
            dst_host: spec.dst.clone(),
            payload_bytes: spec.payload_bytes,
            mss_bits,
            start_time: spec.start_time_s,
            total_packets,
            cwnd: params.init_cwnd,
            ssthresh: params.init_ssthresh,
            phase: Phase::SlowStart,
            base: 0,
            next_seq: 0,
            in_flight: BTreeMap::new(),
            dup_ack_count: 0,
            last_acked_seq: 0,
            srtt: None,
            rttvar: 0.0,
            rto: params.init_rto,
            timeout_generation: 0,
            started: false,
            completed_at: None,
            fast_retransmits: 0,
            timeouts: 0,
            max_cwnd: params.init_cwnd,
        }
    }

    /// Highest sequence the current window admits (exclusive).
    pub fn window_limit(&self) -> u64 {
        (self.base + self.cwnd.floor() as u64).min(self.total_packets)
    }

    /// Sequences newly admitted by the window; advances `next_seq` past
    /// them. The caller schedules one transmission per returned sequence.
    pub fn admit_sends(&mut self) -> std::ops::Range<u64> {
        let limit = self.window_limit().max(self.next_seq);
        let range = self.next_seq..limit;
        self.next_seq = limit;
        range
    }

    /// Fold one RTT sample into the smoothed estimator and refresh the RTO.
    pub fn observe_rtt(&mut self, sample: f64, params: &SimParams) {
        match self.srtt {
            Some(srtt) => {
                self.rttvar =
                    (1.0 - params.rtt_beta) * self.rttvar + params.rtt_beta * (sample - srtt).abs();
                self.srtt = Some((1.0 - params.rtt_alpha) * srtt + params.rtt_alpha * sample);
            }
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2.0;
            }
        }
        let srtt = self.srtt.unwrap_or(sample);
        self.rto = (srtt + 4.0 * self.rttvar).clamp(params.rto_min, params.rto_max);
    }

    /// Apply one cumulative ACK carrying next-expected sequence `ack` at
    /// virtual time `now`. Pure state transition; the engine performs the
    /// scheduling the returned outcome calls for.
    pub fn on_ack(&mut self, ack: u64, now: f64, params: &SimParams) -> AckOutcome {
        assert!(
            ack <= self.next_seq,
            "flow {}: ACK {} beyond highest transmitted {}",
            self.id,
            ack,
            self.next_seq
        );

        if ack > self.last_acked_seq {
            if let Some(&sent) = self.in_flight.get(&(ack - 1)) {
                self.observe_rtt(now - sent, params);
            }
            self.base = ack;
            self.last_acked_seq = ack;
            self.in_flight = self.in_flight.split_off(&ack);
            self.dup_ack_count = 0;

            match self.phase {
                Phase::SlowStart => {
                    self.set_cwnd(self.cwnd + 1.0);
                    if self.cwnd >= self.ssthresh {
                        self.phase = Phase::CongestionAvoid;
                    }
                }
                Phase::CongestionAvoid => self.set_cwnd(self.cwnd + 1.0 / self.cwnd),
                Phase::FastRecovery => {
                    self.set_cwnd(self.ssthresh);
                    self.phase = Phase::CongestionAvoid;
                }
            }

            let completed = self.base == self.total_packets;
            if completed {
                self.completed_at = Some(now);
            }
            AckOutcome::Advanced { completed }
        } else if ack == self.last_acked_seq {
            self.dup_ack_count += 1;
            if self.dup_ack_count == params.dup_ack_threshold && self.phase != Phase::FastRecovery {
                self.ssthresh = (self.cwnd / 2.0).floor().max(2.0);
                self.set_cwnd(self.ssthresh + params.dup_ack_threshold as f64);
                self.phase = Phase::FastRecovery;
                self.fast_retransmits += 1;
                AckOutcome::FastRetransmit { seq: ack }
            } else {
                if self.phase == Phase::FastRecovery {
                    // Window inflation: each further duplicate signals one
                    // more packet has left the network.
                    self.set_cwnd(self.cwnd + 1.0);
                }
                AckOutcome::Duplicate
            }
        } else {
            AckOutcome::Stale
        }
    }

    /// Collapse the window after a retransmission timeout and back off the
    /// RTO exponentially.
    pub fn on_timeout(&mut self, params: &SimParams) {
        self.ssthresh = (self.cwnd / 2.0).floor().max(2.0);
        self.set_cwnd(1.0);
        self.phase = Phase::SlowStart;
        self.rto = (self.rto * 2.0).min(params.rto_max);
        self.dup_ack_count = 0;
        self.timeouts += 1;
    }

    pub fn outstanding(&self) -> bool {
        self.base < self.next_seq
    }

    fn set_cwnd(&mut self, cwnd: f64) {
        self.cwnd = cwnd;
        if cwnd > self.max_cwnd {
            self.max_cwnd = cwnd;
        }
    }
}

/// Receive-side reassembly state a destination host keeps per flow.
#[derive(Debug, Default)]
pub struct ReceiveState {
    pub next_expected: u64,
    pub out_of_order: BTreeSet<u64>,
    /// Generation of the live duplicate-ACK deadline.
    pub deadline_generation: u64,
}

impl ReceiveState {
    /// Absorb DATA sequence `seq`, advancing through any contiguous run of
    /// previously buffered packets. Returns true when `seq` was new in-order
    /// data (the deadline must then be replaced rather than left running).
    pub fn on_data(&mut self, seq: u64) -> bool {
        if seq == self.next_expected {
            self.next_expected += 1;
            while self.out_of_order.remove(&self.next_expected) {
                self.next_expected += 1;
            }
            true
        } else {
            if seq > self.next_expected {
                self.out_of_order.insert(seq);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_flow(payload_bytes: u64) -> Flow {
        Flow::new(
            &FlowSpec {
                id: "f1".to_string(),
                src: "h1".to_string(),
                dst: "h2".to_string(),
                payload_bytes,
                start_time_s: 0.0,
                mss_bits: Some(8_000),
            },
            &SimParams::default(),
        )
    }

    #[test]
    fn total_packets_rounds_up() {
        assert_eq!(test_flow(1_000).total_packets, 1);
        assert_eq!(test_flow(1_001).total_packets, 2);
        assert_eq!(test_flow(10_000).total_packets, 10);
    }

    #[test]
    fn window_admits_floor_of_cwnd() {
        let mut flow = test_flow(10_000);
        flow.cwnd = 3.7;
        assert_eq!(flow.admit_sends(), 0..3);
        assert_eq!(flow.next_seq, 3);
        // Nothing new until the window moves.
        assert_eq!(flow.admit_sends(), 3..3);
    }

    #[test]
    fn slow_start_doubles_per_window_and_hits_threshold() {
        let params = SimParams::default();
        let mut flow = test_flow(100_000);
        flow.ssthresh = 4.0;
        flow.admit_sends();
        flow.in_flight.insert(0, 0.0);
        flow.on_ack(1, 0.1, &params);
        assert_eq!(flow.cwnd, 2.0);
        assert_eq!(flow.phase, Phase::SlowStart);
        flow.admit_sends();
        flow.on_ack(2, 0.2, &params);
        flow.on_ack(3, 0.3, &params);
        assert_eq!(flow.cwnd, 4.0);
        assert_eq!(flow.phase, Phase::CongestionAvoid);
        // Linear growth from here.
        flow.admit_sends();
        flow.on_ack(4, 0.4, &params);
        assert_eq!(flow.cwnd, 4.25);
    }

    #[test]
    fn third_duplicate_enters_fast_recovery() {
        let params = SimParams::default();
        let mut flow = test_flow(100_000);
        flow.cwnd = 8.0;
        flow.admit_sends();
        assert_eq!(flow.on_ack(0, 0.1, &params), AckOutcome::Duplicate);
        assert_eq!(flow.on_ack(0, 0.2, &params), AckOutcome::Duplicate);
        assert_eq!(
            flow.on_ack(0, 0.3, &params),
            AckOutcome::FastRetransmit { seq: 0 }
        );
        assert_eq!(flow.phase, Phase::FastRecovery);
        assert_eq!(flow.ssthresh, 4.0);
        assert_eq!(flow.cwnd, 7.0);
        assert_eq!(flow.fast_retransmits, 1);
        // Further duplicates inflate, one packet per ACK.
        assert_eq!(flow.on_ack(0, 0.4, &params), AckOutcome::Duplicate);
        assert_eq!(flow.cwnd, 8.0);
    }

    #[test]
    fn new_ack_deflates_window_on_recovery_exit() {
        let params = SimParams::default();
        let mut flow = test_flow(100_000);
        flow.cwnd = 8.0;
        flow.admit_sends();
        for _ in 0..3 {
            flow.on_ack(0, 0.1, &params);
        }
        assert_eq!(flow.phase, Phase::FastRecovery);
        let out = flow.on_ack(5, 0.5, &params);
        assert_eq!(out, AckOutcome::Advanced { completed: false });
        assert_eq!(flow.phase, Phase::CongestionAvoid);
        assert_eq!(flow.cwnd, flow.ssthresh);
        assert_eq!(flow.base, 5);
    }

    #[test]
    fn timeout_resets_window_and_backs_off() {
        let params = SimParams::default();
        let mut flow = test_flow(100_000);
        flow.cwnd = 10.0;
        flow.phase = Phase::CongestionAvoid;
        flow.on_timeout(&params);
        assert_eq!(flow.cwnd, 1.0);
        assert_eq!(flow.ssthresh, 5.0);
        assert_eq!(flow.phase, Phase::SlowStart);
        assert_eq!(flow.rto, 2.0);
        assert_eq!(flow.timeouts, 1);
        // Backoff is capped.
        for _ in 0..10 {
            flow.on_timeout(&params);
        }
        assert_eq!(flow.rto, params.rto_max);
    }

    #[test]
    fn rtt_estimator_matches_reference_values() {
        let params = SimParams::default();
        let mut flow = test_flow(100_000);
        flow.observe_rtt(0.2, &params);
        assert_eq!(flow.srtt, Some(0.2));
        assert_eq!(flow.rttvar, 0.1);
        // srtt + 4*rttvar = 0.6 clamps up to rto_min.
        assert_eq!(flow.rto, 1.0);
        flow.observe_rtt(1.0, &params);
        let srtt = 0.875 * 0.2 + 0.125 * 1.0;
        let rttvar = 0.75 * 0.1 + 0.25 * 0.8;
        assert!((flow.srtt.unwrap() - srtt).abs() < 1e-12);
        assert!((flow.rttvar - rttvar).abs() < 1e-12);
        assert!((flow.rto - (srtt + 4.0 * rttvar)).abs() < 1e-12);
    }

    #[test]
    fn stale_ack_leaves_sender_untouched() {
        let params = SimParams::default();
        let mut flow = test_flow(100_000);
        flow.cwnd = 6.0;
        flow.admit_sends();
        flow.on_ack(4, 0.5, &params);
        let (cwnd, ssthresh, base, next_seq) =
            (flow.cwnd, flow.ssthresh, flow.base, flow.next_seq);
        assert_eq!(flow.on_ack(2, 0.6, &params), AckOutcome::Stale);
        assert_eq!(flow.cwnd, cwnd);
        assert_eq!(flow.ssthresh, ssthresh);
        assert_eq!(flow.base, base);
        assert_eq!(flow.next_seq, next_seq);
    }

    #[test]
    fn final_ack_completes_flow() {
        let params = SimParams::default();
        let mut flow = test_flow(2_000);
        flow.cwnd = 4.0;
        assert_eq!(flow.admit_sends(), 0..2);
        let out = flow.on_ack(2, 1.0, &params);
        assert_eq!(out, AckOutcome::Advanced { completed: true });
        assert_eq!(flow.completed_at, Some(1.0));
    }

    #[test]
    fn receiver_reassembles_contiguous_prefix() {
        let mut rs = ReceiveState::default();
        assert!(rs.on_data(0));
        assert_eq!(rs.next_expected, 1);
        assert!(!rs.on_data(2));
        assert!(!rs.on_data(3));
        assert_eq!(rs.next_expected, 1);
        // The gap fills and the buffered run drains.
        assert!(rs.on_data(1));
        assert_eq!(rs.next_expected, 4);
        assert!(rs.out_of_order.is_empty());
        // Below the cumulative point: duplicate, no state change.
        assert!(!rs.on_data(2));
        assert_eq!(rs.next_expected, 4);
        assert!(rs.out_of_order.is_empty());
    }
}
