use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

use netsim_abstract::{Packet, PacketKind, SimParams, TopologySpec};
use tracing::{debug, info};

use crate::flow::{AckOutcome, Flow, Phase};
use crate::link::{EnqueueOutcome, Link};
use crate::metrics::{MetricsRecorder, Series};
use crate::node::{Host, NeighborEdge, Node, Router};
use crate::report::{FlowSummary, SimulationReport};

/// One atomic state transition of the simulation. Events carry the minimum
/// context needed to execute and to schedule their successors.
#[derive(Debug)]
pub enum Event {
    StartFlow {
        flow: String,
    },
    SendPacket {
        pkt: Packet,
        from: String,
        link: String,
    },
    ReceivePacket {
        pkt: Packet,
        at: String,
    },
    Timeout {
        flow: String,
        generation: u64,
    },
    DuplicateAckDeadline {
        flow: String,
        generation: u64,
    },
    RouterDiscovery {
        router: String,
    },
    /// Buffer credit for the packet leaving `from` at this instant.
    LinkDeparture {
        link: String,
        from: String,
    },
}

#[derive(Debug)]
struct Scheduled {
    time: f64,
    seq: u64, // insertion order, breaks ties between simultaneous events
    event: Event,
}

// Custom Ord for a min-heap: earliest time pops first, FIFO within a time.
impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The simulation: owns every node, link and flow, the event queue, and
/// the virtual clock. Single-threaded; handlers mutate only the entities
/// named in their contract.
pub struct Simulation {
    time: f64,
    queue: BinaryHeap<Scheduled>,
    event_seq: u64,
    params: SimParams,

    nodes: BTreeMap<String, Node>,
    links: BTreeMap<String, Link>,
    flows: BTreeMap<String, Flow>,

    metrics: MetricsRecorder,
    events_dispatched: u64,
    drops: u64,
    routing_misses: u64,

    // Deterministic fault injection, checked when a flow's source transmits.
    drop_data_seq_once: Vec<(String, u64)>,
    blackholes: Vec<(String, f64)>,

    horizon: Option<f64>,
}

impl Simulation {
    /// Wire up a validated topology and schedule the initial events: one
    /// `RouterDiscovery` per router at t = 0 and one `StartFlow` per flow.
    pub fn new(spec: &TopologySpec) -> Self {
        let params = spec.params.resolve();

        let mut adjacency: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for link in &spec.links {
            for endpoint in &link.endpoints {
                adjacency
                    .entry(endpoint.clone())
                    .or_default()
                    .push(link.id.clone());
            }
        }
        for links in adjacency.values_mut() {
            links.sort();
        }

        let mut nodes = BTreeMap::new();
        for host in &spec.hosts {
            let adj = adjacency.get(&host.id).cloned().unwrap_or_default();
            nodes.insert(host.id.clone(), Node::Host(Host::new(&host.id, adj)));
        }
        for router in &spec.routers {
            let adj = adjacency.get(&router.id).cloned().unwrap_or_default();
            nodes.insert(router.id.clone(), Node::Router(Router::new(&router.id, adj)));
        }

        let mut links = BTreeMap::new();
        for link in &spec.links {
            let routing_buffered = link.endpoints.iter().all(|e| spec.is_router(e));
            links.insert(link.id.clone(), Link::new(link, routing_buffered));
        }

        let mut flows = BTreeMap::new();
        for flow in &spec.flows {
            flows.insert(flow.id.clone(), Flow::new(flow, &params));
        }

        let mut sim = Self {
            time: 0.0,
            queue: BinaryHeap::new(),
            event_seq: 0,
            params,
            nodes,
            links,
            flows,
            metrics: MetricsRecorder::new(params.sample_interval),
            events_dispatched: 0,
            drops: 0,
            routing_misses: 0,
            drop_data_seq_once: Vec::new(),
            blackholes: Vec::new(),
            horizon: None,
        };

        for router in &spec.routers {
            sim.schedule(
                0.0,
                Event::RouterDiscovery {
                    router: router.id.clone(),
                },
            );
        }
        for flow in &spec.flows {
            sim.schedule(
                flow.start_time_s,
                Event::StartFlow {
                    flow: flow.id.clone(),
                },
            );
        }
        sim
    }

    /// Register a deterministic fault: drop the first DATA packet of `flow`
    /// carrying sequence `seq` as it leaves the source host.
    pub fn add_drop_data_seq_once(&mut self, flow: &str, seq: u64) {
        self.drop_data_seq_once.push((flow.to_string(), seq));
    }

    /// Register a deterministic fault: drop every DATA packet of `flow`
    /// leaving the source host before virtual time `until`.
    pub fn add_blackhole_until(&mut self, flow: &str, until: f64) {
        self.blackholes.push((flow.to_string(), until));
    }

    /// Stop `run_until_empty` once the next event lies past this time.
    pub fn set_horizon(&mut self, horizon: Option<f64>) {
        self.horizon = horizon;
    }

    pub fn current_time(&self) -> f64 {
        self.time
    }

    pub fn params(&self) -> &SimParams {
        &self.params
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub fn flow(&self, id: &str) -> Option<&Flow> {
        self.flows.get(id)
    }

    pub fn remaining_events(&self) -> usize {
        self.queue.len()
    }

    pub fn peek_next_time(&self) -> Option<f64> {
        self.queue.peek().map(|s| s.time)
    }

    /// Current route a router holds for a destination host, if any.
    pub fn router_route(&self, router: &str, dst: &str) -> Option<(String, f64)> {
        match self.nodes.get(router) {
            Some(Node::Router(r)) => r.route(dst).cloned(),
            _ => None,
        }
    }

    fn schedule(&mut self, time: f64, event: Event) {
        debug_assert!(time >= self.time, "event scheduled in the past");
        self.queue.push(Scheduled {
            time,
            seq: self.event_seq,
            event,
        });
        self.event_seq += 1;
    }

    /// Extract and dispatch the next event. Returns false once the queue
    /// is empty.
    pub fn step(&mut self) -> bool {
        let Some(scheduled) = self.queue.pop() else {
            return false;
        };
        debug_assert!(scheduled.time >= self.time, "virtual time went backwards");
        self.time = scheduled.time;
        self.events_dispatched += 1;
        debug!(
            "t={:.6} dispatching {:?}",
            self.time, scheduled.event
        );

        match scheduled.event {
            Event::StartFlow { flow } => self.handle_start_flow(flow),
            Event::SendPacket { pkt, from, link } => self.handle_send_packet(pkt, from, link),
            Event::ReceivePacket { pkt, at } => self.handle_receive_packet(pkt, at),
            Event::Timeout { flow, generation } => self.handle_timeout(flow, generation),
            Event::DuplicateAckDeadline { flow, generation } => {
                self.handle_dup_ack_deadline(flow, generation)
            }
            Event::RouterDiscovery { router } => self.handle_router_discovery(router),
            Event::LinkDeparture { link, from } => self.handle_link_departure(link, from),
        }

        #[cfg(debug_assertions)]
        self.assert_invariants();
        true
    }

    /// Drive the simulation until no events remain, or until the next
    /// event lies past the configured horizon.
    pub fn run_until_empty(&mut self) {
        while let Some(next) = self.peek_next_time() {
            if self.horizon.is_some_and(|h| next > h) {
                info!("virtual time horizon reached at t={:.6}", self.time);
                break;
            }
            self.step();
        }
        self.metrics.finish(self.time);
        info!(
            "simulation drained: t={:.6}, {} events, {} drops, {} routing misses",
            self.time, self.events_dispatched, self.drops, self.routing_misses
        );
    }

    /// Serializable end-of-run summary.
    pub fn export_report(&self) -> SimulationReport {
        SimulationReport {
            duration_s: self.time,
            events_dispatched: self.events_dispatched,
            drops: self.drops,
            routing_misses: self.routing_misses,
            flows: self
                .flows
                .values()
                .map(|f| FlowSummary {
                    id: f.id.clone(),
                    total_packets: f.total_packets,
                    completed_at: f.completed_at,
                    fast_retransmits: f.fast_retransmits,
                    timeouts: f.timeouts,
                    final_cwnd: f.cwnd,
                    max_cwnd: f.max_cwnd,
                    final_ssthresh: f.ssthresh,
                    final_rto: f.rto,
                })
                .collect(),
            metric_samples: self.metrics.len(),
        }
    }

    // ---- event handlers ----------------------------------------------

    fn handle_start_flow(&mut self, flow_id: String) {
        {
            let flow = self.flows.get_mut(&flow_id).expect("start of unknown flow");
            assert!(!flow.started, "flow {flow_id} started twice");
            flow.started = true;
        }
        info!("t={:.6} flow {} starting", self.time, flow_id);
        self.pump_flow(&flow_id);
        self.arm_timeout(&flow_id);
        self.record_window(&flow_id);
    }

    fn handle_send_packet(&mut self, pkt: Packet, from: String, link_id: String) {
        let now = self.time;

        if pkt.kind == PacketKind::Data {
            let flow_id = pkt.flow_id.as_deref().expect("DATA without flow");
            let at_source = self
                .flows
                .get(flow_id)
                .expect("DATA for unknown flow")
                .src_host
                == from;
            if at_source {
                if self.injected_drop(&pkt, now) {
                    self.drops += 1;
                    self.metrics.count(now, Series::PacketLoss, &link_id);
                    debug!(
                        "t={:.6} injected drop of flow {} seq {}",
                        now, flow_id, pkt.seq
                    );
                    return;
                }
                // Send time stamped at execute time, so the RTT sample will
                // include queueing experienced before transmission.
                let flow = self.flows.get_mut(flow_id).unwrap();
                flow.in_flight.insert(pkt.seq, now);
            }
        }

        let (outcome, to) = {
            let link = self.links.get_mut(&link_id).expect("send on unknown link");
            let outcome = link.try_enqueue(&from, &pkt, now);
            let to = link.other_endpoint(&from).to_string();
            (outcome, to)
        };

        match outcome {
            EnqueueOutcome::Accepted { departure, arrival } => {
                let occupancy = self.links[&link_id].occupancy(&from, now);
                self.metrics
                    .point(now, Series::BufferOccupancy, &link_id, occupancy);
                self.metrics
                    .add_rate(now, Series::LinkRate, &link_id, pkt.size_bits);
                self.schedule(arrival, Event::ReceivePacket { pkt, at: to });
                self.schedule(
                    departure,
                    Event::LinkDeparture {
                        link: link_id,
                        from,
                    },
                );
            }
            EnqueueOutcome::Dropped => {
                self.drops += 1;
                self.metrics.count(now, Series::PacketLoss, &link_id);
                debug!(
                    "t={:.6} link {} buffer full, dropped {:?} seq {}",
                    now, link_id, pkt.kind, pkt.seq
                );
            }
        }
    }

    fn handle_receive_packet(&mut self, pkt: Packet, at: String) {
        match self.nodes.get(&at) {
            Some(Node::Router(_)) => self.router_receive(pkt, at),
            Some(Node::Host(_)) => self.host_receive(pkt, at),
            None => panic!("packet arrived at unknown node {at}"),
        }
    }

    fn handle_timeout(&mut self, flow_id: String, generation: u64) {
        let now = self.time;
        let params = self.params;
        let base = {
            let flow = self.flows.get_mut(&flow_id).expect("timeout of unknown flow");
            if flow.timeout_generation != generation {
                debug!("t={:.6} skipping cancelled timeout for flow {}", now, flow_id);
                return;
            }
            if flow.completed_at.is_some() {
                return;
            }
            flow.on_timeout(&params);
            flow.base
        };
        debug!(
            "t={:.6} flow {} retransmission timeout, resending seq {}",
            now, flow_id, base
        );
        self.record_window(&flow_id);
        self.retransmit(&flow_id, base);
        self.arm_timeout(&flow_id);
    }

    fn handle_dup_ack_deadline(&mut self, flow_id: String, generation: u64) {
        let now = self.time;
        let (dst_host, src_host, total) = {
            let flow = self.flows.get(&flow_id).expect("deadline of unknown flow");
            (
                flow.dst_host.clone(),
                flow.src_host.clone(),
                flow.total_packets,
            )
        };
        let armed = {
            let Some(Node::Host(host)) = self.nodes.get_mut(&dst_host) else {
                panic!("flow {flow_id} terminates at non-host {dst_host}");
            };
            let Some(rs) = host.recv.get_mut(&flow_id) else {
                return;
            };
            if rs.deadline_generation != generation {
                debug!(
                    "t={:.6} skipping cancelled dup-ack deadline for flow {}",
                    now, flow_id
                );
                return;
            }
            if rs.next_expected >= total {
                return;
            }
            rs.deadline_generation += 1;
            (rs.next_expected, rs.deadline_generation)
        };
        // The expected DATA never came: repeat the last cumulative ACK and
        // chain the next deadline.
        let (ack_seq, next_generation) = armed;
        self.emit_ack(&flow_id, ack_seq, &dst_host, &src_host);
        self.schedule(
            now + self.params.dup_ack_interval,
            Event::DuplicateAckDeadline {
                flow: flow_id,
                generation: next_generation,
            },
        );
    }

    fn handle_router_discovery(&mut self, router_id: String) {
        let now = self.time;
        if self.all_flows_complete() {
            debug!(
                "t={:.6} router {} stops advertising, all flows complete",
                now, router_id
            );
            return;
        }

        // Refresh the table with instantaneous edge costs before
        // advertising it on every incident link.
        self.recompute_router(&router_id);
        let (vector, adjacency) = {
            let Some(Node::Router(router)) = self.nodes.get(&router_id) else {
                panic!("discovery for non-router {router_id}");
            };
            (router.vector(), router.adjacency.clone())
        };
        for link_id in adjacency {
            let neighbor = self.links[&link_id].other_endpoint(&router_id).to_string();
            let pkt = Packet::routing(&router_id, &neighbor, vector.clone());
            self.schedule(
                now,
                Event::SendPacket {
                    pkt,
                    from: router_id.clone(),
                    link: link_id,
                },
            );
        }
        self.schedule(
            now + self.params.t_routing,
            Event::RouterDiscovery { router: router_id },
        );
    }

    fn handle_link_departure(&mut self, link_id: String, from: String) {
        let now = self.time;
        let occupancy = self
            .links
            .get_mut(&link_id)
            .expect("departure on unknown link")
            .on_departure(&from, now);
        self.metrics
            .point(now, Series::BufferOccupancy, &link_id, occupancy);
    }

    // ---- router behavior ---------------------------------------------

    fn router_receive(&mut self, pkt: Packet, at: String) {
        if pkt.kind == PacketKind::Routing {
            let vector = pkt.payload.unwrap_or_default();
            {
                let Some(Node::Router(router)) = self.nodes.get_mut(&at) else {
                    unreachable!();
                };
                router.store_vector(&pkt.src, vector);
            }
            self.recompute_router(&at);
            return;
        }

        let route = {
            let Some(Node::Router(router)) = self.nodes.get(&at) else {
                unreachable!();
            };
            router.route(&pkt.dst).map(|(link, _)| link.clone())
        };
        match route {
            Some(link) => self.schedule(
                self.time,
                Event::SendPacket {
                    pkt,
                    from: at,
                    link,
                },
            ),
            None => {
                self.routing_misses += 1;
                self.metrics.count(self.time, Series::PacketLoss, &at);
                debug!(
                    "t={:.6} router {} has no route to {}, packet discarded",
                    self.time, at, pkt.dst
                );
            }
        }
    }

    fn recompute_router(&mut self, router_id: &str) {
        let edges = self.router_edges(router_id);
        let Some(Node::Router(router)) = self.nodes.get_mut(router_id) else {
            panic!("recompute for non-router {router_id}");
        };
        router.recompute(&edges);
    }

    fn router_edges(&self, router_id: &str) -> Vec<NeighborEdge> {
        let Some(Node::Router(router)) = self.nodes.get(router_id) else {
            panic!("edges of non-router {router_id}");
        };
        let now = self.time;
        router
            .adjacency
            .iter()
            .map(|link_id| {
                let link = &self.links[link_id];
                let neighbor = link.other_endpoint(router_id).to_string();
                let congestion = link.buffered_bytes(router_id, now) as f64 / link.capacity_bps;
                let neighbor_is_host = self
                    .nodes
                    .get(&neighbor)
                    .is_some_and(|n| n.is_host());
                NeighborEdge {
                    link: link_id.clone(),
                    neighbor,
                    cost: link.prop_delay_s + congestion,
                    neighbor_is_host,
                }
            })
            .collect()
    }

    // ---- host behavior -----------------------------------------------

    fn host_receive(&mut self, pkt: Packet, at: String) {
        match pkt.kind {
            PacketKind::Routing => {} // hosts sink routing probes
            PacketKind::Data | PacketKind::Ack if pkt.dst != at => {
                // A stale routing table delivered this to the wrong edge of
                // the network; it is lost like any routing miss.
                self.routing_misses += 1;
                debug!(
                    "t={:.6} host {} received stray packet for {}",
                    self.time, at, pkt.dst
                );
            }
            PacketKind::Data => self.host_receive_data(pkt, at),
            PacketKind::Ack => self.sender_receive_ack(pkt, at),
        }
    }

    fn host_receive_data(&mut self, pkt: Packet, at: String) {
        let now = self.time;
        let flow_id = pkt.flow_id.clone().expect("DATA without flow");
        let (src_host, total) = {
            let flow = self.flows.get(&flow_id).expect("DATA for unknown flow");
            (flow.src_host.clone(), flow.total_packets)
        };

        let (ack_seq, in_order, rearm) = {
            let Some(Node::Host(host)) = self.nodes.get_mut(&at) else {
                unreachable!();
            };
            let rs = host.recv.entry(flow_id.clone()).or_default();
            let in_order = rs.on_data(pkt.seq);
            let mut rearm = None;
            if in_order {
                // Supersede the pending deadline; keep one alive only while
                // data is still owed.
                rs.deadline_generation += 1;
                if rs.next_expected < total {
                    rearm = Some(rs.deadline_generation);
                }
            }
            (rs.next_expected, in_order, rearm)
        };

        if in_order {
            self.metrics
                .add_rate(now, Series::FlowRate, &flow_id, pkt.size_bits);
        }
        self.emit_ack(&flow_id, ack_seq, &at, &src_host);
        if let Some(generation) = rearm {
            self.schedule(
                now + self.params.dup_ack_interval,
                Event::DuplicateAckDeadline {
                    flow: flow_id,
                    generation,
                },
            );
        }
    }

    fn sender_receive_ack(&mut self, pkt: Packet, at: String) {
        let now = self.time;
        let params = self.params;
        let flow_id = pkt.flow_id.clone().expect("ACK without flow");
        let (outcome, srtt, in_recovery) = {
            let flow = self.flows.get_mut(&flow_id).expect("ACK for unknown flow");
            assert_eq!(flow.src_host, at, "ACK delivered to wrong host");
            if flow.completed_at.is_some() {
                // Chained receiver deadlines can echo the final ACK.
                return;
            }
            let outcome = flow.on_ack(pkt.seq, now, &params);
            (outcome, flow.srtt, flow.phase == Phase::FastRecovery)
        };

        match outcome {
            AckOutcome::Advanced { completed } => {
                self.record_window(&flow_id);
                if let Some(srtt) = srtt {
                    self.metrics.point(now, Series::FlowRtt, &flow_id, srtt);
                }
                if completed {
                    self.cancel_timeout(&flow_id);
                    info!("t={:.6} flow {} completed", now, flow_id);
                } else {
                    self.pump_flow(&flow_id);
                    if self.flows[&flow_id].outstanding() {
                        self.arm_timeout(&flow_id);
                    } else {
                        self.cancel_timeout(&flow_id);
                    }
                }
            }
            AckOutcome::FastRetransmit { seq } => {
                debug!(
                    "t={:.6} flow {} fast retransmit of seq {}",
                    now, flow_id, seq
                );
                self.record_window(&flow_id);
                self.retransmit(&flow_id, seq);
                self.pump_flow(&flow_id);
            }
            AckOutcome::Duplicate => {
                if in_recovery {
                    self.record_window(&flow_id);
                    self.pump_flow(&flow_id);
                }
            }
            AckOutcome::Stale => {}
        }
    }

    // ---- flow plumbing -----------------------------------------------

    /// Schedule transmissions for every sequence the window now admits.
    fn pump_flow(&mut self, flow_id: &str) {
        let now = self.time;
        let (src, dst, mss, seqs) = {
            let flow = self.flows.get_mut(flow_id).expect("pump of unknown flow");
            let seqs = flow.admit_sends();
            (flow.src_host.clone(), flow.dst_host.clone(), flow.mss_bits, seqs)
        };
        if seqs.is_empty() {
            return;
        }
        let link = self.host_link(&src).to_string();
        for seq in seqs {
            let pkt = Packet::data(flow_id, seq, mss, &src, &dst);
            self.schedule(
                now,
                Event::SendPacket {
                    pkt,
                    from: src.clone(),
                    link: link.clone(),
                },
            );
        }
    }

    fn retransmit(&mut self, flow_id: &str, seq: u64) {
        let (src, dst, mss) = {
            let flow = self.flows.get(flow_id).expect("retransmit of unknown flow");
            (flow.src_host.clone(), flow.dst_host.clone(), flow.mss_bits)
        };
        let link = self.host_link(&src).to_string();
        let pkt = Packet::data(flow_id, seq, mss, &src, &dst);
        self.schedule(
            self.time,
            Event::SendPacket {
                pkt,
                from: src,
                link,
            },
        );
    }

    fn emit_ack(&mut self, flow_id: &str, ack_seq: u64, host: &str, dst: &str) {
        let link = self.host_link(host).to_string();
        let pkt = Packet::ack(flow_id, ack_seq, host, dst);
        self.schedule(
            self.time,
            Event::SendPacket {
                pkt,
                from: host.to_string(),
                link,
            },
        );
    }

    /// Supersede any live timer with a fresh one at `now + rto`.
    fn arm_timeout(&mut self, flow_id: &str) {
        let now = self.time;
        let (generation, rto) = {
            let flow = self.flows.get_mut(flow_id).expect("arm for unknown flow");
            flow.timeout_generation += 1;
            (flow.timeout_generation, flow.rto)
        };
        self.schedule(
            now + rto,
            Event::Timeout {
                flow: flow_id.to_string(),
                generation,
            },
        );
    }

    fn cancel_timeout(&mut self, flow_id: &str) {
        self.flows
            .get_mut(flow_id)
            .expect("cancel for unknown flow")
            .timeout_generation += 1;
    }

    fn record_window(&mut self, flow_id: &str) {
        let cwnd = self.flows[flow_id].cwnd;
        self.metrics
            .point(self.time, Series::FlowWindow, flow_id, cwnd);
    }

    fn host_link(&self, host: &str) -> &str {
        match self.nodes.get(host) {
            Some(Node::Host(h)) => h.link(),
            _ => panic!("{host} is not a host"),
        }
    }

    fn injected_drop(&mut self, pkt: &Packet, now: f64) -> bool {
        let flow_id = pkt.flow_id.as_deref().unwrap_or_default();
        if let Some(pos) = self
            .drop_data_seq_once
            .iter()
            .position(|(f, s)| f == flow_id && *s == pkt.seq)
        {
            self.drop_data_seq_once.remove(pos);
            return true;
        }
        self.blackholes
            .iter()
            .any(|(f, until)| f == flow_id && now < *until)
    }

    fn all_flows_complete(&self) -> bool {
        !self.flows.is_empty() && self.flows.values().all(|f| f.completed_at.is_some())
    }

    #[cfg(debug_assertions)]
    fn assert_invariants(&self) {
        for flow in self.flows.values() {
            assert!(
                flow.base <= flow.next_seq,
                "flow {}: base {} ahead of next_seq {}",
                flow.id,
                flow.base,
                flow.next_seq
            );
            assert!(flow.next_seq <= flow.total_packets);
            assert!(flow.cwnd >= 1.0, "flow {}: cwnd {} below 1", flow.id, flow.cwnd);
        }
    }
}
