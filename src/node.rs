//! Node controller.
//!
//! Drives one scheduling tick at a time. Within a tick the controller:
//! 1. Honours the reset line (asserted: abort and stay in `Reset`; released: back to `Idle`)
//! 2. Applies at most one pending reconfiguration, only while no rank computation is in flight
//! 3. Otherwise admits at most one inbound packet (non-blocking), validates it, publishes its
//!    metadata to data memory and starts a rank computation
//! 4. Delivers the completion of the in-flight computation once its latency has elapsed
//! 5. Consumes that completion exactly once: commits the staged flow-state updates, publishes
//!    the rank, reads it back and enqueues `{packet, rank}` into the priority store
//! 6. Issues one dequeue request and forwards the dequeued packet to the outbound port
//!
//! Enqueue and dequeue are decoupled: a dequeue is attempted every tick whatever happened to
//! the enqueue. A full store drops the packet; an empty store is an idle dequeue.
//!
//! The completion is a one-shot channel: the rank job owns the only sender and is consumed when
//! it fires, the controller owns the only receiver and drops it after the first receive.

use crate::config::{ConfigError, NodeConfig, ParentCoord};
use crate::discipline::Discipline;
use crate::error::{ConfigurationError, SchedError};
use crate::flow_state::{FlowStateStore, GlobalSchedulerState};
use crate::memory::{self, DataMemory, ProgramMemory, ProgramWrite, RegisterMap};
use crate::metrics::{bump, MetricsSnapshot, NodeMetrics};
use crate::packet::PacketDescriptor;
use crate::queue::{DequeueRequest, DequeueResponse, EnqueueRequest, SharedPriorityStore};
use crate::scheduler::{RankEngine, RankOutcome};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Controller state. Every tick starts from `Idle` unless a computation is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Reset,
    Idle,
    AwaitingRankResult,
    Enqueuing,
    AwaitingDequeue,
    Forwarding,
}

/// Warm resets keep flow/global state and the store; cold resets clear everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Warm,
    Cold,
}

/// Packet offered on the inbound port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundPacket {
    pub packet: PacketDescriptor,
    /// Per-packet discipline tag; `None` uses the node's configured discipline.
    pub discipline_tag: Option<u8>,
}

impl InboundPacket {
    pub fn new(packet: PacketDescriptor) -> Self {
        InboundPacket {
            packet,
            discipline_tag: None,
        }
    }

    pub fn with_discipline(mut self, discipline: Discipline) -> Self {
        self.discipline_tag = Some(discipline.tag());
        self
    }

    /// Raw tag, validated at admission.
    pub fn with_tag(mut self, tag: u8) -> Self {
        self.discipline_tag = Some(tag);
        self
    }
}

/// Runtime reconfiguration, applied only at quiescent points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconfigure {
    SetWeight { flow_id: u16, weight: u32 },
    SetDiscipline(Discipline),
    Program(ProgramWrite),
}

/// Reset signal shared with whoever owns the node's reset.
#[derive(Debug, Default)]
pub struct ResetLine {
    asserted: AtomicBool,
    cold: AtomicBool,
}

impl ResetLine {
    pub fn assert(&self, kind: ResetKind) {
        self.cold.store(kind == ResetKind::Cold, Ordering::SeqCst);
        self.asserted.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.asserted.store(false, Ordering::SeqCst);
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted.load(Ordering::SeqCst)
    }

    fn kind(&self) -> ResetKind {
        if self.cold.load(Ordering::SeqCst) {
            ResetKind::Cold
        } else {
            ResetKind::Warm
        }
    }
}

/// External ends of the node's ports.
#[derive(Debug, Clone)]
pub struct NodePorts {
    pub inbound: Sender<InboundPacket>,
    pub outbound: Receiver<PacketDescriptor>,
    pub reconfigure: Sender<Reconfigure>,
    pub reset: Arc<ResetLine>,
}

/// What happened during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub admitted: Option<PacketDescriptor>,
    pub rejected: Option<SchedError>,
    pub reconfigured: Option<Reconfigure>,
    pub enqueued: Option<(PacketDescriptor, u64)>,
    /// Packet dropped by a full priority store.
    pub dropped: Option<PacketDescriptor>,
    pub forwarded: Option<(PacketDescriptor, u64)>,
    pub state: Option<NodeState>,
}

/// Serialisable view of the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatsSnapshot {
    pub state: NodeState,
    pub discipline: Discipline,
    pub parent: Option<ParentCoord>,
    pub store_len: usize,
    pub store_capacity: usize,
    pub global: GlobalSchedulerState,
    pub metrics: MetricsSnapshot,
}

/// Producer side of an in-flight computation.
struct RankJob {
    outcome: RankOutcome,
    packet: PacketDescriptor,
    remaining: u32,
    completion: Sender<(PacketDescriptor, RankOutcome)>,
}

impl RankJob {
    /// Fire the completion. Consumes the job so it can only fire once.
    fn complete(self) {
        let _ = self.completion.try_send((self.packet, self.outcome));
    }
}

/// Scheduling node: flow state, rank engine, priority store and memories behind one tick loop.
pub struct NodeController {
    config: NodeConfig,
    state: NodeState,
    discipline: Discipline,
    parent: Option<ParentCoord>,
    engine: RankEngine,
    flows: FlowStateStore,
    store: Arc<SharedPriorityStore>,
    map: RegisterMap,
    dmem: DataMemory,
    imem: ProgramMemory,
    job: Option<RankJob>,
    ticket: Option<Receiver<(PacketDescriptor, RankOutcome)>>,
    inbound: Receiver<InboundPacket>,
    outbound: Sender<PacketDescriptor>,
    reconfigure: Receiver<Reconfigure>,
    reset_line: Arc<ResetLine>,
    metrics: Arc<NodeMetrics>,
    tick: u64,
}

impl NodeController {
    /// Build a node from `config`. The node starts in `Reset`; the first tick with the reset
    /// line released moves it to `Idle`.
    pub fn new(config: NodeConfig) -> Result<(Self, NodePorts), ConfigError> {
        config.validate()?;

        let (inbound_tx, inbound_rx) = bounded(config.ingress_capacity);
        let (outbound_tx, outbound_rx) = bounded(config.egress_capacity);
        let (reconfigure_tx, reconfigure_rx) = bounded(config.ingress_capacity);
        let reset_line = Arc::new(ResetLine::default());

        let map = RegisterMap::for_flows(config.flows);
        let mut node = NodeController {
            state: NodeState::Reset,
            discipline: config.discipline,
            parent: config.parent,
            engine: RankEngine::new(config.overflow),
            flows: FlowStateStore::new(config.flows, config.min_packet_size),
            store: Arc::new(SharedPriorityStore::new(config.store_capacity)),
            map,
            dmem: DataMemory::new(map.required_words(config.flows)),
            imem: ProgramMemory::new(config.program_words),
            job: None,
            ticket: None,
            inbound: inbound_rx,
            outbound: outbound_tx,
            reconfigure: reconfigure_rx,
            reset_line: reset_line.clone(),
            metrics: Arc::new(NodeMetrics::default()),
            tick: 0,
            config,
        };
        node.load_weights().map_err(|e| ConfigError::Invalid(e.to_string()))?;

        info!(
            flows = node.config.flows,
            capacity = node.config.store_capacity,
            discipline = %node.discipline,
            "scheduling node created"
        );

        let ports = NodePorts {
            inbound: inbound_tx,
            outbound: outbound_rx,
            reconfigure: reconfigure_tx,
            reset: reset_line,
        };
        Ok((node, ports))
    }

    fn load_weights(&mut self) -> Result<(), SchedError> {
        for entry in self.config.flow_weights() {
            self.flows.set_weight(entry.flow_id, entry.weight)?;
        }
        memory::mirror_all(&mut self.dmem, &self.map, &self.flows)
            .map_err(|e| ConfigurationError::Invalid(e.to_string()))?;
        Ok(())
    }

    /// No rank computation in flight.
    pub fn is_quiescent(&self) -> bool {
        self.job.is_none() && self.ticket.is_none()
    }

    /// Abort any in-flight computation and enter `Reset`. Staged flow-state updates of the
    /// aborted computation are discarded.
    pub fn reset(&mut self, kind: ResetKind) {
        let aborted = !self.is_quiescent();
        self.job = None;
        self.ticket = None;
        self.state = NodeState::Reset;

        if kind == ResetKind::Cold {
            self.flows.clear();
            self.store.clear();
            self.dmem.clear();
            self.discipline = self.config.discipline;
            self.metrics.reset();
            if let Err(err) = self.load_weights() {
                warn!(error = %err, "failed to reload weights after cold reset");
            }
        }
        // Counted after a cold reset has zeroed the metrics.
        if aborted {
            bump(&self.metrics.aborted);
        }
        info!(?kind, aborted, "node reset");
    }

    /// Run one tick.
    ///
    /// Checks the reset line first: while it is asserted the node aborts any in-flight
    /// computation and does nothing else. Otherwise the tick applies one reconfiguration or
    /// admits one inbound packet (only when quiescent), advances and consumes the rank
    /// completion, then issues exactly one dequeue. A packet enqueued during the tick is
    /// already visible to that tick's dequeue.
    ///
    /// # Returns
    /// A [`TickReport`] listing what was admitted, rejected, reconfigured, enqueued, dropped
    /// and forwarded, plus the state the controller ended the tick in
    ///
    /// # Example
    /// ```
    /// use rank_scheduler::{InboundPacket, NodeConfig, NodeController, PacketDescriptor};
    ///
    /// let (mut node, ports) = NodeController::new(NodeConfig::default()).unwrap();
    /// let packet = PacketDescriptor::new(1, 64);
    /// ports.inbound.send(InboundPacket::new(packet)).unwrap();
    ///
    /// let report = node.tick();
    /// assert_eq!(report.forwarded, Some((packet, 1)));
    /// ```
    pub fn tick(&mut self) -> TickReport {
        if self.reset_line.is_asserted() {
            if self.state != NodeState::Reset || !self.is_quiescent() {
                self.reset(self.reset_line.kind());
            }
            return TickReport {
                tick: self.tick,
                state: Some(NodeState::Reset),
                ..TickReport::default()
            };
        }

        self.tick += 1;
        bump(&self.metrics.ticks);
        let mut report = TickReport {
            tick: self.tick,
            ..TickReport::default()
        };

        self.state = if self.is_quiescent() {
            NodeState::Idle
        } else {
            NodeState::AwaitingRankResult
        };

        if self.is_quiescent() {
            if let Some(command) = self.next_reconfiguration() {
                self.apply_reconfiguration(command);
                report.reconfigured = Some(command);
            } else {
                self.admit(&mut report);
            }
        }

        self.advance_job();
        self.consume_completion(&mut report);
        self.dequeue(&mut report);

        if !self.is_quiescent() {
            self.state = NodeState::AwaitingRankResult;
        }
        report.state = Some(self.state);
        report
    }

    fn next_reconfiguration(&self) -> Option<Reconfigure> {
        self.reconfigure.try_recv().ok()
    }

    fn apply_reconfiguration(&mut self, command: Reconfigure) {
        match command {
            Reconfigure::SetWeight { flow_id, weight } => {
                match self.flows.set_weight(flow_id, weight) {
                    Ok(()) => {
                        if let Err(err) =
                            memory::mirror_flow(&mut self.dmem, &self.map, &self.flows, flow_id)
                        {
                            warn!(flow_id, error = %err, "flow table mirror failed");
                        }
                        bump(&self.metrics.reconfigurations);
                        info!(flow_id, weight, "flow weight updated");
                    }
                    Err(err) => warn!(error = %err, "rejected weight update"),
                }
            }
            Reconfigure::SetDiscipline(discipline) => {
                self.discipline = discipline;
                bump(&self.metrics.reconfigurations);
                info!(%discipline, "default discipline updated");
            }
            Reconfigure::Program(write) => {
                if self.imem.apply(write) {
                    bump(&self.metrics.program_writes);
                    debug!(addr = write.addr, data = write.data, "program memory written");
                } else {
                    warn!(
                        addr = write.addr,
                        words = self.imem.words(),
                        "program write outside program memory ignored"
                    );
                }
            }
        }
    }

    fn reject(&self, report: &mut TickReport, err: SchedError) {
        match &err {
            SchedError::MalformedInput(_) => bump(&self.metrics.rejected_malformed),
            SchedError::CounterOverflow { .. } => bump(&self.metrics.rejected_overflow),
            _ => bump(&self.metrics.rejected_configuration),
        }
        warn!(error = %err, "packet rejected");
        report.rejected = Some(err);
    }

    fn admit(&mut self, report: &mut TickReport) {
        let inbound = match self.inbound.try_recv() {
            Ok(inbound) => inbound,
            Err(_) => return,
        };
        bump(&self.metrics.admitted);
        report.admitted = Some(inbound.packet);

        let discipline = match inbound.discipline_tag.map(Discipline::from_tag) {
            None => self.discipline,
            Some(Ok(discipline)) => discipline,
            Some(Err(err)) => return self.reject(report, err.into()),
        };
        let floor = self.config.enforce_min_length.then_some(self.config.min_packet_size);
        if let Err(err) = inbound.packet.validate(floor) {
            return self.reject(report, err.into());
        }
        if let Err(err) = self.engine.validate(discipline, &inbound.packet, &self.flows) {
            return self.reject(report, err.into());
        }

        // Hand the packet to the rank engine through data memory.
        let packet = match memory::publish_metadata(&mut self.dmem, &self.map, &inbound.packet)
            .and_then(|()| memory::read_metadata(&self.dmem, &self.map))
        {
            Ok(packet) => packet,
            Err(err) => {
                return self.reject(report, ConfigurationError::Invalid(err.to_string()).into())
            }
        };

        let outcome = match self.engine.compute(discipline, &packet, &self.flows) {
            Ok(outcome) => outcome,
            Err(err) => return self.reject(report, err),
        };

        debug!(
            tick = self.tick,
            flow_id = packet.flow_id,
            %discipline,
            "rank computation started"
        );
        let (completion, ticket) = bounded(1);
        self.job = Some(RankJob {
            outcome,
            packet,
            remaining: self.config.rank_latency_ticks,
            completion,
        });
        self.ticket = Some(ticket);
        self.state = NodeState::AwaitingRankResult;
    }

    fn advance_job(&mut self) {
        match self.job.take() {
            Some(job) if job.remaining == 0 => job.complete(),
            Some(mut job) => {
                job.remaining -= 1;
                self.job = Some(job);
            }
            None => {}
        }
    }

    fn consume_completion(&mut self, report: &mut TickReport) {
        let Some(ticket) = self.ticket.as_ref() else {
            return;
        };
        let (packet, outcome) = match ticket.try_recv() {
            Ok(completion) => completion,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => {
                self.ticket = None;
                return;
            }
        };
        self.ticket = None;
        self.state = NodeState::Enqueuing;

        if let Err(err) = outcome.commit(&mut self.flows) {
            return self.reject(report, err.into());
        }
        self.metrics.record_ranked(outcome.discipline);

        let published = memory::mirror_flow(&mut self.dmem, &self.map, &self.flows, outcome.flow_id)
            .and_then(|()| {
                memory::publish_rank(&mut self.dmem, &self.map, outcome.rank, outcome.virtual_round_id)
            })
            .and_then(|()| memory::read_rank(&self.dmem, &self.map));
        let rank = match published {
            Ok(rank) => rank,
            Err(err) => {
                warn!(error = %err, "rank publication failed, using computed rank");
                outcome.rank
            }
        };

        let request = EnqueueRequest {
            metadata: packet,
            rank,
        };
        match self.store.handle_enqueue(request) {
            Ok(()) => {
                bump(&self.metrics.enqueued);
                debug!(flow_id = packet.flow_id, rank, "enqueued");
                report.enqueued = Some((packet, rank));
            }
            Err(full) => {
                bump(&self.metrics.dropped_full);
                warn!(flow_id = packet.flow_id, rank, capacity = full.capacity, "store full, packet dropped");
                report.dropped = Some(packet);
            }
        }
    }

    fn dequeue(&mut self, report: &mut TickReport) {
        if self.state != NodeState::AwaitingRankResult {
            self.state = NodeState::AwaitingDequeue;
        }
        match self.store.handle_dequeue(DequeueRequest::default()) {
            DequeueResponse::Packet { metadata, rank } => {
                if self.state != NodeState::AwaitingRankResult {
                    self.state = NodeState::Forwarding;
                }
                match self.outbound.try_send(metadata) {
                    Ok(()) => {
                        bump(&self.metrics.forwarded);
                        report.forwarded = Some((metadata, rank));
                    }
                    Err(TrySendError::Full(packet)) | Err(TrySendError::Disconnected(packet)) => {
                        bump(&self.metrics.dropped_egress);
                        warn!(flow_id = packet.flow_id, rank, "outbound port unavailable, packet dropped");
                    }
                }
            }
            DequeueResponse::Empty => bump(&self.metrics.empty_dequeues),
        }
    }

    /// Update a flow weight directly.
    ///
    /// Only allowed while no computation is in flight; the queued path is
    /// [`Reconfigure::SetWeight`] on the reconfiguration port.
    ///
    /// # Arguments
    /// * `flow_id` - Flow to update, must be below the configured flow count
    /// * `weight` - New weight/quantum; 0 marks the flow inactive
    ///
    /// # Returns
    /// `Ok(())` once the flow table and its data-memory mirror are updated, or a
    /// `ConfigurationError` when the node is busy, the flow is unknown or the mirror write fails
    pub fn set_weight(&mut self, flow_id: u16, weight: u32) -> Result<(), ConfigurationError> {
        if !self.is_quiescent() {
            return Err(ConfigurationError::Invalid(format!(
                "flow {flow_id} reconfigured while a rank computation is in flight"
            )));
        }
        self.flows.set_weight(flow_id, weight)?;
        memory::mirror_flow(&mut self.dmem, &self.map, &self.flows, flow_id)
            .map_err(|err| ConfigurationError::Invalid(err.to_string()))
    }

    /// Record the parent node's coordinates (4 bits each).
    pub fn set_parent(&mut self, x: u8, y: u8) -> Result<(), ConfigurationError> {
        if x > 0xF || y > 0xF {
            return Err(ConfigurationError::Invalid(format!(
                "parent coordinates ({x}, {y}) exceed 4 bits"
            )));
        }
        self.parent = Some(ParentCoord { x, y });
        Ok(())
    }

    pub fn parent(&self) -> Option<ParentCoord> {
        self.parent
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    pub fn flows(&self) -> &FlowStateStore {
        &self.flows
    }

    pub fn store(&self) -> &Arc<SharedPriorityStore> {
        &self.store
    }

    pub fn data_memory(&self) -> &DataMemory {
        &self.dmem
    }

    pub fn program_memory(&self) -> &ProgramMemory {
        &self.imem
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn metrics(&self) -> &Arc<NodeMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Emit a window of data memory at debug level.
    pub fn dump_memory(&self, range: Range<usize>) {
        self.dmem.dump(range);
    }

    pub fn snapshot(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            state: self.state,
            discipline: self.discipline,
            parent: self.parent,
            store_len: self.store.len(),
            store_capacity: self.store.capacity(),
            global: self.flows.global(),
            metrics: self.metrics.snapshot(),
        }
    }
}
