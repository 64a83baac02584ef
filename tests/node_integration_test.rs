// Node controller integration tests: latency, reset, reconfiguration gating and drops

use rank_scheduler::memory::{self, ProgramWrite};
use rank_scheduler::node::TickReport;
use rank_scheduler::queue::SharedPriorityStore;
use rank_scheduler::{
    Discipline, InboundPacket, NodeConfig, NodeController, NodePorts, NodeState, PacketDescriptor,
    Reconfigure, ResetKind, SchedError,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

fn node_with(config: NodeConfig) -> (NodeController, NodePorts) {
    NodeController::new(config).expect("valid config")
}

fn offer(ports: &NodePorts, packet: PacketDescriptor) {
    ports.inbound.send(InboundPacket::new(packet)).unwrap();
}

fn run_until_enqueued(node: &mut NodeController, limit: usize) -> Option<(usize, TickReport)> {
    (1..=limit).find_map(|i| {
        let report = node.tick();
        report.enqueued.map(|_| (i, report))
    })
}

#[test]
fn rank_latency_delays_enqueue() {
    for latency in [0u32, 1, 3] {
        let config = NodeConfig {
            rank_latency_ticks: latency,
            ..NodeConfig::default()
        };
        let (mut node, ports) = node_with(config);
        offer(&ports, PacketDescriptor::new(2, 64));

        let (tick, report) = run_until_enqueued(&mut node, 10).expect("packet enqueued");
        assert_eq!(tick, latency as usize + 1, "latency {latency}");
        assert_eq!(report.forwarded.map(|(p, _)| p.flow_id), Some(2));
        assert!(node.is_quiescent());
    }
}

#[test]
fn no_admission_while_rank_in_flight() {
    let config = NodeConfig {
        rank_latency_ticks: 2,
        ..NodeConfig::default()
    };
    let (mut node, ports) = node_with(config);
    offer(&ports, PacketDescriptor::new(0, 64));
    offer(&ports, PacketDescriptor::new(1, 64));

    let first = node.tick();
    assert_eq!(first.admitted.map(|p| p.flow_id), Some(0));
    assert_eq!(first.state, Some(NodeState::AwaitingRankResult));

    let second = node.tick();
    assert_eq!(second.admitted, None);
    assert_eq!(second.state, Some(NodeState::AwaitingRankResult));

    let third = node.tick();
    assert_eq!(third.enqueued.map(|(p, _)| p.flow_id), Some(0));

    let fourth = node.tick();
    assert_eq!(fourth.admitted.map(|p| p.flow_id), Some(1));
}

#[test]
fn warm_reset_discards_in_flight_computation() {
    let config = NodeConfig {
        rank_latency_ticks: 3,
        ..NodeConfig::default()
    };
    let (mut node, ports) = node_with(config);
    offer(&ports, PacketDescriptor::new(4, 1500));
    node.tick();
    assert!(!node.is_quiescent());
    let before = node.flows().get(4).unwrap();
    let global_before = node.flows().global();

    ports.reset.assert(ResetKind::Warm);
    for _ in 0..5 {
        let report = node.tick();
        assert_eq!(report.state, Some(NodeState::Reset));
        assert_eq!(report.enqueued, None);
    }
    assert!(node.is_quiescent());
    assert_eq!(node.flows().get(4).unwrap(), before);
    assert_eq!(node.flows().global(), global_before);
    assert!(node.store().is_empty());
    assert_eq!(node.metrics().snapshot().aborted, 1);

    ports.reset.release();
    let report = node.tick();
    assert_ne!(report.state, Some(NodeState::Reset));
    assert_eq!(report.enqueued, None);
    assert!(ports.outbound.try_recv().is_err());
}

#[test]
fn warm_reset_keeps_store_and_flow_state() {
    let (mut node, ports) = node_with(NodeConfig::default());
    for flow in 0..2 {
        offer(&ports, PacketDescriptor::new(flow, 64));
    }
    node.tick();
    node.tick();
    let counter = node.flows().get(1).unwrap().service_counter;
    assert!(counter > 0);
    node.store().enqueue(PacketDescriptor::new(7, 64), 99).unwrap();

    node.reset(ResetKind::Warm);
    assert_eq!(node.state(), NodeState::Reset);
    assert_eq!(node.flows().get(1).unwrap().service_counter, counter);
    assert_eq!(node.store().len(), 1);
}

#[test]
fn cold_reset_clears_state_and_reloads_weights() {
    let config = NodeConfig::default().with_weight(3, 512);
    let (mut node, ports) = node_with(config);
    for _ in 0..4 {
        offer(&ports, PacketDescriptor::new(3, 512));
        node.tick();
    }
    assert!(node.flows().get(3).unwrap().service_counter > 0);

    ports.reset.assert(ResetKind::Cold);
    node.tick();
    ports.reset.release();

    let flow = node.flows().get(3).unwrap();
    assert_eq!(flow.service_counter, 0);
    assert_eq!(flow.last_finish_time, 0);
    assert_eq!(flow.weight, 512);
    assert!(node.store().is_empty());
    assert_eq!(node.metrics().snapshot().ticks, 0);
}

#[test]
fn reconfiguration_waits_for_quiescence() {
    let config = NodeConfig {
        rank_latency_ticks: 1,
        ..NodeConfig::default()
    };
    let (mut node, ports) = node_with(config);
    offer(&ports, PacketDescriptor::new(0, 64));
    node.tick();

    let write = ProgramWrite {
        addr: 0x10,
        data: 0xDEAD_BEEF,
    };
    ports.reconfigure.send(Reconfigure::Program(write)).unwrap();
    offer(&ports, PacketDescriptor::new(1, 64));

    // Completion tick: the job was still in flight at the start of the tick.
    let report = node.tick();
    assert_eq!(report.reconfigured, None);
    assert!(report.enqueued.is_some());
    assert_eq!(node.program_memory().word(4), Some(0));

    // Quiescent: the write lands and blocks admission for this tick.
    let report = node.tick();
    assert_eq!(report.reconfigured, Some(Reconfigure::Program(write)));
    assert_eq!(report.admitted, None);
    assert_eq!(node.program_memory().word(4), Some(0xDEAD_BEEF));

    let report = node.tick();
    assert_eq!(report.admitted.map(|p| p.flow_id), Some(1));
}

#[test]
fn weight_and_discipline_reconfiguration() {
    let (mut node, ports) = node_with(NodeConfig::default());
    ports
        .reconfigure
        .send(Reconfigure::SetWeight {
            flow_id: 2,
            weight: 2,
        })
        .unwrap();
    ports
        .reconfigure
        .send(Reconfigure::SetDiscipline(Discipline::WeightedFairQueueing))
        .unwrap();
    node.tick();
    node.tick();
    assert_eq!(node.discipline(), Discipline::WeightedFairQueueing);
    assert_eq!(node.flows().get(2).unwrap().weight, 2);

    let map = *node.register_map();
    assert_eq!(
        memory::MemoryInterface::read_word(node.data_memory(), map.weight_table + 2).unwrap(),
        2
    );

    offer(&ports, PacketDescriptor::new(2, 64));
    let report = node.tick();
    assert_eq!(report.enqueued.map(|(_, rank)| rank), Some(32));
    assert_eq!(node.metrics().snapshot().reconfigurations, 2);
}

#[test]
fn full_store_drops_newest_packet() {
    let config = NodeConfig {
        store_capacity: 2,
        ..NodeConfig::default()
    };
    let (mut node, ports) = node_with(config);
    let backlog = [PacketDescriptor::new(5, 64), PacketDescriptor::new(6, 64)];
    node.store().enqueue(backlog[0], 1).unwrap();
    node.store().enqueue(backlog[1], 0).unwrap();

    let packet = PacketDescriptor::new(0, 64);
    offer(&ports, packet);
    let report = node.tick();

    // Enqueue fails on the full store; the dequeue still runs.
    assert_eq!(report.dropped, Some(packet));
    assert_eq!(report.forwarded, Some((backlog[1], 0)));
    assert_eq!(node.metrics().snapshot().dropped_full, 1);
    assert_eq!(node.store().len(), 1);
    assert_eq!(ports.outbound.try_recv().unwrap(), backlog[1]);
}

#[test]
fn full_egress_port_drops_forwarded_packet() {
    let config = NodeConfig {
        egress_capacity: 1,
        ..NodeConfig::default()
    };
    let (mut node, ports) = node_with(config);
    offer(&ports, PacketDescriptor::new(0, 64));
    offer(&ports, PacketDescriptor::new(1, 64));
    node.tick();
    let report = node.tick();

    assert!(report.enqueued.is_some());
    assert_eq!(report.forwarded, None);
    assert_eq!(node.metrics().snapshot().dropped_egress, 1);
    assert_eq!(ports.outbound.len(), 1);
}

#[test]
fn rejected_packets_leave_no_trace() {
    let config = NodeConfig {
        enforce_min_length: true,
        ..NodeConfig::default()
    };
    let (mut node, ports) = node_with(config);
    offer(&ports, PacketDescriptor::new(0, 0));
    offer(&ports, PacketDescriptor::new(0, 32));
    offer(&ports, PacketDescriptor::new(200, 64));
    ports
        .inbound
        .send(InboundPacket::new(PacketDescriptor::new(0, 64)).with_tag(3))
        .unwrap();

    let rejected: Vec<Option<SchedError>> = (0..4).map(|_| node.tick().rejected).collect();
    assert!(rejected.iter().all(Option::is_some));
    assert!(matches!(rejected[2], Some(SchedError::Configuration(_))));

    let snapshot = node.metrics().snapshot();
    assert_eq!(snapshot.rejected(), 4);
    assert_eq!(snapshot.enqueued, 0);
    assert_eq!(node.flows().get(0).unwrap().service_counter, 0);
    assert!(node.is_quiescent());
}

#[test]
fn per_packet_tags_select_discipline() {
    let (mut node, ports) = node_with(NodeConfig::default());
    let packet = PacketDescriptor::new(1, 64).with_priority(6);
    ports
        .inbound
        .send(InboundPacket::new(packet).with_discipline(Discipline::StrictPriority))
        .unwrap();
    let report = node.tick();
    assert_eq!(report.enqueued, Some((packet, 6)));
    assert_eq!(node.flows().get(1).unwrap().service_counter, 0);
    let ranked = node.metrics().snapshot().ranked;
    assert_eq!(ranked[&Discipline::StrictPriority], 1);
    assert_eq!(ranked[&Discipline::DeficitRoundRobin], 0);
}

#[test]
fn large_flow_tables_relocate_registers() {
    let config = NodeConfig {
        flows: 64,
        ..NodeConfig::default()
    };
    let (mut node, ports) = node_with(config);
    let map = *node.register_map();
    assert!(map.fits(64));

    offer(&ports, PacketDescriptor::new(63, 128));
    let report = node.tick();
    assert!(report.enqueued.is_some());
    let counter = memory::MemoryInterface::read_word(
        node.data_memory(),
        map.service_counter_table + 63,
    )
    .unwrap();
    assert_eq!(u64::from(counter), node.flows().get(63).unwrap().service_counter);
}

#[test]
fn small_flow_count_uses_default_weights() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.toml");
    std::fs::write(&path, "flows = 4\ndiscipline = \"wfq\"\n").unwrap();

    let (mut node, ports) = node_with(NodeConfig::from_file(&path).unwrap());
    assert_eq!(node.flows().len(), 4);
    assert!(node.flows().flows().iter().all(|flow| flow.weight == 128));

    offer(&ports, PacketDescriptor::new(3, 256));
    let report = node.tick();
    assert_eq!(report.enqueued.map(|(_, rank)| rank), Some(2));
}

#[test]
fn shared_store_delivers_each_entry_once() {
    let store = Arc::new(SharedPriorityStore::new(4096));
    let producers: Vec<_> = (0..4u16)
        .map(|producer| {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..500u16 {
                    let packet = PacketDescriptor::new(producer, 64).with_payload_ptr(u32::from(i));
                    store.enqueue(packet, u64::from(i % 17)).unwrap();
                }
            })
        })
        .collect();
    for handle in producers {
        handle.join().unwrap();
    }

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let Ok(packet) = store.dequeue_min() {
                    seen.push((packet.flow_id, packet.payload_ptr));
                }
                seen
            })
        })
        .collect();

    let mut all = HashSet::new();
    let mut total = 0;
    for handle in consumers {
        for entry in handle.join().unwrap() {
            total += 1;
            assert!(all.insert(entry), "entry {entry:?} delivered twice");
        }
    }
    assert_eq!(total, 2000);
    assert!(store.is_empty());
}

#[test]
fn config_file_round_trip() {
    let config = NodeConfig {
        flows: 4,
        default_weight: 0,
        discipline: Discipline::WeightedFairQueueing,
        rank_latency_ticks: 2,
        ..NodeConfig::default()
    }
    .with_weight(1, 3);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.toml");
    std::fs::write(&path, config.to_toml().unwrap()).unwrap();

    let loaded = NodeConfig::from_file(&path).unwrap();
    assert_eq!(loaded, config);
    let (node, _ports) = node_with(loaded);
    assert_eq!(node.flows().get(1).unwrap().weight, 3);
    assert_eq!(node.flows().get(0).unwrap().weight, 0);
}
