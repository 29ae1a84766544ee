use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use canmaster_client::{Core, Device, MasterConfig};
use canmaster_common::messages::{
    CanId, CanMessage, NmtCommandSpecifier, NmtState,
};
use canmaster_common::traits::CanSender;
use canmaster_common::NodeId;
use integration_tests::sim_bus::SimBus;
use serial_test::serial;

fn liveness_config() -> MasterConfig {
    MasterConfig {
        alive_check_interval: Duration::from_millis(100),
        dead_check_count: 3,
        ..Default::default()
    }
}

#[test]
#[serial]
fn nmt_command_wire_format() {
    let bus = SimBus::new();
    let (sender, receiver) = bus.endpoint();
    let (_tx, mut observer) = bus.endpoint();
    let core = Core::new(sender, receiver, MasterConfig::default());

    core.nmt()
        .send_nmt_message(5, NmtCommandSpecifier::StartNode)
        .unwrap();
    core.nmt()
        .broadcast_nmt_message(NmtCommandSpecifier::EnterPreOperational)
        .unwrap();
    core.nmt().reset_all_nodes().unwrap();

    let frames = observer.collect_for(Duration::from_millis(100));
    let payloads: Vec<_> = frames
        .iter()
        .filter(|f| f.id() == CanId::std(0x000))
        .map(|f| f.data().to_vec())
        .collect();
    assert_eq!(
        vec![vec![0x01, 0x05], vec![0x80, 0x00], vec![0x81, 0x00]],
        payloads
    );
}

#[test]
#[serial]
fn heartbeat_liveness_transitions() {
    let bus = SimBus::new();
    let (sender, receiver) = bus.endpoint();
    let core = Core::new(sender, receiver, liveness_config());

    let alive_events = Arc::new(Mutex::new(Vec::new()));
    let dead_events = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();

    {
        let alive_events = alive_events.clone();
        core.nmt().register_device_alive_callback(Arc::new(move |node_id| {
            alive_events.lock().unwrap().push((node_id, started.elapsed()));
        }));
        let dead_events = dead_events.clone();
        core.nmt().register_device_dead_callback(Arc::new(move |node_id| {
            dead_events.lock().unwrap().push((node_id, started.elapsed()));
        }));
    }

    let (mut injector, _rx) = bus.endpoint();
    // Heartbeats at t = 0, 100, 200 ms, then silence
    for _ in 0..3 {
        injector
            .send(CanMessage::new(CanId::std(0x701), &[0x05]))
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
    }

    // Alive fires once, promptly, for node 1
    std::thread::sleep(Duration::from_millis(50));
    {
        let alive = alive_events.lock().unwrap();
        assert_eq!(1, alive.len());
        assert_eq!(1, alive[0].0);
    }
    // Not yet dead shortly after the last heartbeat
    assert!(dead_events.lock().unwrap().is_empty());

    // Dead fires exactly once within a few check intervals of the deadline
    let deadline = Instant::now() + Duration::from_secs(2);
    while dead_events.lock().unwrap().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    std::thread::sleep(Duration::from_millis(300));
    {
        let dead = dead_events.lock().unwrap();
        assert_eq!(1, dead.len());
        assert_eq!(1, dead[0].0);
        // The dead deadline is 3 intervals after the last heartbeat at ~200ms
        assert!(dead[0].1 >= Duration::from_millis(400));
    }
    // Alive did not fire again
    assert_eq!(1, alive_events.lock().unwrap().len());
}

#[test]
#[serial]
fn node_returning_after_death_is_alive_again() {
    let bus = SimBus::new();
    let (sender, receiver) = bus.endpoint();
    let core = Core::new(sender, receiver, liveness_config());

    let alive_count = Arc::new(AtomicUsize::new(0));
    {
        let alive_count = alive_count.clone();
        core.nmt().register_device_alive_callback(Arc::new(move |_| {
            alive_count.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let (mut injector, _rx) = bus.endpoint();
    injector
        .send(CanMessage::new(CanId::std(0x702), &[0x7F]))
        .unwrap();

    // Wait until the node dies
    let deadline = Instant::now() + Duration::from_secs(2);
    while core.nmt().device_state(2) != Some(canmaster_client::DeviceState::Dead)
        && Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(
        Some(canmaster_client::DeviceState::Dead),
        core.nmt().device_state(2)
    );

    injector
        .send(CanMessage::new(CanId::std(0x702), &[0x05]))
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(1);
    while alive_count.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(2, alive_count.load(Ordering::SeqCst));
}

#[test]
#[serial]
fn heartbeat_producer_emits_until_stopped() {
    let bus = SimBus::new();
    let (sender, receiver) = bus.endpoint();
    let (_tx, mut observer) = bus.endpoint();
    let core = Core::new(sender, receiver, MasterConfig::default());
    let device = Device::new(&core, NodeId::new(1).unwrap());

    device.start_heartbeat(1, Duration::from_millis(50), false, NmtState::Operational);

    let frames = observer.collect_for(Duration::from_millis(180));
    let heartbeats: Vec<_> = frames
        .iter()
        .filter(|f| f.id() == CanId::std(0x701))
        .collect();
    assert!(heartbeats.len() >= 2, "got {} heartbeats", heartbeats.len());
    for hb in heartbeats {
        assert_eq!(&[0x05], hb.data());
        assert!(!hb.is_rtr());
    }

    device.stop_heartbeat();
    observer.flush();
    let frames = observer.collect_for(Duration::from_millis(120));
    assert!(frames.iter().all(|f| f.id() != CanId::std(0x701)));
}

#[test]
#[serial]
fn discover_nodes_polls_every_heartbeat_id() {
    let bus = SimBus::new();
    let (sender, receiver) = bus.endpoint();
    let (_tx, mut observer) = bus.endpoint();
    let core = Core::new(sender, receiver, MasterConfig::default());

    core.nmt().discover_nodes().unwrap();

    let frames = observer.collect_for(Duration::from_millis(200));
    let polls: Vec<_> = frames.iter().filter(|f| f.is_rtr()).collect();
    assert_eq!(127, polls.len());
    assert_eq!(CanId::std(0x701), polls[0].id());
    assert_eq!(CanId::std(0x77F), polls[126].id());
}
