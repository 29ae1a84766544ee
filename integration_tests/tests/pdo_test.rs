use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use canmaster_client::{
    AccessType, Core, Device, Mapping, MasterConfig, ReadAccessMethod, TransmissionType,
    WriteAccessMethod,
};
use canmaster_common::messages::{CanId, CanMessage, SyncObject};
use canmaster_common::traits::{CanReceiver, CanSender};
use canmaster_common::{DataType, NodeId, Value};
use integration_tests::sim_bus::SimBus;
use serial_test::serial;

const SLAVE_NODE_ID: u8 = 1;

fn setup() -> (SimBus, Core, Device) {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus = SimBus::new();
    let (sender, receiver) = bus.endpoint();
    let core = Core::new(sender, receiver, MasterConfig::default());
    let device = Device::new(&core, NodeId::new(SLAVE_NODE_ID).unwrap());
    (bus, core, device)
}

fn motion_dictionary(device: &Device) {
    device
        .add_entry(
            0x606C,
            0,
            "Velocity Actual Value",
            DataType::Int32,
            AccessType::ReadOnly,
        )
        .unwrap();
    device
        .add_entry(0x6041, 0, "Statusword", DataType::UInt16, AccessType::ReadOnly)
        .unwrap();
    device
        .add_entry(
            0x60FF,
            0,
            "Target Velocity",
            DataType::Int32,
            AccessType::ReadWrite,
        )
        .unwrap();
    device
        .add_entry(0x6040, 0, "Controlword", DataType::UInt16, AccessType::ReadWrite)
        .unwrap();
}

/// Wait until the condition holds, or panic after a second
fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while std::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached within 1s");
}

#[test]
#[serial]
fn receive_pdo_demultiplexes_into_entries() {
    let (bus, _core, device) = setup();
    motion_dictionary(&device);

    device
        .add_receive_pdo_mapping(0x181, "velocity_actual_value", 0)
        .unwrap();
    device
        .add_receive_pdo_mapping(0x181, "statusword", 4)
        .unwrap();

    let (mut injector, _rx) = bus.endpoint();
    injector
        .send(CanMessage::new(
            CanId::std(0x181),
            &[0xE8, 0x03, 0x00, 0x00, 0x37, 0x02, 0x00, 0x00],
        ))
        .unwrap();

    wait_for(|| {
        device
            .get_entry("velocity_actual_value", ReadAccessMethod::Cache)
            .unwrap()
            .as_i32()
            == Ok(1000)
    });
    assert_eq!(
        0x0237,
        device
            .get_entry("statusword", ReadAccessMethod::Cache)
            .unwrap()
            .as_u16()
            .unwrap()
    );
}

#[test]
#[serial]
fn short_pdo_frame_is_ignored() {
    let (bus, _core, device) = setup();
    motion_dictionary(&device);
    device
        .add_receive_pdo_mapping(0x181, "statusword", 4)
        .unwrap();

    device
        .set_entry("statusword", Value::from(0x1111u16), WriteAccessMethod::Pdo)
        .unwrap();

    let (mut injector, _rx) = bus.endpoint();
    // Only 3 bytes; the mapping needs offset 4 + 2
    injector
        .send(CanMessage::new(CanId::std(0x181), &[1, 2, 3]))
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(
        0x1111,
        device
            .get_entry("statusword", ReadAccessMethod::Cache)
            .unwrap()
            .as_u16()
            .unwrap()
    );
}

#[test]
#[serial]
fn periodic_transmit_emits_frames() {
    let (bus, _core, device) = setup();
    motion_dictionary(&device);

    device
        .set_entry("target_velocity", Value::from(500i32), WriteAccessMethod::Pdo)
        .unwrap();
    device
        .set_entry("controlword", Value::from(0x000Fu16), WriteAccessMethod::Pdo)
        .unwrap();

    let (_tx, mut observer) = bus.endpoint();
    device
        .add_transmit_pdo_mapping(
            0x201,
            vec![
                Mapping {
                    entry_name: "target_velocity".into(),
                    offset: 0,
                },
                Mapping {
                    entry_name: "controlword".into(),
                    offset: 4,
                },
            ],
            TransmissionType::Periodic,
            Duration::from_millis(50),
        )
        .unwrap();

    let frames = observer.collect_for(Duration::from_millis(230));
    let pdo_frames: Vec<_> = frames
        .iter()
        .filter(|f| f.id() == CanId::std(0x201))
        .collect();
    assert!(
        pdo_frames.len() >= 3,
        "expected >= 3 periodic frames, got {}",
        pdo_frames.len()
    );
    for frame in pdo_frames {
        assert_eq!(&[0xF4, 0x01, 0x00, 0x00, 0x0F, 0x00], frame.data());
    }

    // Dropping the device stops the transmitter
    drop(device);
    observer.flush();
    let frames = observer.collect_for(Duration::from_millis(120));
    assert!(frames.iter().all(|f| f.id() != CanId::std(0x201)));
}

#[test]
#[serial]
fn on_change_transmit_fires_once_per_change() {
    let (bus, _core, device) = setup();
    motion_dictionary(&device);

    let (_tx, mut observer) = bus.endpoint();
    device
        .add_transmit_pdo_mapping(
            0x201,
            vec![Mapping {
                entry_name: "controlword".into(),
                offset: 0,
            }],
            TransmissionType::OnChange,
            Duration::ZERO,
        )
        .unwrap();

    device
        .set_entry("controlword", Value::from(0x0006u16), WriteAccessMethod::Pdo)
        .unwrap();
    // Same value again: no change, no frame
    device
        .set_entry("controlword", Value::from(0x0006u16), WriteAccessMethod::Pdo)
        .unwrap();
    device
        .set_entry("controlword", Value::from(0x000Fu16), WriteAccessMethod::Pdo)
        .unwrap();

    let frames = observer.collect_for(Duration::from_millis(100));
    let payloads: Vec<_> = frames
        .iter()
        .filter(|f| f.id() == CanId::std(0x201))
        .map(|f| f.data().to_vec())
        .collect();
    assert_eq!(vec![vec![0x06, 0x00], vec![0x0F, 0x00]], payloads);
}

#[test]
#[serial]
fn sync_transmit_emits_on_sync_frame() {
    let (bus, _core, device) = setup();
    motion_dictionary(&device);
    device
        .set_entry("controlword", Value::from(0x000Fu16), WriteAccessMethod::Pdo)
        .unwrap();

    let (mut injector, mut observer) = bus.endpoint();
    device
        .add_transmit_pdo_mapping(
            0x201,
            vec![Mapping {
                entry_name: "controlword".into(),
                offset: 0,
            }],
            TransmissionType::Sync,
            Duration::ZERO,
        )
        .unwrap();

    injector.send(SyncObject.into()).unwrap();
    wait_for(|| {
        observer
            .try_recv()
            .map(|f| f.id() == CanId::std(0x201) && f.data() == [0x0F, 0x00])
            .unwrap_or(false)
    });
}

#[test]
#[serial]
fn custom_receive_callback_runs_off_the_receive_thread() {
    let (bus, _core, device) = setup();
    motion_dictionary(&device);

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_in_callback = hits.clone();
    device
        .add_receive_pdo_mapping_with_callback(0x181, "statusword", 0, move |mapping, data| {
            assert_eq!("statusword", mapping.entry_name);
            assert_eq!(&[0x37, 0x02], data);
            hits_in_callback.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let (mut injector, _rx) = bus.endpoint();
    injector
        .send(CanMessage::new(CanId::std(0x181), &[0x37, 0x02]))
        .unwrap();

    wait_for(|| hits.load(Ordering::SeqCst) == 1);

    // The custom callback replaced the dictionary update
    assert!(device
        .get_entry("statusword", ReadAccessMethod::Cache)
        .unwrap()
        .is_invalid());
}
