use std::time::{Duration, Instant};

use canmaster_client::{
    AccessType, CanOpenError, Core, Device, MasterConfig, ReadAccessMethod, SdoError,
    WriteAccessMethod,
};
use canmaster_common::sdo::AbortCode;
use canmaster_common::{DataType, NodeId, Value};
use integration_tests::{mock_node::MockNode, sim_bus::SimBus};

const SLAVE_NODE_ID: u8 = 1;

fn test_config() -> MasterConfig {
    MasterConfig {
        sdo_response_timeout: Duration::from_millis(50),
        repeats_on_sdo_timeout: 2,
        ..Default::default()
    }
}

fn setup() -> (SimBus, MockNode, Core, Device) {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus = SimBus::new();
    let node = MockNode::spawn(SLAVE_NODE_ID, &bus);
    let (sender, receiver) = bus.endpoint();
    let core = Core::new(sender, receiver, test_config());
    let device = Device::new(&core, NodeId::new(SLAVE_NODE_ID).unwrap());
    (bus, node, core, device)
}

#[test]
fn expedited_read_of_device_type() {
    let (_bus, node, _core, device) = setup();
    node.set_object(0x1000, 0, vec![0x92, 0x01, 0x02, 0x00]);

    device
        .add_entry(0x1000, 0, "Device Type", DataType::UInt32, AccessType::ReadOnly)
        .unwrap();

    let value = device
        .get_entry("device_type", ReadAccessMethod::Sdo)
        .unwrap();
    assert_eq!(Value::from(131474u32), value);

    // The read populated the cache
    let cached = device
        .get_entry("device_type", ReadAccessMethod::Cache)
        .unwrap();
    assert_eq!(131474, cached.as_u32().unwrap());
}

#[test]
fn segmented_upload_of_device_name() {
    let (_bus, node, _core, device) = setup();
    let name = b"canmaster test device".to_vec();
    node.set_object(0x1008, 0, name);

    device
        .add_entry(
            0x1008,
            0,
            "Manufacturer Device Name",
            DataType::VisibleString,
            AccessType::Constant,
        )
        .unwrap();

    let value = device
        .get_entry("manufacturer_device_name", ReadAccessMethod::Sdo)
        .unwrap();
    assert_eq!("canmaster test device", value.as_string().unwrap());
}

#[test]
fn segmented_download() {
    let (_bus, node, _core, device) = setup();
    device
        .set_entry_via_sdo(0x2100, 0, &Value::from("a longer octet payload"))
        .unwrap();
    assert_eq!(
        b"a longer octet payload".to_vec(),
        node.object(0x2100, 0).unwrap()
    );
}

#[test]
fn retry_exhaustion_after_exactly_repeats_plus_one_attempts() {
    let (_bus, node, _core, device) = setup();
    node.set_responding(false);

    device
        .add_entry(0x6040, 0, "Controlword", DataType::UInt16, AccessType::ReadWrite)
        .unwrap();

    let started = Instant::now();
    let err = device
        .set_entry("controlword", Value::from(0x000Fu16), WriteAccessMethod::Sdo)
        .unwrap_err();
    let elapsed = started.elapsed();

    match err {
        CanOpenError::Sdo {
            source: SdoError::ResponseTimeout { .. },
        } => (),
        other => panic!("expected response timeout, got {other:?}"),
    }
    // repeats_on_sdo_timeout = 2 -> exactly 3 attempts
    assert_eq!(3, node.request_count());
    // Each attempt waits the response timeout
    assert!(elapsed >= Duration::from_millis(2 * 50));

    // The local entry keeps the optimistically stored value
    let cached = device
        .get_entry("controlword", ReadAccessMethod::Cache)
        .unwrap();
    assert_eq!(0x000F, cached.as_u16().unwrap());
}

#[test]
fn abort_propagates_immediately_without_retry() {
    let (_bus, node, _core, device) = setup();
    node.set_write_abort(0x6040, 0, AbortCode::ReadOnly);

    let err = device
        .set_entry_via_sdo(0x6040, 0, &Value::from(0x000Fu16))
        .unwrap_err();
    match err {
        CanOpenError::Sdo {
            source: SdoError::Abort { abort_code },
        } => assert_eq!(AbortCode::ReadOnly as u32, abort_code),
        other => panic!("expected abort, got {other:?}"),
    }
    assert_eq!(1, node.request_count());
}

#[test]
fn upload_of_missing_object_aborts() {
    let (_bus, _node, _core, device) = setup();
    let err = device
        .get_entry_via_sdo(0x5000, 0, DataType::UInt8)
        .unwrap_err();
    match err {
        CanOpenError::Sdo {
            source: SdoError::Abort { abort_code },
        } => assert_eq!(AbortCode::NoSuchObject as u32, abort_code),
        other => panic!("expected abort, got {other:?}"),
    }
}
