use std::time::Duration;

use canmaster_client::{Core, Device, MasterConfig, NodeConfig};
use canmaster_common::NodeId;
use integration_tests::{mock_node::MockNode, sim_bus::SimBus};

const SLAVE_NODE_ID: u8 = 3;

const CONFIG: &str = r#"
[tpdo.0]
transmission_type = 255
event_timer = 500
mappings = [
    { index = 0x6064, sub = 0, size = 32 },
    { index = 0x6041, sub = 0, size = 16 },
]

[rpdo.1]
transmission_type = 255
mappings = [
    { index = 0x60FF, sub = 0, size = 32 },
]

[[store]]
type = "u16"
value = 1000
index = 0x1017
sub = 0
"#;

#[test]
fn apply_configures_pdos_and_stores() {
    let bus = SimBus::new();
    let node = MockNode::spawn(SLAVE_NODE_ID, &bus);
    let (sender, receiver) = bus.endpoint();
    let core = Core::new(
        sender,
        receiver,
        MasterConfig {
            sdo_response_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    );
    let device = Device::new(&core, NodeId::new(SLAVE_NODE_ID).unwrap());

    // COB-IDs the mock reports for TPDO1 and RPDO2
    node.set_object(0x1800, 1, 0x0000_0183u32.to_le_bytes().to_vec());
    node.set_object(0x1401, 1, 0x0000_0303u32.to_le_bytes().to_vec());

    let config = NodeConfig::load_from_str(CONFIG).unwrap();
    config.apply(&device).unwrap();

    // TPDO1 mapping records and comm parameters
    assert_eq!(
        0x6064_0020u32.to_le_bytes().to_vec(),
        node.object(0x1A00, 1).unwrap()
    );
    assert_eq!(
        0x6041_0010u32.to_le_bytes().to_vec(),
        node.object(0x1A00, 2).unwrap()
    );
    assert_eq!(vec![0x02], node.object(0x1A00, 0).unwrap());
    assert_eq!(vec![0xFF], node.object(0x1800, 2).unwrap());
    assert_eq!(
        500u16.to_le_bytes().to_vec(),
        node.object(0x1800, 5).unwrap()
    );

    // RPDO2 mapping record
    assert_eq!(
        0x60FF_0020u32.to_le_bytes().to_vec(),
        node.object(0x1601, 1).unwrap()
    );
    assert_eq!(vec![0x01], node.object(0x1601, 0).unwrap());

    // Heartbeat producer time store
    assert_eq!(
        1000u16.to_le_bytes().to_vec(),
        node.object(0x1017, 0).unwrap()
    );

    // Both PDOs re-enabled (bit 31 clear)
    assert_eq!(
        0x0000_0183u32.to_le_bytes().to_vec(),
        node.object(0x1800, 1).unwrap()
    );
    assert_eq!(
        0x0000_0303u32.to_le_bytes().to_vec(),
        node.object(0x1401, 1).unwrap()
    );
}
