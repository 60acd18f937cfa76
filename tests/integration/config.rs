//! Deployment configuration driving a running manager.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use flowbus::bus::InboundRecord;
use flowbus::config::{
    ENV_LOCAL_GROUPS, ENV_SESSION_TOPIC, apply_env_overrides_from, deployment_config_path,
    load_deployment_config, merge_layers,
};
use flowbus::router::GroupTopology;
use flowbus::session::SessionManager;
use flowbus::{ContextProperties, PartitionId, SessionStatus, WallClock};

use crate::fixtures::parties::{CHAT_FLOW, alice, bob, key, session_id};

const DEPLOYMENT: &str = r#"
[instance]
instance_id = "6f1c2e4a-0d7b-4a51-9c39-2f5d8b1e7a10"
partition_count = 2
local_groups = ["g1"]

[topics]
p2p_out = "egress"

[[protocols.parties]]
party = "alice@g1"

[[protocols.parties.initiators]]
flow = "ChatFlow"
protocol = "chat"
versions = [1]

[[protocols.parties]]
party = "bob@g2"

[[protocols.parties.responders]]
flow = "ChatResponder"
protocol = "chat"
versions = [1, 2]
"#;

#[test]
fn deployment_file_and_environment_configure_a_single_instance() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(deployment_config_path(dir.path()), DEPLOYMENT).expect("write deployment file");

    let layer = load_deployment_config(dir.path())
        .expect("load deployment file")
        .expect("deployment file present");
    let mut config = merge_layers(None, Some(layer));
    let env = BTreeMap::from([
        (ENV_LOCAL_GROUPS, "g1, g2"),
        (ENV_SESSION_TOPIC, "sessions"),
    ]);
    apply_env_overrides_from(&mut config, |name| env.get(name).map(|v| v.to_string()));

    assert_eq!(config.instance.partition_count, 2);
    assert_eq!(config.instance.local_groups.len(), 2);
    assert_eq!(config.topics.p2p_out, "egress");
    assert_eq!(config.topics.session_events, "sessions");
    assert_eq!(config.protocols.parties.len(), 2);

    let topology = Arc::new(GroupTopology::new(config.instance.local_groups.clone()));
    let mut manager = SessionManager::new(&config, topology);
    assert_eq!(
        manager.instance_id().to_string(),
        "6f1c2e4a-0d7b-4a51-9c39-2f5d8b1e7a10"
    );
    for p in 0..config.instance.partition_count {
        manager
            .assign(PartitionId::new(p), Vec::new(), WallClock(0))
            .expect("assign");
    }

    let sid = session_id(40);
    let mut records = manager
        .initiate(&alice(), &bob(), CHAT_FLOW, sid.clone(), ContextProperties::new(), WallClock(1))
        .expect("initiate")
        .records;
    while !records.is_empty() {
        assert!(records.iter().all(|record| record.topic == "sessions"));
        let inbound = records
            .drain(..)
            .map(|record| InboundRecord::placed(record.event, config.instance.partition_count))
            .collect();
        records = manager
            .process_events(inbound, WallClock(2))
            .expect("process")
            .records;
    }

    let initiator = manager.session(&key(alice(), &sid)).expect("initiator");
    assert_eq!(initiator.status, SessionStatus::Confirmed);
    assert_eq!(initiator.protocol_version, Some(1));
}
