//! Parties, protocol catalog and per-group configuration shared by the
//! session scenarios.

use std::collections::BTreeSet;

use flowbus::config::Config;
use flowbus::session::{FlowProtocol, PartyProtocols, ProtocolCatalog};
use flowbus::{GroupId, PartyId, ProtocolName, SessionId, SessionKey};

pub const PARTITIONS: u32 = 4;
pub const CHAT_FLOW: &str = "ChatFlow";
pub const CHAT_RESPONDER: &str = "ChatResponder";

pub fn alice() -> PartyId {
    PartyId::parse("alice@g1").expect("party")
}

pub fn carol() -> PartyId {
    PartyId::parse("carol@g1").expect("party")
}

pub fn bob() -> PartyId {
    PartyId::parse("bob@g2").expect("party")
}

pub fn session_id(counter: u64) -> SessionId {
    SessionId::for_pair(&alice(), &bob(), counter)
}

pub fn key(party: PartyId, session: &SessionId) -> SessionKey {
    SessionKey::new(party, session.clone())
}

fn chat(flow: &str, versions: &[u32]) -> FlowProtocol {
    FlowProtocol {
        flow: flow.to_string(),
        protocol: ProtocolName::new("chat").expect("protocol name"),
        versions: versions.iter().copied().collect::<BTreeSet<_>>(),
    }
}

/// Alice initiates chat v1; Bob and Carol respond to v1 and v2.
pub fn catalog() -> ProtocolCatalog {
    ProtocolCatalog {
        parties: vec![
            PartyProtocols {
                party: alice(),
                initiators: vec![chat(CHAT_FLOW, &[1])],
                responders: Vec::new(),
            },
            PartyProtocols {
                party: bob(),
                initiators: Vec::new(),
                responders: vec![chat(CHAT_RESPONDER, &[1, 2])],
            },
            PartyProtocols {
                party: carol(),
                initiators: Vec::new(),
                responders: vec![chat(CHAT_RESPONDER, &[1, 2])],
            },
        ],
    }
}

pub fn config_for(group: &str) -> Config {
    let mut config = Config::default();
    config.instance.partition_count = PARTITIONS;
    config.instance.local_groups = vec![GroupId::new(group).expect("group")];
    config.protocols = catalog();
    config
}
