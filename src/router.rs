//! Locality routing for outbound session events.

use std::collections::BTreeSet;

use flowbus_core::{Direction, GroupId, PartyId, SessionEvent};

use crate::bus::OutboundRecord;
use crate::config::TopicsConfig;

/// Snapshot of which parties are hosted on the local bus.
pub trait Topology: Send + Sync {
    fn is_local(&self, party: &PartyId) -> bool;
}

/// Parties are local when their group is one of the configured groups.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupTopology {
    local_groups: BTreeSet<GroupId>,
}

impl GroupTopology {
    pub fn new(local_groups: impl IntoIterator<Item = GroupId>) -> Self {
        Self {
            local_groups: local_groups.into_iter().collect(),
        }
    }
}

impl Topology for GroupTopology {
    fn is_local(&self, party: &PartyId) -> bool {
        self.local_groups.contains(&party.group())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    Local,
    Remote,
}

#[derive(Clone, Debug)]
pub struct Router {
    session_topic: String,
    egress_topic: String,
}

impl Router {
    pub fn new(topics: &TopicsConfig) -> Self {
        Self {
            session_topic: topics.session_events.clone(),
            egress_topic: topics.p2p_out.clone(),
        }
    }

    pub fn destination(&self, counterparty: &PartyId, topology: &dyn Topology) -> Destination {
        if topology.is_local(counterparty) {
            Destination::Local
        } else {
            Destination::Remote
        }
    }

    pub fn topic(&self, destination: Destination) -> &str {
        match destination {
            Destination::Local => &self.session_topic,
            Destination::Remote => &self.egress_topic,
        }
    }

    /// Local records are handed to the counterparty as inbound events; egress
    /// records stay outbound for the gateway.
    pub fn route(&self, event: SessionEvent, topology: &dyn Topology) -> OutboundRecord {
        let destination = self.destination(event.destination(), topology);
        let event = match destination {
            Destination::Local => event.into_inbound(),
            Destination::Remote => SessionEvent {
                direction: Direction::Outbound,
                ..event
            },
        };
        tracing::trace!(
            session_id = %event.session_id,
            sequence = event.sequence,
            ?destination,
            "routed session event"
        );
        OutboundRecord {
            topic: self.topic(destination).to_string(),
            key: event.session_id.as_str().to_string(),
            event,
        }
    }

    pub fn route_all(
        &self,
        events: impl IntoIterator<Item = SessionEvent>,
        topology: &dyn Topology,
    ) -> Vec<OutboundRecord> {
        events
            .into_iter()
            .map(|event| self.route(event, topology))
            .collect()
    }
}
