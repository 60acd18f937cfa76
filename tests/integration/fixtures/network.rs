//! Worker instances joined by in-memory logs.
//!
//! Every node publishes to its own `MemoryPublisher`. `settle` plays both
//! the consumer of the session topic and the gateway that carries `p2p.out`
//! records to the instance hosting the destination party.

use std::collections::BTreeMap;
use std::sync::Arc;

use flowbus::bus::{InboundRecord, MemoryPublisher, OutboundRecord, PublishedRecord, publish_all};
use flowbus::config::Config;
use flowbus::router::{GroupTopology, Topology};
use flowbus::session::{LifecycleNotice, ProcessOutcome, SessionManager};
use flowbus::{
    PartitionId, PartyId, SessionCheckpoint, SessionEvent, SessionKey, SessionState, WallClock,
    partition_for,
};

use super::parties::config_for;

pub struct Node {
    pub config: Config,
    pub manager: SessionManager,
    pub log: Arc<MemoryPublisher>,
    topology: Arc<GroupTopology>,
}

impl Node {
    pub fn new(config: Config) -> Self {
        let topology = Arc::new(GroupTopology::new(config.instance.local_groups.clone()));
        let (manager, _) = start(&config, &topology, Vec::new(), WallClock(0));
        Self {
            config,
            manager,
            log: Arc::new(MemoryPublisher::new()),
            topology,
        }
    }

    pub fn hosts(&self, party: &PartyId) -> bool {
        self.topology.is_local(party)
    }

    pub fn publish(&self, records: &[OutboundRecord]) {
        publish_all(self.log.as_ref(), records).expect("publish");
    }

    /// Simulate a consumer restart: every partition is revoked, its
    /// checkpoints pass through JSON, and a fresh manager takes over and
    /// publishes what it resends. Returns the number of resent records.
    pub fn restart(&mut self, now: WallClock) -> usize {
        let checkpoints = (0..self.config.instance.partition_count)
            .flat_map(|p| self.manager.revoke(PartitionId::new(p)))
            .map(|checkpoint| {
                let json = checkpoint.to_json().expect("checkpoint json");
                SessionCheckpoint::from_json(&json).expect("checkpoint from json")
            })
            .collect();
        let (manager, resent) = start(&self.config, &self.topology, checkpoints, now);
        self.manager = manager;
        self.publish(&resent);
        resent.len()
    }

    pub fn session(&self, key: &SessionKey) -> &SessionState {
        self.manager.session(key).expect("session state")
    }
}

fn start(
    config: &Config,
    topology: &Arc<GroupTopology>,
    checkpoints: Vec<SessionCheckpoint>,
    now: WallClock,
) -> (SessionManager, Vec<OutboundRecord>) {
    let count = config.instance.partition_count;
    let mut by_partition: BTreeMap<PartitionId, Vec<SessionCheckpoint>> = BTreeMap::new();
    for checkpoint in checkpoints {
        by_partition
            .entry(partition_for(checkpoint.session_id.as_str(), count))
            .or_default()
            .push(checkpoint);
    }
    let mut manager = SessionManager::new(config, topology.clone());
    let mut resent = Vec::new();
    for p in 0..count {
        let partition = PartitionId::new(p);
        let owned = by_partition.remove(&partition).unwrap_or_default();
        resent.extend(manager.assign(partition, owned, now).expect("assign partition"));
    }
    (manager, resent)
}

/// Everything the managers reported while records were moving.
#[derive(Debug, Default)]
pub struct Settled {
    pub delivered: Vec<SessionEvent>,
    pub notices: Vec<LifecycleNotice>,
    pub rejected: usize,
}

impl Settled {
    fn absorb(&mut self, outcome: ProcessOutcome) {
        self.delivered.extend(outcome.delivered);
        self.notices.extend(outcome.notices);
        self.rejected += outcome.rejected.len();
    }

    pub fn delivered_sequences(&self) -> Vec<u64> {
        self.delivered.iter().map(|event| event.sequence).collect()
    }
}

pub struct Network {
    pub nodes: Vec<Node>,
}

impl Network {
    /// One instance for group g1 (Alice, Carol) and one for g2 (Bob).
    pub fn two_groups() -> Self {
        Self {
            nodes: vec![Node::new(config_for("g1")), Node::new(config_for("g2"))],
        }
    }

    pub fn node(&mut self, party: &PartyId) -> &mut Node {
        let index = self.index_of(party);
        &mut self.nodes[index]
    }

    pub fn session(&self, key: &SessionKey) -> &SessionState {
        self.nodes[self.index_of(&key.party)].session(key)
    }

    fn index_of(&self, party: &PartyId) -> usize {
        self.nodes
            .iter()
            .position(|node| node.hosts(party))
            .expect("a node hosts the party")
    }

    /// Publish what `party`'s instance produced.
    pub fn publish(&mut self, party: &PartyId, outcome: &ProcessOutcome) {
        self.node(party).publish(&outcome.records);
    }

    /// Carry published records to their consumers until every log is quiet.
    pub fn settle(&mut self, now: WallClock) -> Settled {
        let mut settled = Settled::default();
        loop {
            let mut moved = false;
            for from in 0..self.nodes.len() {
                for record in self.nodes[from].log.drain() {
                    moved = true;
                    let (target, inbound) = self.consume(from, record);
                    let outcome = self.nodes[target]
                        .manager
                        .process_events(vec![inbound], now)
                        .expect("process record");
                    self.nodes[target].publish(&outcome.records);
                    settled.absorb(outcome);
                }
            }
            if !moved {
                return settled;
            }
        }
    }

    /// Lose every record published but not yet consumed.
    pub fn drop_in_flight(&mut self) -> usize {
        self.nodes.iter().map(|node| node.log.drain().len()).sum()
    }

    /// Hand specific records straight to their destination, bypassing the
    /// logs. Replies are published and left in flight.
    pub fn deliver(&mut self, records: &[OutboundRecord], now: WallClock) -> Settled {
        let mut settled = Settled::default();
        for record in records {
            let event = record.event.clone().into_inbound();
            let target = self.index_of(event.destination());
            let inbound = InboundRecord::placed(event, self.nodes[target].config.instance.partition_count);
            let outcome = self.nodes[target]
                .manager
                .process_events(vec![inbound], now)
                .expect("process record");
            self.nodes[target].publish(&outcome.records);
            settled.absorb(outcome);
        }
        settled
    }

    fn consume(&self, from: usize, record: PublishedRecord) -> (usize, InboundRecord) {
        let node = &self.nodes[from];
        let value = record.value.expect("session records carry a value");
        let count = node.config.instance.partition_count;
        let partition = partition_for(&record.key, count);
        let decoded = InboundRecord::decode(partition, &record.key, &value).expect("decode record");
        if record.topic != node.config.topics.p2p_out {
            return (from, decoded);
        }
        let event = decoded.event.into_inbound();
        let target = self.index_of(event.destination());
        let count = self.nodes[target].config.instance.partition_count;
        (target, InboundRecord::placed(event, count))
    }
}
