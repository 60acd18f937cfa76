//! Protocol catalog and version negotiation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use flowbus_core::{NegotiatedProtocol, PartyId, ProtocolName, ProtocolRecord};

use super::error::ProtocolError;

/// Protocols each hosted party initiates and responds to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolCatalog {
    pub parties: Vec<PartyProtocols>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyProtocols {
    pub party: PartyId,
    #[serde(default)]
    pub initiators: Vec<FlowProtocol>,
    #[serde(default)]
    pub responders: Vec<FlowProtocol>,
}

/// A flow bound to the protocol it speaks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowProtocol {
    pub flow: String,
    pub protocol: ProtocolName,
    pub versions: BTreeSet<u32>,
}

impl ProtocolCatalog {
    /// Later entries for the same party replace earlier ones.
    pub fn merge(&mut self, overlay: &ProtocolCatalog) {
        for entry in &overlay.parties {
            match self.parties.iter_mut().find(|p| p.party == entry.party) {
                Some(existing) => *existing = entry.clone(),
                None => self.parties.push(entry.clone()),
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Negotiation {
    Agreed {
        protocol: NegotiatedProtocol,
        responder_flow: String,
    },
    UnknownProtocol,
    Incompatible {
        supported: Vec<u32>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct ProtocolNegotiator {
    known_parties: BTreeSet<PartyId>,
    initiators: BTreeMap<(PartyId, String), ProtocolRecord>,
    responders: BTreeMap<(PartyId, ProtocolName), (String, ProtocolRecord)>,
}

impl ProtocolNegotiator {
    pub fn new(catalog: &ProtocolCatalog) -> Self {
        let mut negotiator = Self::default();
        for party in &catalog.parties {
            negotiator.known_parties.insert(party.party.clone());
            for flow in &party.initiators {
                negotiator.initiators.insert(
                    (party.party.clone(), flow.flow.clone()),
                    ProtocolRecord::new(flow.protocol.clone(), flow.versions.iter().copied()),
                );
            }
            for flow in &party.responders {
                negotiator.responders.insert(
                    (party.party.clone(), flow.protocol.clone()),
                    (
                        flow.flow.clone(),
                        ProtocolRecord::new(flow.protocol.clone(), flow.versions.iter().copied()),
                    ),
                );
            }
        }
        negotiator
    }

    /// Protocol an initiating flow speaks, with the versions to offer.
    pub fn resolve(&self, party: &PartyId, flow: &str) -> Result<ProtocolRecord, ProtocolError> {
        if !self.known_parties.contains(party) {
            return Err(ProtocolError::UnknownInitiator {
                party: party.clone(),
            });
        }
        let record = self
            .initiators
            .get(&(party.clone(), flow.to_string()))
            .ok_or_else(|| ProtocolError::NoProtocol {
                party: party.clone(),
                flow: flow.to_string(),
            })?;
        if record.versions.is_empty() {
            return Err(ProtocolError::NoVersions {
                party: party.clone(),
                flow: flow.to_string(),
            });
        }
        Ok(record.clone())
    }

    /// Responder side: the highest version both parties support.
    pub fn negotiate(
        &self,
        party: &PartyId,
        protocol: &ProtocolName,
        offered: &[u32],
    ) -> Negotiation {
        let Some((flow, record)) = self.responders.get(&(party.clone(), protocol.clone())) else {
            return Negotiation::UnknownProtocol;
        };
        match record.highest_common(offered) {
            Some(version) => Negotiation::Agreed {
                protocol: NegotiatedProtocol {
                    protocol_name: protocol.clone(),
                    version,
                },
                responder_flow: flow.clone(),
            },
            None => Negotiation::Incompatible {
                supported: record.versions.iter().copied().collect(),
            },
        }
    }
}
