//! Protocol names and supported-version records.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{CoreError, InvalidId};

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProtocolName(String);

impl ProtocolName {
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(InvalidId::Protocol {
                raw,
                reason: "empty".into(),
            }
            .into());
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ProtocolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolName({:?})", self.0)
    }
}

impl fmt::Display for ProtocolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ProtocolName {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        ProtocolName::new(s)
    }
}

impl From<ProtocolName> for String {
    fn from(name: ProtocolName) -> String {
        name.0
    }
}

/// A protocol and the versions one party speaks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolRecord {
    pub protocol_name: ProtocolName,
    pub versions: BTreeSet<u32>,
}

impl ProtocolRecord {
    pub fn new(protocol_name: ProtocolName, versions: impl IntoIterator<Item = u32>) -> Self {
        Self {
            protocol_name,
            versions: versions.into_iter().collect(),
        }
    }

    /// Highest version present both here and in `offered`.
    pub fn highest_common(&self, offered: &[u32]) -> Option<u32> {
        offered
            .iter()
            .copied()
            .filter(|v| self.versions.contains(v))
            .max()
    }

    /// Versions in descending preference order, as offered in an Init.
    pub fn offer(&self) -> Vec<u32> {
        self.versions.iter().rev().copied().collect()
    }
}

/// Protocol and version both parties agreed on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedProtocol {
    pub protocol_name: ProtocolName,
    pub version: u32,
}
