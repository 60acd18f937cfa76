//! Identity atoms
//!
//! PartyId: `name@group` identity of a session party
//! GroupId: cluster/group a party is hosted in
//! SessionId: session identifier, optionally embedding the ordered party pair
//! RequestKey: dedup window key
//! PartitionId: log partition index

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{CoreError, InvalidId};

const PAIR_SEPARATOR: char = '~';
const MAX_SESSION_ID_LEN: usize = 512;

/// Cluster (membership group) a party lives in.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupId(String);

impl GroupId {
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(InvalidId::Group {
                raw,
                reason: "empty".into(),
            }
            .into());
        }
        if raw.contains(['@', PAIR_SEPARATOR]) {
            return Err(InvalidId::Group {
                raw,
                reason: "contains a reserved character".into(),
            }
            .into());
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({:?})", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for GroupId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        GroupId::new(s)
    }
}

impl From<GroupId> for String {
    fn from(id: GroupId) -> String {
        id.0
    }
}

/// Party identity, written `name@group`.
///
/// Ordering is the lexicographic order of the written form; session
/// initiation races are broken on it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartyId(String);

impl PartyId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        let Some((name, group)) = raw.rsplit_once('@') else {
            return Err(InvalidId::Party {
                raw,
                reason: "missing `@group` suffix".into(),
            }
            .into());
        };
        if name.trim().is_empty() {
            return Err(InvalidId::Party {
                raw,
                reason: "empty name".into(),
            }
            .into());
        }
        if name.contains(PAIR_SEPARATOR) {
            return Err(InvalidId::Party {
                raw,
                reason: format!("name contains `{PAIR_SEPARATOR}`"),
            }
            .into());
        }
        GroupId::new(group).map_err(|_| InvalidId::Party {
            raw: raw.clone(),
            reason: "invalid group".into(),
        })?;
        Ok(Self(raw))
    }

    pub fn new(name: &str, group: &GroupId) -> Result<Self, CoreError> {
        Self::parse(format!("{name}@{group}"))
    }

    pub fn name(&self) -> &str {
        self.split().0
    }

    pub fn group(&self) -> GroupId {
        GroupId(self.split().1.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn split(&self) -> (&str, &str) {
        self.0
            .rsplit_once('@')
            .unwrap_or((self.0.as_str(), ""))
    }
}

impl fmt::Debug for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartyId({:?})", self.0)
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PartyId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        PartyId::parse(s)
    }
}

impl From<PartyId> for String {
    fn from(id: PartyId) -> String {
        id.0
    }
}

/// Session identifier, unique per party pair and flow instance.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(InvalidId::Session {
                raw,
                reason: "empty".into(),
            }
            .into());
        }
        if raw.len() > MAX_SESSION_ID_LEN {
            return Err(InvalidId::Session {
                reason: format!("longer than {MAX_SESSION_ID_LEN} bytes"),
                raw,
            }
            .into());
        }
        Ok(Self(raw))
    }

    /// Derive the id both parties compute for their `counter`-th session.
    ///
    /// The pair is written in party order so two parties initiating the same
    /// logical session at once produce the same id.
    pub fn for_pair(a: &PartyId, b: &PartyId, counter: u64) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!(
            "{low}{PAIR_SEPARATOR}{high}{PAIR_SEPARATOR}{counter}"
        ))
    }

    /// The ordered `(low, high)` party pair, if this id was built by `for_pair`.
    pub fn ordered_pair(&self) -> Option<(PartyId, PartyId)> {
        let mut parts = self.0.splitn(3, PAIR_SEPARATOR);
        let low = PartyId::parse(parts.next()?).ok()?;
        let high = PartyId::parse(parts.next()?).ok()?;
        parts.next()?.parse::<u64>().ok()?;
        (low <= high).then_some((low, high))
    }

    /// The party whose Init wins a symmetric initiation race.
    pub fn initiation_winner<'a>(&self, a: &'a PartyId, b: &'a PartyId) -> &'a PartyId {
        if let Some((low, _)) = self.ordered_pair() {
            if &low == a {
                return a;
            }
            if &low == b {
                return b;
            }
        }
        if a <= b { a } else { b }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({:?})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        SessionId::new(s)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> String {
        id.0
    }
}

/// Address of one party's view of a session.
///
/// Both parties of a session may be hosted by the same worker, so session
/// state is keyed by the hosting party as well as the session id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub party: PartyId,
    pub session: SessionId,
}

impl SessionKey {
    pub fn new(party: PartyId, session: SessionId) -> Self {
        Self { party, session }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.party, self.session)
    }
}

/// Key of a bounded-lifetime dedup window.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestKey(String);

impl RequestKey {
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidId::RequestKey {
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

impl fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestKey({:?})", self.0)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RequestKey {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        RequestKey::new(s)
    }
}

impl From<RequestKey> for String {
    fn from(key: RequestKey) -> String {
        key.0
    }
}

/// Index of a log partition.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(u32);

impl PartitionId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionId({})", self.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partition a record key hashes to.
///
/// `partition_count` of zero is treated as one.
pub fn partition_for(key: &str, partition_count: u32) -> PartitionId {
    let count = partition_count.max(1);
    PartitionId(crc32c::crc32c(key.as_bytes()) % count)
}

/// Identity of one worker process (consumer-group member).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
