use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

/// Isolation boundary for every entity and operation.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tenant(String);

impl Tenant {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Tenant {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Tenant {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Externally visible SIP identifier (opaque URN).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SipId(String);

impl SipId {
    pub fn new(urn: impl Into<String>) -> Self {
        Self(urn.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SipId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SipId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Externally visible AIP identifier (URN).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AipId(String);

impl AipId {
    pub fn new(urn: impl Into<String>) -> Self {
        Self(urn.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for AipId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AipId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Error returned when a persisted or wire state name is unknown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} state: {value}")]
pub struct UnknownState {
    pub kind: &'static str,
    pub value: String,
}

/// Aggregate lifecycle state of a SIP.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SipState {
    Created,
    Queued,
    Stored,
    StoreError,
    Indexed,
    IndexError,
    Incomplete,
    ToBeDeleted,
    Deleted,
}

impl SipState {
    pub const ALL: [SipState; 9] = [
        SipState::Created,
        SipState::Queued,
        SipState::Stored,
        SipState::StoreError,
        SipState::Indexed,
        SipState::IndexError,
        SipState::Incomplete,
        SipState::ToBeDeleted,
        SipState::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SipState::Created => "CREATED",
            SipState::Queued => "QUEUED",
            SipState::Stored => "STORED",
            SipState::StoreError => "STORE_ERROR",
            SipState::Indexed => "INDEXED",
            SipState::IndexError => "INDEX_ERROR",
            SipState::Incomplete => "INCOMPLETE",
            SipState::ToBeDeleted => "TO_BE_DELETED",
            SipState::Deleted => "DELETED",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SipState::StoreError | SipState::IndexError)
    }
}

impl Display for SipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SipState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SipState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState {
                kind: "SIP",
                value: s.to_string(),
            })
    }
}

/// Tracking state of a single AIP.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AipState {
    Valid,
    Pending,
    StoringMetadata,
    Created,
    Queued,
    Stored,
    StoreError,
    Updated,
    Indexed,
    IndexError,
    Deleted,
    /// Refused by the storage service at submission time.
    #[serde(rename = "AIP_REJECTED")]
    Rejected,
}

impl AipState {
    pub const ALL: [AipState; 12] = [
        AipState::Valid,
        AipState::Pending,
        AipState::StoringMetadata,
        AipState::Created,
        AipState::Queued,
        AipState::Stored,
        AipState::StoreError,
        AipState::Updated,
        AipState::Indexed,
        AipState::IndexError,
        AipState::Deleted,
        AipState::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AipState::Valid => "VALID",
            AipState::Pending => "PENDING",
            AipState::StoringMetadata => "STORING_METADATA",
            AipState::Created => "CREATED",
            AipState::Queued => "QUEUED",
            AipState::Stored => "STORED",
            AipState::StoreError => "STORE_ERROR",
            AipState::Updated => "UPDATED",
            AipState::Indexed => "INDEXED",
            AipState::IndexError => "INDEX_ERROR",
            AipState::Deleted => "DELETED",
            AipState::Rejected => "AIP_REJECTED",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            AipState::StoreError | AipState::IndexError | AipState::Rejected
        )
    }
}

impl Display for AipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AipState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AipState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState {
                kind: "AIP",
                value: s.to_string(),
            })
    }
}

/// Snapshot of a SIP row.
///
/// Snapshots are never mutated in place: every transition consumes the value
/// and returns the next one, which only becomes visible once persisted
/// through [`crate::store::EntityStore::apply`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SipEntity {
    pub(crate) id: Uuid,
    pub(crate) sip_id: SipId,
    pub(crate) state: SipState,
    pub(crate) rejection_causes: Vec<String>,
    pub(crate) session: Option<String>,
    pub(crate) provider_id: Option<String>,
    pub(crate) ingest_date: DateTime<Utc>,
    pub(crate) last_update: DateTime<Utc>,
    #[serde(default)]
    pub(crate) version: i64,
}

impl SipEntity {
    /// A freshly ingested SIP in state CREATED.
    pub fn new(sip_id: SipId) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            sip_id,
            state: SipState::Created,
            rejection_causes: Vec::new(),
            session: None,
            provider_id: None,
            ingest_date: now,
            last_update: now,
            version: 0,
        }
    }

    /// Rebuild a snapshot from persisted columns.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: Uuid,
        sip_id: SipId,
        state: SipState,
        rejection_causes: Vec<String>,
        session: Option<String>,
        provider_id: Option<String>,
        ingest_date: DateTime<Utc>,
        last_update: DateTime<Utc>,
        version: i64,
    ) -> Self {
        Self {
            id,
            sip_id,
            state,
            rejection_causes,
            session,
            provider_id,
            ingest_date,
            last_update,
            version,
        }
    }

    pub fn in_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn from_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sip_id(&self) -> &SipId {
        &self.sip_id
    }

    pub fn state(&self) -> SipState {
        self.state
    }

    pub fn rejection_causes(&self) -> &[String] {
        &self.rejection_causes
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.provider_id.as_deref()
    }

    pub fn ingest_date(&self) -> DateTime<Utc> {
        self.ingest_date
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    /// Row version the snapshot was read at. Stores only accept a write whose
    /// version still matches the stored row.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// The snapshot as a store persists it, one version ahead.
    #[must_use]
    pub fn committed(mut self) -> Self {
        self.version += 1;
        self
    }

    /// Move to `state`, bumping the update date.
    pub fn with_state(mut self, state: SipState) -> Self {
        self.state = state;
        self.last_update = Utc::now();
        self
    }

    /// Append one explanation to the rejection history.
    pub fn with_rejection_cause(mut self, cause: impl Into<String>) -> Self {
        self.rejection_causes.push(cause.into());
        self.last_update = Utc::now();
        self
    }

    /// Most recent entry of the rejection history.
    pub fn last_rejection_cause(&self) -> Option<&str> {
        self.rejection_causes.last().map(String::as_str)
    }
}

/// Snapshot of an AIP tracking row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AipEntity {
    pub(crate) id: Uuid,
    pub(crate) aip_id: AipId,
    pub(crate) sip_id: SipId,
    pub(crate) state: AipState,
    pub(crate) error_message: Option<String>,
    pub(crate) last_update: DateTime<Utc>,
}

impl AipEntity {
    /// A new AIP in state CREATED, owned by `sip_id`.
    pub fn new(aip_id: AipId, sip_id: SipId) -> Self {
        Self {
            id: Uuid::now_v7(),
            aip_id,
            sip_id,
            state: AipState::Created,
            error_message: None,
            last_update: Utc::now(),
        }
    }

    pub fn restore(
        id: Uuid,
        aip_id: AipId,
        sip_id: SipId,
        state: AipState,
        error_message: Option<String>,
        last_update: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            aip_id,
            sip_id,
            state,
            error_message,
            last_update,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn aip_id(&self) -> &AipId {
        &self.aip_id
    }

    pub fn sip_id(&self) -> &SipId {
        &self.sip_id
    }

    pub fn state(&self) -> AipState {
        self.state
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    /// Successful transition: the error message is cleared.
    pub fn with_state(mut self, state: AipState) -> Self {
        self.state = state;
        self.error_message = None;
        self.last_update = Utc::now();
        self
    }

    /// Failed transition carrying an explanation.
    pub fn with_error(mut self, state: AipState, message: impl Into<String>) -> Self {
        self.state = state;
        self.error_message = Some(message.into());
        self.last_update = Utc::now();
        self
    }
}

/// A SIP the storage service refused to act on.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RejectedSip {
    pub sip_id: SipId,
    pub reason: String,
}

impl RejectedSip {
    pub fn new(sip_id: SipId, reason: impl Into<String>) -> Self {
        Self {
            sip_id,
            reason: reason.into(),
        }
    }
}

/// An AIP the storage service refused to store.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RejectedAip {
    pub aip_id: AipId,
    pub reason: String,
}

impl RejectedAip {
    pub fn new(aip_id: AipId, reason: impl Into<String>) -> Self {
        Self {
            aip_id,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names_round_trip() {
        for state in SipState::ALL {
            assert_eq!(state.as_str().parse::<SipState>().unwrap(), state);
        }
        for state in AipState::ALL {
            assert_eq!(state.as_str().parse::<AipState>().unwrap(), state);
        }
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        let err = "ARCHIVED".parse::<SipState>().unwrap_err();
        assert_eq!(err.kind, "SIP");
        assert_eq!(err.to_string(), "unknown SIP state: ARCHIVED");
    }

    #[test]
    fn test_rejected_aip_uses_wire_name() {
        let json = serde_json::to_string(&AipState::Rejected).unwrap();
        assert_eq!(json, "\"AIP_REJECTED\"");
        let json = serde_json::to_string(&SipState::ToBeDeleted).unwrap();
        assert_eq!(json, "\"TO_BE_DELETED\"");
    }

    #[test]
    fn test_sip_transition_returns_new_snapshot() {
        let created = SipEntity::new(SipId::new("URN:SIP:1"));
        let stored = created.clone().with_state(SipState::Stored);

        assert_eq!(created.state(), SipState::Created);
        assert_eq!(stored.state(), SipState::Stored);
        assert_eq!(created.id(), stored.id());
        assert!(stored.last_update() >= created.last_update());
    }

    #[test]
    fn test_rejection_causes_only_grow() {
        let sip = SipEntity::new(SipId::new("URN:SIP:1"))
            .with_rejection_cause("first")
            .with_state(SipState::Stored)
            .with_rejection_cause("second");

        assert_eq!(sip.rejection_causes(), ["first", "second"]);
    }

    #[test]
    fn test_aip_success_clears_error() {
        let aip = AipEntity::new(AipId::new("URN:AIP:1"), SipId::new("URN:SIP:1"))
            .with_error(AipState::StoreError, "disk full");
        assert_eq!(aip.error_message(), Some("disk full"));

        let aip = aip.with_state(AipState::Stored);
        assert_eq!(aip.state(), AipState::Stored);
        assert_eq!(aip.error_message(), None);
    }
}
