//! JSON signal envelope.
//!
//! Signaling messages carry a small JSON object in the relay envelope's
//! payload: `{signal, from, to, sid, info}`. User identifiers and session
//! identifiers are unsigned 64-bit and must survive a JSON round-trip
//! exactly; `serde_json` keeps integers in that range lossless, so ids are
//! never routed through a float.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Signal kinds, encoded as small integers on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SignalKind {
    /// Ask the session manager to allocate a session identifier.
    SidRequest = 1,
    /// Reply carrying the allocated session identifier.
    SidCreated = 2,
    Invite = 3,
    Cancel = 4,
    Accept = 5,
    Reject = 6,
    Busy = 7,
    Ring = 8,
    End = 9,
    /// Multi-party membership operation (`info.op` + `info.members`).
    MemberOp = 10,
    /// Fan-out of the per-participant `{state, event}` table.
    MemberState = 11,
}

impl SignalKind {
    /// Whether this kind drives a participant state transition.
    pub fn is_call_control(self) -> bool {
        matches!(
            self,
            SignalKind::Invite
                | SignalKind::Cancel
                | SignalKind::Accept
                | SignalKind::Reject
                | SignalKind::Busy
                | SignalKind::End
        )
    }
}

impl From<SignalKind> for u8 {
    fn from(kind: SignalKind) -> u8 {
        kind as u8
    }
}

/// Error type for unmapped signal kind bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownSignalKind(pub u8);

impl std::fmt::Display for UnknownSignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown signal kind {}", self.0)
    }
}

impl std::error::Error for UnknownSignalKind {}

impl TryFrom<u8> for SignalKind {
    type Error = UnknownSignalKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SignalKind::SidRequest),
            2 => Ok(SignalKind::SidCreated),
            3 => Ok(SignalKind::Invite),
            4 => Ok(SignalKind::Cancel),
            5 => Ok(SignalKind::Accept),
            6 => Ok(SignalKind::Reject),
            7 => Ok(SignalKind::Busy),
            8 => Ok(SignalKind::Ring),
            9 => Ok(SignalKind::End),
            10 => Ok(SignalKind::MemberOp),
            11 => Ok(SignalKind::MemberState),
            other => Err(UnknownSignalKind(other)),
        }
    }
}

/// A parsed membership operation from a [`SignalKind::MemberOp`] signal.
#[derive(Debug, Clone, Copy)]
pub struct MemberOp<'a> {
    /// `"invite"` or `"kick"`.
    pub op: &'a str,
    /// Raw member id values; each is parsed to `u64` per target so a bad
    /// entry skips that target only.
    pub members: &'a [Value],
}

/// The signal envelope carried as a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal: SignalKind,
    pub from: u64,
    pub to: u64,
    /// Session identifier; zero means unassigned.
    pub sid: u64,
    /// Free-form auxiliary fields (member ops, member state tables).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub info: Map<String, Value>,
}

impl Signal {
    pub fn new(signal: SignalKind, from: u64, to: u64, sid: u64) -> Self {
        Self {
            signal,
            from,
            to,
            sid,
            info: Map::new(),
        }
    }

    /// Serialize to the JSON wire form.
    pub fn marshal(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse the JSON wire form.
    pub fn unmarshal(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Extract the membership operation, if this signal carries a
    /// well-formed one.
    pub fn member_op(&self) -> Option<MemberOp<'_>> {
        let op = self.info.get("op")?.as_str()?;
        let members = self.info.get("members")?.as_array()?;
        Some(MemberOp { op, members })
    }
}
