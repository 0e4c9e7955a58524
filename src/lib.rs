//! # Confab - Conference Signaling Core
//!
//! Confab is the signaling and media-quality instrumentation core of a
//! real-time voice/video conferencing backend. It speaks an obfuscated
//! UDP envelope shared with a fleet of relay nodes and provides:
//!
//! - **Session management**: allocation of 64-bit session identifiers,
//!   per-participant call-state machines, and mediation of direct (1-1)
//!   and multi-party calls, including the one-way promotion from direct
//!   to multi-party mode.
//! - **Uplink metrics**: a per-stream sliding-window estimator that turns
//!   observed media descriptors into expected-vs-received packet counts,
//!   duplicate counts, bandwidth estimates, and RTT probe replies for
//!   client-side adaptive bitrate control.
//!
//! ## Architecture
//!
//! The session manager uses the **Actor Pattern**: a public
//! [`SessionManager`] handle sends commands to a private actor that owns
//! every piece of mutable state (sessions, participants, dedup cache) and
//! processes events sequentially on one task. A dedicated ingress task
//! reads the UDP socket; a ticker re-registers presence with the relays.
//! Because all mutation happens on the actor task, handlers need no locks.
//!
//! The metrics engine is a plain synchronous component owned by the media
//! datapath; it is driven one message at a time and hands back ready-made
//! binary frames.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `manager` | Session-manager actor, UDP ingress/egress, relay fan-out |
//! | `session` | Session records, call mode, registry with sid allocation |
//! | `participant` | Participant states, events, guarded transition tables |
//! | `signal` | JSON signal envelope with 64-bit-safe numeric handling |
//! | `message` | Obfuscated relay envelope codec |
//! | `dedup` | Bounded dedup cache over raw signal payloads |
//! | `metrics` | Per-stream uplink estimator and metrics frames |
//! | `config` | Bind address, relay list, intervals |

mod config;
mod dedup;
mod manager;
mod message;
mod metrics;
mod participant;
mod session;
mod signal;

pub use config::{default_relays, SmConfig, DEFAULT_PORT, DEFAULT_REGISTER_INTERVAL};
pub use dedup::{DedupCache, DEDUP_CAPACITY};
pub use manager::{ReceivedPacket, SessionManager, SessionSnapshot, SESSION_MANAGER_UID};
pub use message::{
    Message, MessageError, MESSAGE_HEADER_SIZE, MSG_TYPE_DATA, MSG_TYPE_USER_REG,
    MSG_TYPE_USER_REG_RECEIVED, MSG_TYPE_USER_SIGNAL,
};
pub use metrics::{
    UplinkMetrics, EXTRA_TYPE_METRICS, METRICS_DATA_TYPE_RTT, METRICS_DATA_TYPE_UPLINK,
    RTT_FRAME_SIZE, STAT_BUFFER_SIZE, UPLINK_FRAME_SIZE,
};
pub use participant::{Participant, ParticipantEvent, ParticipantState};
pub use session::{CallMode, Session, SessionRegistry};
pub use signal::{MemberOp, Signal, SignalKind, UnknownSignalKind};
