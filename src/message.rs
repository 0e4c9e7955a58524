//! Relay envelope codec.
//!
//! Every datagram on the signaling port is a `Message`: a fixed big-endian
//! header followed by an opaque payload, scrambled end-to-end by a
//! length-preserving obfuscation transform. The transform discourages
//! passive inspection of signaling traffic; it is not authentication.
//!
//! ## Wire layout (before obfuscation)
//!
//! ```text
//! msg_type(1) | from(8) | to(8) | tid(1) | tseq(2) | timestamp(2) | payload
//! ```
//!
//! All multi-byte fields are big-endian. `tseq` is a signed 16-bit sequence
//! number with modular-wrap ordering; `timestamp` is a 16-bit media clock.

use tracing::trace;

// ============================================================================
// Message Type Constants
// ============================================================================

/// Media payload carried between call participants. The signaling core
/// never originates these; the metrics engine observes them.
pub const MSG_TYPE_DATA: u8 = 0x00;

/// Presence registration sent to relays.
pub const MSG_TYPE_USER_REG: u8 = 0x01;

/// Relay acknowledgement of a presence registration.
pub const MSG_TYPE_USER_REG_RECEIVED: u8 = 0x02;

/// Signaling envelope: the payload is a JSON signal.
pub const MSG_TYPE_USER_SIGNAL: u8 = 0x03;

/// Size of the fixed envelope header:
/// msg_type(1) + from(8) + to(8) + tid(1) + tseq(2) + timestamp(2).
pub const MESSAGE_HEADER_SIZE: usize = 22;

/// Per-datagram IPv4 (20) + UDP (8) header overhead counted by
/// [`Message::net_traffic_size`].
pub const NET_HEADER_OVERHEAD: u16 = 28;

// ============================================================================
// Obfuscation Transform
// ============================================================================

/// Seed of the keystream shared with the relay datapath.
const SCRAMBLE_SEED: u32 = 0x5EED_C0DE;

/// XOR the buffer with a position-dependent keystream. Self-inverse:
/// applying it twice restores the input. Both peers derive the same
/// stream from [`SCRAMBLE_SEED`], so no key material is carried on the wire.
fn scramble(buf: &mut [u8]) {
    let mut state = SCRAMBLE_SEED;
    for byte in buf.iter_mut() {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        *byte ^= (state >> 24) as u8;
    }
}

// ============================================================================
// Message
// ============================================================================

/// Decoded relay envelope. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u8,
    pub from: u64,
    pub to: u64,
    /// Media track identifier.
    pub tid: u8,
    /// Per-track sequence number, signed 16-bit with wraparound ordering.
    pub tseq: i16,
    /// 16-bit media timestamp, echoed by RTT probes.
    pub timestamp: u16,
    pub payload: Vec<u8>,
}

/// Error type for envelope decoding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    /// Datagram shorter than the fixed header.
    Truncated { len: usize },
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageError::Truncated { len } => {
                write!(f, "datagram too short for envelope header: {} bytes", len)
            }
        }
    }
}

impl std::error::Error for MessageError {}

impl Message {
    /// Build a signaling envelope. Media fields are unused on the
    /// signaling path and zeroed.
    pub fn signal(msg_type: u8, from: u64, to: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            from,
            to,
            tid: 0,
            tseq: 0,
            timestamp: 0,
            payload,
        }
    }

    /// Decode an obfuscated datagram into a `Message`.
    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() < MESSAGE_HEADER_SIZE {
            return Err(MessageError::Truncated { len: data.len() });
        }

        let mut clear = data.to_vec();
        scramble(&mut clear);

        let mut from = [0u8; 8];
        from.copy_from_slice(&clear[1..9]);
        let mut to = [0u8; 8];
        to.copy_from_slice(&clear[9..17]);
        let mut tseq = [0u8; 2];
        tseq.copy_from_slice(&clear[18..20]);
        let mut timestamp = [0u8; 2];
        timestamp.copy_from_slice(&clear[20..22]);

        let msg = Self {
            msg_type: clear[0],
            from: u64::from_be_bytes(from),
            to: u64::from_be_bytes(to),
            tid: clear[17],
            tseq: i16::from_be_bytes(tseq),
            timestamp: u16::from_be_bytes(timestamp),
            payload: clear[MESSAGE_HEADER_SIZE..].to_vec(),
        };
        trace!(msg_type = msg.msg_type, from = msg.from, to = msg.to, "decoded envelope");
        Ok(msg)
    }

    /// Encode into an obfuscated datagram ready for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(MESSAGE_HEADER_SIZE + self.payload.len());
        wire.push(self.msg_type);
        wire.extend_from_slice(&self.from.to_be_bytes());
        wire.extend_from_slice(&self.to.to_be_bytes());
        wire.push(self.tid);
        wire.extend_from_slice(&self.tseq.to_be_bytes());
        wire.extend_from_slice(&self.timestamp.to_be_bytes());
        wire.extend_from_slice(&self.payload);
        scramble(&mut wire);
        wire
    }

    /// On-wire byte count of this message including UDP/IP headers.
    /// Feeds the uplink bandwidth estimator.
    pub fn net_traffic_size(&self) -> u16 {
        let wire = MESSAGE_HEADER_SIZE + self.payload.len();
        u16::try_from(wire)
            .unwrap_or(u16::MAX)
            .saturating_add(NET_HEADER_OVERHEAD)
    }
}
