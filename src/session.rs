//! Sessions and the session registry.
//!
//! A session groups the participants of one call under a randomly allocated
//! 64-bit identifier and tracks which shape the call has settled into.
//! Mode only ever moves forward: an undecided session may become either a
//! direct call or a multi-party call, a direct call may be promoted to
//! multi-party, and multi-party is terminal.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::participant::Participant;

/// Call shape of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// No call-defining signal seen yet.
    Undecided,
    /// Direct call between two participants; signals pass through verbatim.
    OneToOne,
    /// Multi-party call managed by the session manager. Terminal.
    Multiple,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub sid: u64,
    pub mode: CallMode,
    pub participants: HashMap<u64, Participant>,
}

impl Session {
    pub fn new(sid: u64) -> Self {
        Self {
            sid,
            mode: CallMode::Undecided,
            participants: HashMap::new(),
        }
    }

    /// Fetch a participant, creating an idle one on first reference.
    pub fn participant_mut(&mut self, uid: u64) -> &mut Participant {
        self.participants
            .entry(uid)
            .or_insert_with(|| Participant::new(uid))
    }
}

/// In-memory session table with random identifier allocation.
///
/// Owned by the session-manager event loop; every access happens on that
/// one task, which is what makes allocate-then-create atomic.
pub struct SessionRegistry {
    sessions: HashMap<u64, Session>,
    rng: StdRng,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Registry with a deterministic identifier sequence.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            sessions: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw random 64-bit identifiers until one is not in use.
    pub fn allocate(&mut self) -> u64 {
        loop {
            let sid = self.rng.next_u64();
            if !self.sessions.contains_key(&sid) {
                return sid;
            }
        }
    }

    pub fn create(&mut self, sid: u64) -> &mut Session {
        self.sessions.entry(sid).or_insert_with(|| Session::new(sid))
    }

    pub fn get(&self, sid: u64) -> Option<&Session> {
        self.sessions.get(&sid)
    }

    pub fn get_mut(&mut self, sid: u64) -> Option<&mut Session> {
        self.sessions.get_mut(&sid)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop finished sessions.
    ///
    /// Currently retains everything.
    /// TODO: settle the completion policy (direct call saw an End vs. all
    /// members idle vs. active polling of participants) before enabling.
    pub fn reap(&mut self) {}
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
