//! Session manager actor.
//!
//! The session manager is the signaling controller of the conferencing
//! backend: it allocates session identifiers, mediates direct and
//! multi-party calls, and broadcasts participant state. It follows the
//! actor pattern used across this codebase: a cheap public handle
//! ([`SessionManager`]) sends commands to a private actor ([`SmActor`])
//! that owns every piece of mutable state and processes events
//! sequentially. One ingress task reads the UDP socket and one interval
//! drives periodic re-registration; both feed the actor's single loop, so
//! no locking happens inside handlers.
//!
//! ## Signaling rules
//!
//! - Every call starts with a `SidRequest`; the manager allocates the
//!   session and replies `SidCreated`.
//! - Signals addressed to a peer are direct-call traffic: the manager
//!   forwards them verbatim and shadows both participants' states.
//! - Signals addressed to the manager itself drive multi-party calls:
//!   membership operations, auto-accepted invites, and a `MemberState`
//!   broadcast to every participant after each change.
//! - A session promoted to multi-party never returns to a direct call.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SmConfig;
use crate::dedup::{DedupCache, DEDUP_CAPACITY};
use crate::message::{
    Message, MSG_TYPE_USER_REG, MSG_TYPE_USER_REG_RECEIVED, MSG_TYPE_USER_SIGNAL,
};
use crate::participant::{
    direct_transition, group_transition, member_invite_transition, member_kick_transition,
    ParticipantEvent, ParticipantState,
};
use crate::session::{CallMode, SessionRegistry};
use crate::signal::{Signal, SignalKind};

/// The all-ones identifier the session manager itself answers to.
/// Signals addressed to it are control traffic; everything else is
/// peer-to-peer signaling the manager mediates.
pub const SESSION_MANAGER_UID: u64 = u64::MAX;

/// Scratch buffer for UDP reads; datagrams are assumed to fit the MTU.
const INGRESS_BUFFER_SIZE: usize = 2048;

/// A datagram as handed from the ingress task to the actor.
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub body: Vec<u8>,
    pub from: SocketAddr,
    /// Receive timestamp, nanoseconds since the Unix epoch.
    pub at_ns: i64,
}

/// Point-in-time view of one session, for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub sid: u64,
    pub mode: CallMode,
    pub participants: HashMap<u64, (ParticipantState, ParticipantEvent)>,
}

enum SmCommand {
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
    SessionSnapshot {
        sid: u64,
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
    Quit,
}

fn unix_now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

// ============================================================================
// SessionManager (public handle)
// ============================================================================

/// Handle to a running session manager.
pub struct SessionManager {
    cmd_tx: mpsc::Sender<SmCommand>,
    socket: Arc<UdpSocket>,
    loop_task: JoinHandle<()>,
    ingress_task: JoinHandle<()>,
}

impl SessionManager {
    /// Bind the signaling socket, register to the relays and start the
    /// ingress and event-loop tasks.
    pub async fn start(config: SmConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .with_context(|| format!("failed to bind signaling socket on {}", config.bind_addr))?;
        let socket = Arc::new(socket);
        info!(addr = %socket.local_addr()?, "session manager listening");

        let registry = match config.sid_seed {
            Some(seed) => SessionRegistry::with_seed(seed),
            None => SessionRegistry::new(),
        };
        let actor = SmActor::new(socket.clone(), config.relays, registry);
        actor.register_to_relays().await;

        // Rendezvous hand-off from the ingress task, as close to an
        // unbuffered channel as the runtime offers.
        let (packet_tx, packet_rx) = mpsc::channel(1);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let loop_task = tokio::spawn(actor.run(packet_rx, cmd_rx, config.register_interval));
        let ingress_task = tokio::spawn(ingress_loop(socket.clone(), packet_tx));

        Ok(Self {
            cmd_tx,
            socket,
            loop_task,
            ingress_task,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SmCommand::SessionCount { reply: reply_tx })
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// Snapshot of one session's mode and participant table.
    pub async fn session_snapshot(&self, sid: u64) -> Option<SessionSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SmCommand::SessionSnapshot { sid, reply: reply_tx })
            .await
            .ok()?;
        reply_rx.await.unwrap_or(None)
    }

    /// Cooperative shutdown: the loop drains, then the ingress task is
    /// torn down. Consuming the handle makes start/stop misuse
    /// unrepresentable.
    pub async fn stop(self) {
        let _ = self.cmd_tx.send(SmCommand::Quit).await;
        let _ = self.loop_task.await;
        self.ingress_task.abort();
        let _ = self.ingress_task.await;
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("socket", &self.socket.local_addr())
            .finish()
    }
}

/// Tight UDP read loop. Each datagram is copied out of the scratch buffer
/// and shipped to the actor with its source address and receive time.
async fn ingress_loop(socket: Arc<UdpSocket>, packet_tx: mpsc::Sender<ReceivedPacket>) {
    let mut buf = [0u8; INGRESS_BUFFER_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let packet = ReceivedPacket {
                    body: buf[..len].to_vec(),
                    from,
                    at_ns: unix_now_ns(),
                };
                if packet_tx.send(packet).await.is_err() {
                    // Actor gone; nothing left to feed.
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, "udp read failed");
            }
        }
    }
}

// ============================================================================
// SmActor (owns all mutable state)
// ============================================================================

struct SmActor {
    registry: SessionRegistry,
    dedup: DedupCache,
    relays: Vec<SocketAddr>,
    socket: Arc<UdpSocket>,
}

impl SmActor {
    fn new(socket: Arc<UdpSocket>, relays: Vec<SocketAddr>, registry: SessionRegistry) -> Self {
        Self {
            registry,
            dedup: DedupCache::new(DEDUP_CAPACITY),
            relays,
            socket,
        }
    }

    async fn run(
        mut self,
        mut packet_rx: mpsc::Receiver<ReceivedPacket>,
        mut cmd_rx: mpsc::Receiver<SmCommand>,
        register_interval: Duration,
    ) {
        let mut register_tick = tokio::time::interval(register_interval);
        register_tick.tick().await; // Registration already done at start.

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SmCommand::SessionCount { reply }) => {
                            let _ = reply.send(self.registry.len());
                        }
                        Some(SmCommand::SessionSnapshot { sid, reply }) => {
                            let _ = reply.send(self.snapshot(sid));
                        }
                        Some(SmCommand::Quit) | None => {
                            debug!("session manager actor shutting down");
                            break;
                        }
                    }
                }

                packet = packet_rx.recv() => {
                    if let Some(packet) = packet {
                        self.handle_packet(packet).await;
                    }
                }

                _ = register_tick.tick() => {
                    self.handle_tick().await;
                }
            }
        }
    }

    async fn handle_packet(&mut self, packet: ReceivedPacket) {
        let msg = match Message::decode(&packet.body) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(from = %packet.from, error = %e, "dropping undecodable datagram");
                return;
            }
        };

        match msg.msg_type {
            MSG_TYPE_USER_REG_RECEIVED => {
                info!(from = %packet.from, "registration acknowledged by relay");
            }
            MSG_TYPE_USER_SIGNAL => self.handle_user_signal(&msg).await,
            other => {
                warn!(msg_type = other, from = %packet.from, "unrecognized message type");
            }
        }
    }

    async fn handle_tick(&mut self) {
        self.register_to_relays().await;
        self.registry.reap();
    }

    async fn handle_user_signal(&mut self, msg: &Message) {
        // Relays deliver along several paths; drop the copies before even
        // parsing. Keyed on the raw payload bytes.
        if self.dedup.contains(&msg.payload) {
            return;
        }
        self.dedup.insert(&msg.payload);

        let signal = match Signal::unmarshal(&msg.payload) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "signal unmarshal failed");
                return;
            }
        };

        // The request for a session identifier is the one signal that may
        // arrive without one.
        if signal.signal == SignalKind::SidRequest {
            self.handle_sid_request(&signal).await;
            return;
        }

        if signal.sid == 0 {
            warn!(
                kind = ?signal.signal,
                from = signal.from,
                to = signal.to,
                "signal carries an unassigned session id"
            );
            return;
        }
        if self.registry.get(signal.sid).is_none() {
            warn!(sid = signal.sid, from = signal.from, "signal for unknown session");
            return;
        }

        if signal.to != SESSION_MANAGER_UID {
            self.handle_direct_signal(&signal).await;
        } else {
            self.handle_group_signal(&signal).await;
        }
    }

    async fn handle_sid_request(&mut self, signal: &Signal) {
        let sid = self.registry.allocate();
        self.registry.create(sid);
        info!(sid, from = signal.from, "allocated session");

        let created = Signal::new(SignalKind::SidCreated, SESSION_MANAGER_UID, signal.from, sid);
        self.send_signal(&created).await;
    }

    /// Direct-call branch: forward the signal verbatim to its addressee
    /// and shadow both participants' call states.
    async fn handle_direct_signal(&mut self, signal: &Signal) {
        {
            let session = match self.registry.get_mut(signal.sid) {
                Some(session) => session,
                None => return,
            };
            if session.mode == CallMode::Multiple {
                warn!(
                    sid = signal.sid,
                    kind = ?signal.signal,
                    "direct-call signal refused in multi-party mode"
                );
                return;
            }
            session.mode = CallMode::OneToOne;
        }

        let payload = match signal.marshal() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "signal marshal failed");
                return;
            }
        };
        let forwarded = Message::signal(MSG_TYPE_USER_SIGNAL, SESSION_MANAGER_UID, signal.to, payload);
        self.send_signal_message(&forwarded).await;

        let session = match self.registry.get_mut(signal.sid) {
            Some(session) => session,
            None => return,
        };
        let caller_state = session.participant_mut(signal.from).state;
        session.participant_mut(signal.to);

        match direct_transition(signal.signal, caller_state) {
            Some((for_caller, for_callee)) => {
                session.participant_mut(signal.from).apply(for_caller);
                session.participant_mut(signal.to).apply(for_callee);
            }
            None if signal.signal.is_call_control() => {
                warn!(
                    sid = signal.sid,
                    from = signal.from,
                    kind = ?signal.signal,
                    state = ?caller_state,
                    "call signal ignored by state guard"
                );
            }
            None => {}
        }
    }

    /// Multi-party branch: apply the mutation, then broadcast the
    /// participant state table to everyone in the session.
    async fn handle_group_signal(&mut self, signal: &Signal) {
        {
            let session = match self.registry.get_mut(signal.sid) {
                Some(session) => session,
                None => return,
            };
            // A direct call only leaves its mode through a membership op.
            if session.mode == CallMode::OneToOne && signal.signal != SignalKind::MemberOp {
                warn!(
                    sid = signal.sid,
                    from = signal.from,
                    kind = ?signal.signal,
                    "multi-party signal ignored in direct-call mode"
                );
                return;
            }
            if session.mode == CallMode::Undecided {
                session.mode = CallMode::Multiple;
            }
        }

        match signal.signal {
            SignalKind::Invite => self.handle_group_invite(signal).await,
            SignalKind::MemberOp => self.handle_member_op(signal).await,
            kind if kind.is_call_control() => {
                let session = match self.registry.get_mut(signal.sid) {
                    Some(session) => session,
                    None => return,
                };
                match session.participants.get_mut(&signal.from) {
                    Some(participant) => match group_transition(kind, participant.state) {
                        Some(change) => participant.apply(change),
                        None => warn!(
                            sid = signal.sid,
                            from = signal.from,
                            kind = ?kind,
                            state = ?participant.state,
                            "call signal ignored by state guard"
                        ),
                    },
                    None => warn!(
                        sid = signal.sid,
                        from = signal.from,
                        kind = ?kind,
                        "call signal from unknown participant"
                    ),
                }
            }
            _ => {}
        }

        self.broadcast_member_state(signal.sid).await;
    }

    /// An invite addressed to the manager joins the caller to the
    /// multi-party call: the manager rings and accepts on the group's
    /// behalf, leaving the caller in-call.
    async fn handle_group_invite(&mut self, signal: &Signal) {
        let accepted = {
            let session = match self.registry.get_mut(signal.sid) {
                Some(session) => session,
                None => return,
            };
            let participant = session.participant_mut(signal.from);
            if participant.in_state(ParticipantState::Idle) {
                participant.apply((ParticipantState::Calling, ParticipantEvent::Invite));
                true
            } else {
                warn!(
                    sid = signal.sid,
                    from = signal.from,
                    state = ?participant.state,
                    "group invite ignored by state guard"
                );
                false
            }
        };
        if !accepted {
            return;
        }

        let ring = Signal::new(SignalKind::Ring, SESSION_MANAGER_UID, signal.from, signal.sid);
        self.send_signal(&ring).await;
        let accept = Signal::new(SignalKind::Accept, SESSION_MANAGER_UID, signal.from, signal.sid);
        self.send_signal(&accept).await;

        if let Some(session) = self.registry.get_mut(signal.sid) {
            session
                .participant_mut(signal.from)
                .apply((ParticipantState::Incall, ParticipantEvent::RecvAccept));
        }
    }

    async fn handle_member_op(&mut self, signal: &Signal) {
        {
            let session = match self.registry.get_mut(signal.sid) {
                Some(session) => session,
                None => return,
            };
            if session.mode == CallMode::OneToOne {
                session.mode = CallMode::Multiple;
                info!(sid = signal.sid, "session promoted to multi-party mode");
            }
            // The operator belongs to the session from here on.
            session.participant_mut(signal.from);
        }

        let op = match signal.member_op() {
            Some(op) => op,
            None => {
                warn!(sid = signal.sid, from = signal.from, "malformed member op");
                return;
            }
        };

        match op.op {
            "invite" => {
                for value in op.members {
                    let uid = match value.as_u64() {
                        Some(uid) => uid,
                        None => {
                            warn!(sid = signal.sid, member = ?value, "member id parse failed");
                            continue;
                        }
                    };
                    let invited = {
                        let session = match self.registry.get_mut(signal.sid) {
                            Some(session) => session,
                            None => return,
                        };
                        let participant = session.participant_mut(uid);
                        match member_invite_transition(participant.state) {
                            Some(change) => {
                                participant.apply(change);
                                true
                            }
                            None => {
                                warn!(
                                    sid = signal.sid,
                                    uid,
                                    state = ?participant.state,
                                    "member not idle, cannot invite"
                                );
                                false
                            }
                        }
                    };
                    if invited {
                        let invite =
                            Signal::new(SignalKind::Invite, SESSION_MANAGER_UID, uid, signal.sid);
                        self.send_signal(&invite).await;
                    }
                }
            }
            "kick" => {
                for value in op.members {
                    let uid = match value.as_u64() {
                        Some(uid) => uid,
                        None => {
                            warn!(sid = signal.sid, member = ?value, "member id parse failed");
                            continue;
                        }
                    };
                    let kicked = {
                        let session = match self.registry.get_mut(signal.sid) {
                            Some(session) => session,
                            None => return,
                        };
                        let participant = session.participant_mut(uid);
                        match member_kick_transition(participant.state) {
                            Some(change) => {
                                participant.apply(change);
                                true
                            }
                            None => {
                                warn!(
                                    sid = signal.sid,
                                    uid,
                                    state = ?participant.state,
                                    "member not in call, cannot kick"
                                );
                                false
                            }
                        }
                    };
                    if kicked {
                        let end = Signal::new(SignalKind::End, SESSION_MANAGER_UID, uid, signal.sid);
                        self.send_signal(&end).await;
                    }
                }
            }
            other => {
                warn!(sid = signal.sid, op = other, "unrecognized member op");
            }
        }
    }

    /// One shared `{uid: {state, event}}` table, sent individually to
    /// every participant of the session.
    async fn broadcast_member_state(&mut self, sid: u64) {
        let (uids, info) = {
            let session = match self.registry.get(sid) {
                Some(session) => session,
                None => return,
            };
            let mut states = Map::new();
            for participant in session.participants.values() {
                let mut entry = Map::new();
                entry.insert("state".into(), Value::from(participant.state as u16));
                entry.insert("event".into(), Value::from(participant.event as u16));
                states.insert(participant.uid.to_string(), Value::Object(entry));
            }
            let mut info = Map::new();
            info.insert("state".into(), Value::Object(states));

            let uids: Vec<u64> = session.participants.keys().copied().collect();
            (uids, info)
        };

        for uid in uids {
            let mut state = Signal::new(SignalKind::MemberState, SESSION_MANAGER_UID, uid, sid);
            state.info = info.clone();
            self.send_signal(&state).await;
        }
    }

    async fn register_to_relays(&self) {
        let msg = Message::signal(MSG_TYPE_USER_REG, SESSION_MANAGER_UID, 0, Vec::new());
        self.send_signal_message_by_relays(&msg).await;
    }

    /// Marshal a signal into an envelope addressed to `signal.to` and send
    /// it. A marshal failure skips this one message.
    async fn send_signal(&self, signal: &Signal) {
        match signal.marshal() {
            Ok(payload) => {
                let msg =
                    Message::signal(MSG_TYPE_USER_SIGNAL, SESSION_MANAGER_UID, signal.to, payload);
                self.send_signal_message(&msg).await;
            }
            Err(e) => warn!(error = %e, "signal marshal failed"),
        }
    }

    /// Delivery hook: today every outbound goes through the relays; a
    /// push-notification path can slot in here later.
    async fn send_signal_message(&self, msg: &Message) {
        self.send_signal_message_by_relays(msg).await;
    }

    /// Encode once, then write to every relay. Write errors are logged
    /// and the remaining relays still get the message.
    async fn send_signal_message_by_relays(&self, msg: &Message) {
        let data = msg.encode();
        for relay in &self.relays {
            if let Err(e) = self.socket.send_to(&data, relay).await {
                error!(relay = %relay, error = %e, "udp write failed");
            }
        }
    }

    fn snapshot(&self, sid: u64) -> Option<SessionSnapshot> {
        self.registry.get(sid).map(|session| SessionSnapshot {
            sid: session.sid,
            mode: session.mode,
            participants: session
                .participants
                .values()
                .map(|p| (p.uid, (p.state, p.event)))
                .collect(),
        })
    }
}
