//! End-to-end signaling tests over loopback UDP.
//!
//! Each test runs a real session manager bound to an ephemeral port, with
//! a test socket standing in for the relay fleet. Clients talk to the
//! manager exactly like production peers: obfuscated envelopes carrying
//! JSON signals. Everything the manager emits fans out to the relay
//! socket, where the tests observe it.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test signaling_flow -- --nocapture

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use confab::{
    CallMode, Message, ParticipantEvent, ParticipantState, SessionManager, Signal, SignalKind,
    SmConfig, MSG_TYPE_USER_REG, MSG_TYPE_USER_SIGNAL, SESSION_MANAGER_UID,
};

/// One-time tracing initialization
static INIT: Once = Once::new();

/// Initialize tracing for tests. Use RUST_LOG=debug for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("warn")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait before declaring that no datagram arrives.
const QUIET_PERIOD: Duration = Duration::from_millis(300);

struct TestBed {
    manager: SessionManager,
    manager_addr: SocketAddr,
    relay: UdpSocket,
    client: UdpSocket,
}

impl TestBed {
    /// Start a manager whose only relay is a local test socket, and
    /// consume the initial presence registration.
    async fn start() -> Self {
        init_tracing();

        let relay = UdpSocket::bind("127.0.0.1:0").await.expect("bind relay");
        let config = SmConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            relays: vec![relay.local_addr().unwrap()],
            register_interval: Duration::from_secs(200),
            sid_seed: Some(7),
        };
        let manager = SessionManager::start(config).await.expect("start manager");
        let manager_addr = manager.local_addr().unwrap();

        let reg = recv_message(&relay).await;
        assert_eq!(reg.msg_type, MSG_TYPE_USER_REG);
        assert_eq!(reg.from, SESSION_MANAGER_UID);

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
        Self {
            manager,
            manager_addr,
            relay,
            client,
        }
    }

    async fn send_signal(&self, signal: &Signal) {
        let payload = signal.marshal().unwrap();
        let msg = Message::signal(MSG_TYPE_USER_SIGNAL, signal.from, signal.to, payload);
        self.send_raw(&msg.encode()).await;
    }

    async fn send_raw(&self, datagram: &[u8]) {
        self.client
            .send_to(datagram, self.manager_addr)
            .await
            .expect("send to manager");
    }

    /// Receive one signal from the relay socket.
    async fn recv_signal(&self) -> (Message, Signal) {
        let msg = recv_message(&self.relay).await;
        assert_eq!(msg.msg_type, MSG_TYPE_USER_SIGNAL);
        let signal = Signal::unmarshal(&msg.payload).expect("signal payload");
        (msg, signal)
    }

    async fn assert_quiet(&self) {
        let mut buf = [0u8; 2048];
        let outcome = timeout(QUIET_PERIOD, self.relay.recv_from(&mut buf)).await;
        assert!(outcome.is_err(), "unexpected datagram reached the relay");
    }

    /// Run the SidRequest round-trip and return the allocated sid.
    async fn allocate_session(&self, from: u64) -> u64 {
        self.send_signal(&Signal::new(SignalKind::SidRequest, from, SESSION_MANAGER_UID, 0))
            .await;
        let (msg, signal) = self.recv_signal().await;
        assert_eq!(msg.to, from);
        assert_eq!(signal.signal, SignalKind::SidCreated);
        assert_eq!(signal.from, SESSION_MANAGER_UID);
        assert_eq!(signal.to, from);
        assert_ne!(signal.sid, 0);
        signal.sid
    }
}

async fn recv_message(socket: &UdpSocket) -> Message {
    let mut buf = [0u8; 2048];
    let (len, _) = timeout(TEST_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .expect("recv failed");
    Message::decode(&buf[..len]).expect("undecodable datagram")
}

// ============================================================================
// Session Allocation
// ============================================================================

#[tokio::test]
async fn sid_allocation_round_trip() {
    let bed = TestBed::start().await;

    let sid = bed.allocate_session(42).await;

    let snapshot = bed.manager.session_snapshot(sid).await.expect("session exists");
    assert_eq!(snapshot.mode, CallMode::Undecided);
    assert!(snapshot.participants.is_empty());
    assert_eq!(bed.manager.session_count().await, 1);

    bed.manager.stop().await;
}

#[tokio::test]
async fn signals_without_session_are_dropped() {
    let bed = TestBed::start().await;

    // Unassigned session id.
    bed.send_signal(&Signal::new(SignalKind::Invite, 42, 77, 0)).await;
    // Session that was never allocated.
    bed.send_signal(&Signal::new(SignalKind::Invite, 42, 77, 0xDEAD_BEEF)).await;

    bed.assert_quiet().await;
    assert_eq!(bed.manager.session_count().await, 0);

    bed.manager.stop().await;
}

// ============================================================================
// Direct Calls
// ============================================================================

#[tokio::test]
async fn direct_invite_forwards_and_deduplicates() {
    let bed = TestBed::start().await;
    let sid = bed.allocate_session(42).await;

    let invite = Signal::new(SignalKind::Invite, 42, 77, sid);
    let datagram = Message::signal(
        MSG_TYPE_USER_SIGNAL,
        invite.from,
        invite.to,
        invite.marshal().unwrap(),
    )
    .encode();

    bed.send_raw(&datagram).await;
    let (msg, forwarded) = bed.recv_signal().await;
    assert_eq!(msg.to, 77);
    assert_eq!(forwarded, invite);

    let snapshot = bed.manager.session_snapshot(sid).await.unwrap();
    assert_eq!(snapshot.mode, CallMode::OneToOne);
    assert_eq!(
        snapshot.participants[&42],
        (ParticipantState::Calling, ParticipantEvent::Invite)
    );
    assert_eq!(
        snapshot.participants[&77],
        (ParticipantState::Called, ParticipantEvent::RecvInvite)
    );

    // The identical payload arriving again (second relay path) must not
    // be forwarded a second time.
    bed.send_raw(&datagram).await;
    bed.assert_quiet().await;

    bed.manager.stop().await;
}

#[tokio::test]
async fn direct_accept_then_end() {
    let bed = TestBed::start().await;
    let sid = bed.allocate_session(42).await;

    bed.send_signal(&Signal::new(SignalKind::Invite, 42, 77, sid)).await;
    bed.recv_signal().await;

    bed.send_signal(&Signal::new(SignalKind::Accept, 77, 42, sid)).await;
    let (msg, accept) = bed.recv_signal().await;
    assert_eq!(msg.to, 42);
    assert_eq!(accept.signal, SignalKind::Accept);

    let snapshot = bed.manager.session_snapshot(sid).await.unwrap();
    assert_eq!(
        snapshot.participants[&77],
        (ParticipantState::Incall, ParticipantEvent::Accept)
    );
    assert_eq!(
        snapshot.participants[&42],
        (ParticipantState::Incall, ParticipantEvent::RecvAccept)
    );

    bed.send_signal(&Signal::new(SignalKind::End, 42, 77, sid)).await;
    let (_, end) = bed.recv_signal().await;
    assert_eq!(end.signal, SignalKind::End);

    let snapshot = bed.manager.session_snapshot(sid).await.unwrap();
    assert_eq!(
        snapshot.participants[&42],
        (ParticipantState::Idle, ParticipantEvent::End)
    );
    assert_eq!(
        snapshot.participants[&77],
        (ParticipantState::Idle, ParticipantEvent::RecvEnd)
    );

    bed.manager.stop().await;
}

// ============================================================================
// Multi-Party Calls
// ============================================================================

#[tokio::test]
async fn member_op_promotes_and_fans_out_state() {
    let bed = TestBed::start().await;
    let sid = bed.allocate_session(100).await;

    let mut member_op = Signal::new(SignalKind::MemberOp, 100, SESSION_MANAGER_UID, sid);
    member_op
        .info
        .insert("op".into(), serde_json::json!("invite"));
    member_op
        .info
        .insert("members".into(), serde_json::json!([200u64, 300u64]));
    bed.send_signal(&member_op).await;

    // Per-target invites are emitted in member order, then one MemberState
    // per participant (operator included) in table order.
    let mut invites = Vec::new();
    let mut member_states = HashMap::new();
    for _ in 0..5 {
        let (msg, signal) = bed.recv_signal().await;
        match signal.signal {
            SignalKind::Invite => {
                assert_eq!(signal.from, SESSION_MANAGER_UID);
                assert_eq!(signal.sid, sid);
                invites.push(msg.to);
            }
            SignalKind::MemberState => {
                member_states.insert(msg.to, signal);
            }
            other => panic!("unexpected signal kind {:?}", other),
        }
    }
    assert_eq!(invites, vec![200, 300]);

    let mut recipients: Vec<u64> = member_states.keys().copied().collect();
    recipients.sort_unstable();
    assert_eq!(recipients, vec![100, 200, 300]);

    let state_table = member_states[&100].info["state"].as_object().unwrap();
    assert_eq!(state_table.len(), 3);
    assert_eq!(
        state_table["200"]["state"].as_u64().unwrap(),
        ParticipantState::Called as u64
    );
    assert_eq!(
        state_table["200"]["event"].as_u64().unwrap(),
        ParticipantEvent::RecvInvite as u64
    );
    assert_eq!(
        state_table["100"]["state"].as_u64().unwrap(),
        ParticipantState::Idle as u64
    );

    let snapshot = bed.manager.session_snapshot(sid).await.unwrap();
    assert_eq!(snapshot.mode, CallMode::Multiple);
    assert_eq!(
        snapshot.participants[&200],
        (ParticipantState::Called, ParticipantEvent::RecvInvite)
    );
    assert_eq!(
        snapshot.participants[&300],
        (ParticipantState::Called, ParticipantEvent::RecvInvite)
    );

    // Once multi-party, a direct-call signal is refused outright.
    bed.send_signal(&Signal::new(SignalKind::Invite, 42, 77, sid)).await;
    bed.assert_quiet().await;
    assert_eq!(bed.manager.session_snapshot(sid).await.unwrap().mode, CallMode::Multiple);

    bed.manager.stop().await;
}

#[tokio::test]
async fn group_invite_is_rung_and_accepted() {
    let bed = TestBed::start().await;
    let sid = bed.allocate_session(100).await;

    bed.send_signal(&Signal::new(SignalKind::Invite, 100, SESSION_MANAGER_UID, sid))
        .await;

    let (msg, ring) = bed.recv_signal().await;
    assert_eq!(msg.to, 100);
    assert_eq!(ring.signal, SignalKind::Ring);
    let (_, accept) = bed.recv_signal().await;
    assert_eq!(accept.signal, SignalKind::Accept);
    let (_, state) = bed.recv_signal().await;
    assert_eq!(state.signal, SignalKind::MemberState);

    let snapshot = bed.manager.session_snapshot(sid).await.unwrap();
    assert_eq!(snapshot.mode, CallMode::Multiple);
    assert_eq!(
        snapshot.participants[&100],
        (ParticipantState::Incall, ParticipantEvent::RecvAccept)
    );

    bed.manager.stop().await;
}

// ============================================================================
// Presence & Lifecycle
// ============================================================================

#[tokio::test]
async fn presence_is_reregistered_on_the_tick() {
    init_tracing();

    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = SmConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        relays: vec![relay.local_addr().unwrap()],
        register_interval: Duration::from_millis(150),
        sid_seed: Some(7),
    };
    let manager = SessionManager::start(config).await.unwrap();

    // Initial registration at start, then one per tick.
    for _ in 0..3 {
        let msg = recv_message(&relay).await;
        assert_eq!(msg.msg_type, MSG_TYPE_USER_REG);
        assert_eq!(msg.from, SESSION_MANAGER_UID);
    }

    manager.stop().await;
}

#[tokio::test]
async fn garbage_datagrams_do_not_kill_the_loop() {
    let bed = TestBed::start().await;

    // Too short, then random noise the codec rejects as a signal.
    bed.send_raw(&[0x01, 0x02, 0x03]).await;
    bed.send_raw(&[0xAB; 64]).await;

    // The loop keeps serving.
    let sid = bed.allocate_session(5).await;
    assert_ne!(sid, 0);

    bed.manager.stop().await;
}
