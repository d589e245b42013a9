//! Integration tests for remote cursor presence.
//!
//! These tests start a real server and connect two sessions, verifying
//! that cursor moves travel through the shared document and come out as
//! drawn indicators on the other side.

use cellsync_collab::client::{self, Connection};
use cellsync_collab::host::HeadlessNotebook;
use cellsync_collab::presence::{CursorColor, Indicator};
use cellsync_collab::protocol::ParticipantInfo;
use cellsync_collab::replica::RemoteDocument;
use cellsync_collab::server::{ServerConfig, SyncServer};
use cellsync_collab::{Session, SessionConfig};
use cellsync_core::{SharedDocument, Unit};
use tokio::time::{Duration, Instant};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return its URL.
async fn start_test_server() -> String {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        heartbeat_interval_secs: 30,
    };
    let server = SyncServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

struct Peer {
    info: ParticipantInfo,
    session: Session<HeadlessNotebook>,
    conn: Connection,
}

impl Peer {
    fn new(info: ParticipantInfo, replica: cellsync_collab::Replica, conn: Connection) -> Self {
        let config = SessionConfig { display_name: info.name.clone(), ..SessionConfig::default() };
        let mut session = Session::new(replica, HeadlessNotebook::new(), config);
        session.start().unwrap();
        Self { info, session, conn }
    }

    async fn exchange(&mut self) {
        self.conn.send_all(self.session.take_outgoing()).await.unwrap();
        while let Some(message) = self.conn.try_recv() {
            self.session.receive(message).unwrap();
            self.conn.send_all(self.session.take_outgoing()).await.unwrap();
        }
    }
}

/// Create a two-unit document as Alice and let Bob join it.
async fn connect_pair(url: &str) -> (Peer, Peer) {
    let snapshot = SharedDocument::new(vec![Unit::code("hello world"), Unit::code("x = 1")])
        .to_value()
        .unwrap();
    let alice = ParticipantInfo::new("Alice");
    let (replica, conn) = client::create(url, alice.clone(), snapshot).await.unwrap();
    let mut alice = Peer::new(alice, replica, conn);
    exchange_until(&mut [&mut alice], |_| true).await;

    let bob = ParticipantInfo::new("Bob");
    let (replica, conn) = client::join(url, alice.session.replica().doc_id(), bob.clone()).await.unwrap();
    let mut bob = Peer::new(bob, replica, conn);
    exchange_until(&mut [&mut alice, &mut bob], |p| p.session.document().participants().len() == 2).await;
    (alice, bob)
}

/// Keep exchanging until `done` holds for every peer, or fail after 5s.
async fn exchange_until(peers: &mut [&mut Peer], done: impl Fn(&Peer) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        for peer in peers.iter_mut() {
            peer.exchange().await;
        }
        if peers.iter().all(|peer| peer.session.is_settled() && done(peer)) {
            return;
        }
        assert!(Instant::now() < deadline, "peers did not reach the expected state");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ─── Presence over the network ───────────────────────────────────

#[tokio::test]
async fn test_cursor_position_sync() {
    let url = start_test_server().await;
    let (mut alice, mut bob) = connect_pair(&url).await;
    let alice_id = alice.info.id;

    alice.session.handle_cursor(0, 5, 5, true).unwrap();
    exchange_until(&mut [&mut alice, &mut bob], |p| {
        p.info.name == "Alice" || p.session.presence().renderer().get(&alice_id).is_some()
    })
    .await;

    assert_eq!(
        bob.session.presence().renderer().get(&alice_id),
        Some(Indicator::Caret { unit: 0, at: 5 })
    );
    assert_eq!(bob.session.presence().cursor_of(&alice_id).map(|c| c.unit_index), Some(0));
}

#[tokio::test]
async fn test_selection_sync() {
    let url = start_test_server().await;
    let (mut alice, mut bob) = connect_pair(&url).await;
    let bob_id = bob.info.id;

    // Backwards selection is drawn normalised.
    bob.session.handle_cursor(1, 4, 1, true).unwrap();
    exchange_until(&mut [&mut alice, &mut bob], |p| {
        p.info.name == "Bob" || p.session.presence().renderer().get(&bob_id).is_some()
    })
    .await;

    assert_eq!(
        alice.session.presence().renderer().get(&bob_id),
        Some(Indicator::Range { unit: 1, start: 1, end: 4 })
    );
    assert_eq!(alice.session.presence().renderer().labels(), &[(bob_id, 1)]);
}

#[tokio::test]
async fn test_drag_sent_on_release() {
    let url = start_test_server().await;
    let (mut alice, mut bob) = connect_pair(&url).await;
    let alice_id = alice.info.id;

    alice.session.mouse_down();
    alice.session.handle_cursor(0, 0, 3, true).unwrap();
    alice.session.handle_cursor(0, 0, 8, true).unwrap();
    exchange_until(&mut [&mut alice, &mut bob], |_| true).await;
    assert!(bob.session.presence().renderer().get(&alice_id).is_none());

    alice.session.mouse_up().unwrap();
    exchange_until(&mut [&mut alice, &mut bob], |p| {
        p.info.name == "Alice" || p.session.presence().renderer().get(&alice_id).is_some()
    })
    .await;
    assert_eq!(
        bob.session.presence().renderer().get(&alice_id),
        Some(Indicator::Range { unit: 0, start: 0, end: 8 })
    );
    assert_eq!(bob.session.replica().get_data()["presence"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_leave_clears_indicator() {
    let url = start_test_server().await;
    let (mut alice, mut bob) = connect_pair(&url).await;
    let alice_id = alice.info.id;

    alice.session.handle_cursor(1, 2, 2, true).unwrap();
    exchange_until(&mut [&mut alice, &mut bob], |p| {
        p.info.name == "Alice" || p.session.presence().remote_count() == 1
    })
    .await;

    alice.session.leave().unwrap();
    exchange_until(&mut [&mut alice, &mut bob], |p| {
        p.info.name == "Alice" || p.session.presence().remote_count() == 0
    })
    .await;

    assert!(bob.session.presence().renderer().get(&alice_id).is_none());
    assert_eq!(bob.session.replica().get_data()["presence"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn test_color_stability() {
    let url = start_test_server().await;
    let (mut alice, mut bob) = connect_pair(&url).await;
    let alice_id = alice.info.id;

    alice.session.handle_cursor(0, 1, 1, true).unwrap();
    exchange_until(&mut [&mut alice, &mut bob], |p| {
        p.info.name == "Alice" || p.session.presence().renderer().color(&alice_id).is_some()
    })
    .await;

    let drawn = bob.session.presence().renderer().color(&alice_id).unwrap();
    assert_eq!(drawn, alice.info.color());
    assert_eq!(drawn, CursorColor::from_uuid(alice_id));
}
