//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use cellsync_collab::client::{self, Connection, JoinError};
use cellsync_collab::host::{HeadlessNotebook, NotebookEditor};
use cellsync_collab::protocol::{ClientMessage, ParticipantInfo, ServerMessage};
use cellsync_collab::replica::{RemoteDocument, SourceId};
use cellsync_collab::server::{ServerConfig, SyncServer};
use cellsync_collab::{Session, SessionConfig};
use cellsync_core::{paths, Component, SharedDocument, Unit};
use tokio::time::{timeout, Duration, Instant};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return it with its URL.
async fn start_test_server() -> (Arc<SyncServer>, String) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        heartbeat_interval_secs: 30,
    };
    let server = Arc::new(SyncServer::new(config));
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, format!("ws://127.0.0.1:{port}"))
}

fn snapshot(units: Vec<Unit>) -> serde_json::Value {
    SharedDocument::new(units).to_value().unwrap()
}

// ─── Sessions over the network ──────────────────────────────────────

struct Peer {
    session: Session<HeadlessNotebook>,
    conn: Connection,
}

impl Peer {
    async fn create(url: &str, name: &str, units: Vec<Unit>) -> Self {
        let (replica, conn) = client::create(url, ParticipantInfo::new(name), snapshot(units)).await.unwrap();
        Self::start(replica, conn, name)
    }

    async fn join(url: &str, name: &str, doc_id: &str) -> Self {
        let (replica, conn) = client::join(url, doc_id, ParticipantInfo::new(name)).await.unwrap();
        Self::start(replica, conn, name)
    }

    fn start(replica: cellsync_collab::Replica, conn: Connection, name: &str) -> Self {
        let config = SessionConfig { display_name: name.to_string(), ..SessionConfig::default() };
        let mut session = Session::new(replica, HeadlessNotebook::new(), config);
        session.start().unwrap();
        Self { session, conn }
    }

    async fn exchange(&mut self) {
        self.conn.send_all(self.session.take_outgoing()).await.unwrap();
        while let Some(message) = self.conn.try_recv() {
            self.session.receive(message).unwrap();
            self.conn.send_all(self.session.take_outgoing()).await.unwrap();
        }
    }
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

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, url) = start_test_server().await;

    // Connect raw WebSocket
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_create_then_join_same_document() {
    let (server, url) = start_test_server().await;

    let (created, _alice) = client::create(&url, ParticipantInfo::new("Alice"), snapshot(vec![Unit::code("x")]))
        .await
        .unwrap();
    assert_eq!(created.version(), 0);

    let (joined, _bob) = client::join(&url, created.doc_id(), ParticipantInfo::new("Bob")).await.unwrap();
    assert_eq!(joined.doc_id(), created.doc_id());
    assert_eq!(joined.get_data()["units"][0]["source"], "x");

    assert_eq!(server.room_count().await, 1);
    let (version, _) = server.document(created.doc_id()).await.unwrap();
    assert_eq!(version, 0);
}

#[tokio::test]
async fn test_join_missing_document() {
    let (_server, url) = start_test_server().await;

    let result = client::join(&url, "does-not-exist", ParticipantInfo::new("Alice")).await;
    match result {
        Err(JoinError::DocumentNotFound(doc_id)) => assert_eq!(doc_id, "does-not-exist"),
        Err(other) => panic!("Expected DocumentNotFound, got {other:?}"),
        Ok(_) => panic!("Expected DocumentNotFound, got a replica"),
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let (_server, url) = start_test_server().await;
    let (_replica, mut conn) = client::create(&url, ParticipantInfo::new("Alice"), snapshot(vec![])).await.unwrap();

    conn.send(ClientMessage::Ping).await.unwrap();
    let reply = conn.recv_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply, ServerMessage::Pong);
}

#[tokio::test]
async fn test_ack_to_sender_op_to_others() {
    let (server, url) = start_test_server().await;
    let alice = ParticipantInfo::new("Alice");
    let (mut ra, mut ca) = client::create(&url, alice.clone(), snapshot(vec![Unit::code("")])).await.unwrap();
    let (_rb, mut cb) = client::join(&url, ra.doc_id(), ParticipantInfo::new("Bob")).await.unwrap();

    let op = vec![Component::TextInsert { path: paths::unit_source(0), offset: 0, text: "hi".into() }];
    ra.submit_operation(op.clone(), SourceId::next()).unwrap();
    ca.send_all(ra.take_outgoing()).await.unwrap();

    let ack = ca.recv_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(ack, ServerMessage::Ack { version: 1 });
    ra.receive(ack).unwrap();
    assert!(!ra.has_unacknowledged());

    let forwarded = cb.recv_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(forwarded, ServerMessage::Op { version: 1, ops: op, participant: alice.id });

    let (version, doc) = server.document(ra.doc_id()).await.unwrap();
    assert_eq!(version, 1);
    assert_eq!(doc["units"][0]["source"], "hi");
}

#[tokio::test]
async fn test_stale_submit_is_transformed() {
    let (_server, url) = start_test_server().await;
    let (mut ra, mut ca) = client::create(&url, ParticipantInfo::new("Alice"), snapshot(vec![Unit::code("ab")]))
        .await
        .unwrap();
    let (mut rb, mut cb) = client::join(&url, ra.doc_id(), ParticipantInfo::new("Bob")).await.unwrap();

    // Both edit at version 0.
    ra.submit_operation(
        vec![Component::TextInsert { path: paths::unit_source(0), offset: 0, text: "<".into() }],
        SourceId::next(),
    )
    .unwrap();
    rb.submit_operation(
        vec![Component::TextInsert { path: paths::unit_source(0), offset: 2, text: ">".into() }],
        SourceId::next(),
    )
    .unwrap();
    ca.send_all(ra.take_outgoing()).await.unwrap();
    let ack = ca.recv_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(ack, ServerMessage::Ack { version: 1 });
    ra.receive(ack).unwrap();
    cb.send_all(rb.take_outgoing()).await.unwrap();

    for _ in 0..2 {
        let message = cb.recv_timeout(Duration::from_secs(2)).await.unwrap();
        rb.receive(message).unwrap();
    }
    let message = ca.recv_timeout(Duration::from_secs(2)).await.unwrap();
    assert!(matches!(message, ServerMessage::Op { version: 2, .. }));
    ra.receive(message).unwrap();

    assert_eq!(ra.get_data()["units"][0]["source"], "<ab>");
    assert_eq!(rb.get_data()["units"][0]["source"], "<ab>");
}

#[tokio::test]
async fn test_sessions_edit_over_network() {
    let (server, url) = start_test_server().await;
    let mut alice = Peer::create(&url, "Alice", vec![]).await;
    exchange_until(&mut [&mut alice], |p| p.session.is_host()).await;
    let doc_id = alice.session.replica().doc_id().to_string();
    let mut bob = Peer::join(&url, "Bob", &doc_id).await;

    exchange_until(&mut [&mut alice, &mut bob], |p| p.session.document().participants().len() == 2).await;
    assert!(alice.session.is_host());
    assert!(!bob.session.is_host());

    alice.session.editor_mut().user_insert(0, Unit::code("print(1)"));
    alice.session.pump().unwrap();
    exchange_until(&mut [&mut alice, &mut bob], |p| p.session.editor().sources() == ["print(1)"]).await;

    let mut surface = alice.session.editor().surface(0).unwrap();
    surface.erase(6, 7);
    alice.session.handle_text_change(0).unwrap();
    exchange_until(&mut [&mut alice, &mut bob], |p| p.session.editor().sources() == ["print()"]).await;

    let (_, doc) = server.document(&doc_id).await.unwrap();
    assert_eq!(doc["units"][0]["source"], "print()");
    assert_eq!(bob.session.editor().unit_count(), 1);
}

#[tokio::test]
async fn test_host_leaves_and_room_closes() {
    let (server, url) = start_test_server().await;
    let mut alice = Peer::create(&url, "Alice", vec![Unit::code("")]).await;
    exchange_until(&mut [&mut alice], |p| p.session.is_host()).await;
    let doc_id = alice.session.replica().doc_id().to_string();
    let mut bob = Peer::join(&url, "Bob", &doc_id).await;
    exchange_until(&mut [&mut alice, &mut bob], |p| p.session.document().participants().len() == 2).await;

    alice.session.leave().unwrap();
    exchange_until(&mut [&mut alice, &mut bob], |_| true).await;
    alice.conn.close().await.unwrap();
    exchange_until(&mut [&mut bob], |p| p.session.is_host()).await;

    let (_, doc) = server.document(&doc_id).await.unwrap();
    assert_eq!(SharedDocument::host_of(&doc), Some(bob.session.participant()));
    assert_eq!(SharedDocument::participants_of(&doc), vec![bob.session.participant()]);

    bob.session.leave().unwrap();
    exchange_until(&mut [&mut bob], |_| true).await;
    bob.conn.close().await.unwrap();

    let closed = timeout(Duration::from_secs(2), async {
        while server.room_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(closed.is_ok(), "Room should close once everyone left");
    assert!(server.document(&doc_id).await.is_none());
}

#[tokio::test]
async fn test_server_stats_tracking() {
    let (server, url) = start_test_server().await;
    let (mut ra, ca) = client::create(&url, ParticipantInfo::new("Alice"), snapshot(vec![Unit::code("")]))
        .await
        .unwrap();
    ra.submit_operation(
        vec![Component::TextInsert { path: paths::unit_source(0), offset: 0, text: "x".into() }],
        SourceId::next(),
    )
    .unwrap();
    ca.send_all(ra.take_outgoing()).await.unwrap();
    // Out of range: rejected by the authority.
    ca.send(ClientMessage::Submit { version: 99, ops: Vec::new() }).await.unwrap();

    let done = timeout(Duration::from_secs(2), async {
        loop {
            let stats = server.stats().await;
            if stats.committed_ops == 1 && stats.rejected_ops == 1 {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stats should reflect the submissions");

    assert_eq!(done.total_connections, 1);
    assert_eq!(done.active_connections, 1);
    assert_eq!(done.active_rooms, 1);
    assert!(done.total_messages >= 3);
}
