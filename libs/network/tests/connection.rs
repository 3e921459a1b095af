//! End-to-end connection protocol tests.
//!
//! Real loopback sockets, no mocks. Each test stands up a reactor (or two,
//! when client and server must not share a loop) and drives the blocking
//! session façade the way application threads do.

use network::{
    ClientEndpoint, MemoryStore, NetConfig, NetError, Outbound, Reactor, Server, Session, Store,
};
use protocol::{ClientRequest, ConnectionId, FieldWrite, ServerEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tight timings so dead-peer detection is observable in test time.
fn fast_config() -> NetConfig {
    NetConfig {
        heartbeat: Duration::from_millis(100),
        dead_multiplier: 2,
        max_frame_bytes: 1024 * 1024,
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn connect_without_retry_fails_on_first_refusal() {
    let reactor = Reactor::spawn().unwrap();
    let port = free_port();

    let started = Instant::now();
    let err = Session::connect(
        reactor.handle(),
        "127.0.0.1",
        port,
        Duration::from_secs(5),
        false,
    )
    .unwrap_err();

    assert!(matches!(err, NetError::ConnectionRefused { .. }));
    // Fails immediately, not after burning the whole budget.
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn connect_with_retry_waits_for_the_listener() {
    let reactor = Reactor::spawn().unwrap();
    let port = free_port();

    // The listener appears a few retries into the budget.
    let handle = reactor.handle().clone();
    let server_thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        let store = Arc::new(MemoryStore::new());
        Server::bind(&handle, "127.0.0.1", port, store, NetConfig::default()).unwrap()
    });

    let session = Session::connect(
        reactor.handle(),
        "127.0.0.1",
        port,
        Duration::from_secs(10),
        true,
    )
    .unwrap();

    assert!(session.is_connected());
    assert!(session.connection_id().is_some());

    let server = server_thread.join().unwrap();
    server.stop();
}

#[test]
fn transact_and_subscription_roundtrip() {
    let reactor = Reactor::spawn().unwrap();
    let store = Arc::new(MemoryStore::new());
    let server = Server::bind(
        reactor.handle(),
        "127.0.0.1",
        0,
        store,
        NetConfig::default(),
    )
    .unwrap();
    let port = server.local_addr().port();

    let connect = || {
        Session::connect(
            reactor.handle(),
            "127.0.0.1",
            port,
            Duration::from_secs(5),
            false,
        )
        .unwrap()
    };
    let writer = connect();
    let watcher = connect();

    let feed = watcher.subscribe("services").unwrap();
    let snapshot = feed.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(snapshot.values.is_empty(), "empty space, empty snapshot");

    let outcome = writer
        .transact(
            vec![FieldWrite::set("services/foo", b"3".to_vec())],
            Duration::from_secs(2),
        )
        .unwrap();
    assert!(outcome.success);

    let update = feed.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(update.space, "services");
    assert_eq!(update.values.len(), 1);
    assert_eq!(update.values[0].key, "services/foo");

    // A late subscriber gets the write as its initial snapshot.
    let late_feed = writer.subscribe("services").unwrap();
    let late_snapshot = late_feed.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(late_snapshot.values.len(), 1);

    server.stop();
}

#[test]
fn per_sender_outbound_order_is_preserved() {
    let reactor = Reactor::spawn().unwrap();
    let store = Arc::new(MemoryStore::new());
    let server = Server::bind(
        reactor.handle(),
        "127.0.0.1",
        0,
        store,
        NetConfig::default(),
    )
    .unwrap();
    let port = server.local_addr().port();

    let watcher = Session::connect(
        reactor.handle(),
        "127.0.0.1",
        port,
        Duration::from_secs(5),
        false,
    )
    .unwrap();
    let feed = watcher.subscribe("seq").unwrap();
    feed.recv_timeout(Duration::from_secs(2)).unwrap(); // snapshot

    // Raw endpoint so transactions can be queued without waiting on
    // responses; the receiver must observe the sender's call order.
    let config = NetConfig::default();
    let (endpoint, handler_slot) = reactor
        .handle()
        .run_with_timeout("connect", Duration::from_secs(5), async move {
            ClientEndpoint::connect("127.0.0.1", port, &config).await
        })
        .unwrap()
        .unwrap();
    let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
    handler_slot.send(events_tx).unwrap();

    const N: u32 = 100;
    for i in 0..N {
        endpoint
            .send(&ClientRequest::Transaction {
                id: u64::from(i) + 1,
                writes: vec![FieldWrite::set("seq/counter", i.to_be_bytes().to_vec())],
            })
            .unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < N as usize {
        let update = feed
            .recv_timeout(Duration::from_secs(2))
            .expect("subscription update missing");
        for write in update.values {
            let bytes: [u8; 4] = write.value.unwrap().try_into().unwrap();
            seen.push(u32::from_be_bytes(bytes));
        }
    }
    assert_eq!(seen, (0..N).collect::<Vec<_>>());

    server.stop();
}

#[test]
fn silent_peer_is_evicted_by_the_liveness_sweep() {
    let reactor = Reactor::spawn().unwrap();
    let store = Arc::new(MemoryStore::new());
    let config = fast_config();
    let server = Server::bind(reactor.handle(), "127.0.0.1", 0, store, config.clone()).unwrap();
    let port = server.local_addr().port();

    // Raw transport that completes the handshake but never heartbeats.
    let max_frame = config.max_frame_bytes;
    let (stream, initialize) = reactor
        .handle()
        .run_with_timeout("connect", Duration::from_secs(2), async move {
            let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .unwrap();
            let event: Option<ServerEvent> =
                protocol::read_frame(&mut stream, max_frame).await.unwrap();
            (stream, event)
        })
        .unwrap();
    // The handshake proves the connection registered.
    assert!(matches!(initialize, Some(ServerEvent::Initialize { .. })));

    // Dead threshold is 200ms and the sweep runs every 100ms; the transport
    // is still open, so only the sweep can be responsible for the drop.
    wait_until("liveness sweep to evict the silent peer", Duration::from_secs(2), || {
        server.connection_count() == 0
    });

    drop(stream);
    server.stop();
}

#[test]
fn evicted_session_observes_disconnected() {
    let reactor = Reactor::spawn().unwrap();
    let store = Arc::new(MemoryStore::new());
    let server_config = fast_config();
    let server = Server::bind(reactor.handle(), "127.0.0.1", 0, store, server_config).unwrap();
    let port = server.local_addr().port();

    // This client heartbeats far too slowly to survive the server's sweep.
    let client_config = NetConfig {
        heartbeat: Duration::from_secs(3600),
        ..fast_config()
    };
    let session = Session::connect_with(
        reactor.handle(),
        "127.0.0.1",
        port,
        Duration::from_secs(5),
        false,
        client_config,
    )
    .unwrap();
    assert!(session.is_connected());

    wait_until("session to observe the forced drop", Duration::from_secs(3), || {
        !session.is_connected()
    });

    let err = session
        .transact(
            vec![FieldWrite::set("a/b", vec![1])],
            Duration::from_secs(1),
        )
        .unwrap_err();
    assert!(matches!(err, NetError::Disconnected));

    server.stop();
}

#[test]
fn malformed_frames_tear_down_only_the_offending_connection() {
    let reactor = Reactor::spawn().unwrap();
    let store = Arc::new(MemoryStore::new());
    let server = Server::bind(
        reactor.handle(),
        "127.0.0.1",
        0,
        store,
        NetConfig::default(),
    )
    .unwrap();
    let port = server.local_addr().port();

    let healthy = Session::connect(
        reactor.handle(),
        "127.0.0.1",
        port,
        Duration::from_secs(5),
        false,
    )
    .unwrap();

    // A peer that is not speaking the protocol at all. Open first so the
    // registration is observable, then send the garbage.
    let stream = reactor
        .handle()
        .run_with_timeout("open", Duration::from_secs(2), async move {
            tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .unwrap()
        })
        .unwrap();
    wait_until(
        "garbage connection to register",
        Duration::from_secs(2),
        || server.connection_count() == 2,
    );

    reactor
        .handle()
        .run_with_timeout("garbage", Duration::from_secs(2), async move {
            use tokio::io::AsyncWriteExt;
            let mut stream = stream;
            stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
            stream.flush().await.unwrap();
            stream
        })
        .unwrap();

    wait_until(
        "garbage connection to be dropped",
        Duration::from_secs(2),
        || server.connection_count() == 1,
    );

    // The well-behaved session is unaffected.
    let outcome = healthy
        .transact(
            vec![FieldWrite::set("a/b", vec![1])],
            Duration::from_secs(2),
        )
        .unwrap();
    assert!(outcome.success);

    server.stop();
}

/// Store wrapper that stalls transactions long enough for the connection to
/// die underneath them.
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

impl Store for SlowStore {
    fn apply(&self, source: ConnectionId, request: ClientRequest) -> Vec<Outbound> {
        if matches!(request, ClientRequest::Transaction { .. }) {
            std::thread::sleep(self.delay);
        }
        self.inner.apply(source, request)
    }

    fn connection_dropped(&self, source: ConnectionId) {
        self.inner.connection_dropped(source);
    }
}

#[test]
fn inflight_requests_fail_with_disconnected_when_the_server_stops() {
    // Client on its own loop so the server-side stall cannot starve it.
    let server_reactor = Reactor::spawn().unwrap();
    let client_reactor = Reactor::spawn().unwrap();

    let store = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(400),
    });
    let server = Server::bind(
        server_reactor.handle(),
        "127.0.0.1",
        0,
        store,
        NetConfig::default(),
    )
    .unwrap();
    let port = server.local_addr().port();

    let session = Session::connect(
        client_reactor.handle(),
        "127.0.0.1",
        port,
        Duration::from_secs(5),
        false,
    )
    .unwrap();

    let in_flight = {
        let session = session.clone();
        std::thread::spawn(move || {
            session.transact(
                vec![FieldWrite::set("a/b", vec![1])],
                Duration::from_secs(10),
            )
        })
    };

    std::thread::sleep(Duration::from_millis(100));
    server.stop();

    let result = in_flight.join().unwrap();
    assert!(matches!(result.unwrap_err(), NetError::Disconnected));
    wait_until("session to notice the stop", Duration::from_secs(2), || {
        !session.is_connected()
    });
}
