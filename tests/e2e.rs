//! End-to-end suite for the relay fabric
//!
//! Exercises the full stack the way clients see it: the native TCP
//! protocol for publish/read, the media HTTP front for adaptive-segment
//! auth, and the manager/actor layer for on-demand lifecycle and
//! shutdown behavior.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use relay_rs::conf::{Conf, PathConf};
use relay_rs::conn::ConnRegistry;
use relay_rs::error::RelayError;
use relay_rs::frame::{Frame, Track};
use relay_rs::metrics;
use relay_rs::path::{
    manager, CommandLauncher, Credentials, PathManagerHandle, PathSettings, Protocol,
    SessionIdent, SourceLauncher,
};
use relay_rs::routine::RoutinePool;
use relay_rs::server::proto::{read_message, write_message};
use relay_rs::server::{Hello, Message, RelayServer, ServerConfig, WireRole};
use relay_rs::stream::ReaderItem;

// ── Shared helpers ───────────────────────────────────────────────────

/// 30 fps on the 90 kHz clock.
const FRAME_TICKS: i64 = 3000;

fn video_tracks() -> Vec<Track> {
    vec![Track::video("avc1.640028", Bytes::from_static(&[0u8; 16]))]
}

fn video_frame(i: i64, keyframe_every: i64) -> Frame {
    Frame::video(
        0,
        i * FRAME_TICKS,
        i % keyframe_every == 0,
        Bytes::from(vec![0xAB; 256]),
    )
}

fn anon() -> Credentials {
    Credentials::anonymous("127.0.0.1".parse().unwrap())
}

fn ident() -> SessionIdent {
    SessionIdent::new(Protocol::Relay)
}

fn conf_with(paths: &[(&str, PathConf)]) -> Conf {
    let mut conf = Conf::default();
    for (name, pc) in paths {
        conf.paths.insert((*name).to_string(), pc.clone());
    }
    conf
}

struct Stack {
    pool: RoutinePool,
    manager: PathManagerHandle,
    addr: SocketAddr,
}

/// Manager + native relay server on an ephemeral port.
async fn start_stack(conf: Conf) -> Stack {
    let pool = RoutinePool::new();
    let metrics = metrics::new();
    let manager = manager::spawn(
        conf.clone(),
        PathSettings {
            reader_buffer: conf.reader_buffer,
            overflow_threshold: conf.overflow_threshold,
            ..Default::default()
        },
        Arc::new(CommandLauncher),
        None,
        metrics.clone(),
        &pool,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(
        ServerConfig::from_conf(&conf),
        manager.clone(),
        ConnRegistry::new(),
        metrics,
    );
    let conn_pool = pool.clone();
    pool.add(move |_| async move {
        let _ = server.run_with_listener(listener, &conn_pool).await;
    });

    Stack { pool, manager, addr }
}

async fn send(stream: &mut TcpStream, msg: Message) {
    write_message(stream, &msg).await.unwrap();
}

async fn recv(stream: &mut TcpStream) -> Message {
    read_message(stream).await.unwrap()
}

/// Connect and complete the publish handshake.
async fn connect_publisher(addr: SocketAddr, path: &str) -> TcpStream {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    send(
        &mut socket,
        Message::Hello(Hello {
            role: WireRole::Publish,
            path: path.into(),
            user: None,
            pass: None,
            query: None,
        }),
    )
    .await;
    assert!(matches!(recv(&mut socket).await, Message::HelloOk));
    send(&mut socket, Message::Tracks(video_tracks())).await;
    assert!(matches!(recv(&mut socket).await, Message::TracksOk));
    socket
}

/// Connect and complete the read handshake.
async fn connect_reader(addr: SocketAddr, path: &str) -> TcpStream {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    send(
        &mut socket,
        Message::Hello(Hello {
            role: WireRole::Read,
            path: path.into(),
            user: None,
            pass: None,
            query: None,
        }),
    )
    .await;
    assert!(matches!(recv(&mut socket).await, Message::HelloOk));
    assert!(matches!(recv(&mut socket).await, Message::Tracks(_)));
    socket
}

// ── Scenario: publish then read ──────────────────────────────────────

#[tokio::test]
async fn test_publish_then_read_from_next_keyframe() {
    let stack = start_stack(conf_with(&[("cam1", PathConf::default())])).await;

    let mut publisher = connect_publisher(stack.addr, "cam1").await;

    // First 30 frames go out before the reader exists (keyframes at 0
    // and 30). Give the server a beat to drain them so the reader
    // attaches strictly between frames 29 and 30.
    for i in 0..30 {
        send(&mut publisher, Message::Frame(video_frame(i, 30))).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut reader = connect_reader(stack.addr, "cam1").await;

    for i in 30..90 {
        send(&mut publisher, Message::Frame(video_frame(i, 30))).await;
    }

    // The reader starts at the keyframe boundary (frame 30) and sees
    // everything after it, in order.
    for i in 30..90 {
        match recv(&mut reader).await {
            Message::Frame(f) => {
                assert_eq!(f.dts, i * FRAME_TICKS, "out of order at frame {i}");
                assert_eq!(f.keyframe, i % 30 == 0);
            }
            other => panic!("expected frame {i}, got {other:?}"),
        }
    }

    // Publisher leaves; the reader gets a terminal marker.
    send(&mut publisher, Message::Terminate { reason: "done".into() }).await;
    assert!(matches!(recv(&mut reader).await, Message::Terminate { .. }));

    stack.pool.cancel();
    stack.pool.wait().await;
}

// ── Scenario: slow reader eviction ───────────────────────────────────

#[tokio::test]
async fn test_slow_reader_evicted_publisher_unaffected() {
    let mut conf = conf_with(&[("cam1", PathConf::default())]);
    conf.reader_buffer = 64;
    conf.overflow_threshold = 100;
    let stack = start_stack(conf).await;

    let publisher = stack
        .manager
        .attach_publisher("cam1", ident(), anon())
        .await
        .unwrap();
    let stream = publisher.record(video_tracks()).await.unwrap();

    // A reader that never drains.
    let stalled = stack.manager.attach_reader("cam1", ident(), anon()).await.unwrap();

    // 64 queued + 100 tolerated drops + 1 pushes it over the edge.
    for i in 0..165 {
        stream.write_frame(video_frame(i, 30));
    }

    match stalled.handle().next().await {
        ReaderItem::Terminated(e) => assert_eq!(e, RelayError::ReaderOverflow),
        other => panic!("expected overflow terminal, got {other:?}"),
    }

    // The publisher can keep writing and a fresh reader is served.
    let live = stack.manager.attach_reader("cam1", ident(), anon()).await.unwrap();
    stream.write_frame(video_frame(165, 1));
    assert!(matches!(live.handle().next().await, ReaderItem::Frame(_)));

    stack.pool.cancel();
    stack.pool.wait().await;
}

// ── Scenario: publisher swap rejected ────────────────────────────────

#[tokio::test]
async fn test_second_publisher_rejected_on_wire() {
    let stack = start_stack(conf_with(&[("cam1", PathConf::default())])).await;

    let mut first = connect_publisher(stack.addr, "cam1").await;
    let mut reader = connect_reader(stack.addr, "cam1").await;

    // Second publisher is refused within the attach round-trip.
    let mut second = TcpStream::connect(stack.addr).await.unwrap();
    send(
        &mut second,
        Message::Hello(Hello {
            role: WireRole::Publish,
            path: "cam1".into(),
            user: None,
            pass: None,
            query: None,
        }),
    )
    .await;
    match recv(&mut second).await {
        Message::Error { error } => assert_eq!(error, RelayError::PathBusy.to_string()),
        other => panic!("expected refusal, got {other:?}"),
    }

    // The first publisher's stream is unaffected.
    send(&mut first, Message::Frame(video_frame(0, 1))).await;
    assert!(matches!(recv(&mut reader).await, Message::Frame(_)));

    stack.pool.cancel();
    stack.pool.wait().await;
}

// ── Scenario: non-monotonic DTS is a publisher fault ─────────────────

#[tokio::test]
async fn test_decreasing_dts_closes_publisher() {
    let stack = start_stack(conf_with(&[("cam1", PathConf::default())])).await;

    let mut publisher = connect_publisher(stack.addr, "cam1").await;
    send(&mut publisher, Message::Frame(video_frame(10, 1))).await;
    send(&mut publisher, Message::Frame(video_frame(3, 1))).await;

    match recv(&mut publisher).await {
        Message::Error { error } => assert!(error.contains("non-monotonic")),
        other => panic!("expected protocol error, got {other:?}"),
    }

    stack.pool.cancel();
    stack.pool.wait().await;
}

// ── Scenario: on-demand lifecycle ────────────────────────────────────

/// Launches an in-process publisher instead of an external command.
#[derive(Default)]
struct InProcessSource {
    manager: OnceLock<PathManagerHandle>,
}

impl SourceLauncher for InProcessSource {
    fn launch(&self, path: &str, _command: &str, stop: CancellationToken) {
        let manager = self.manager.get().expect("manager set").clone();
        let path = path.to_string();
        tokio::spawn(async move {
            let session = match manager.attach_publisher(&path, ident(), anon()).await {
                Ok(s) => s,
                Err(_) => return,
            };
            let stream = match session.record(video_tracks()).await {
                Ok(s) => s,
                Err(_) => return,
            };
            let mut i = 0;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(33)) => {
                        stream.write_frame(video_frame(i, 30));
                        i += 1;
                    }
                }
            }
            session.remove().await;
        });
    }
}

#[tokio::test(start_paused = true)]
async fn test_on_demand_teardown_and_restart() {
    let pconf = PathConf {
        on_demand: Some("in-process".into()),
        on_demand_start_timeout_secs: 10,
        on_demand_close_after_secs: 10,
        ..Default::default()
    };
    let conf = conf_with(&[("cam2", pconf)]);

    let pool = RoutinePool::new();
    let source = Arc::new(InProcessSource::default());
    let manager = manager::spawn(
        conf,
        PathSettings::default(),
        source.clone(),
        None,
        metrics::new(),
        &pool,
    );
    source.manager.set(manager.clone()).ok().unwrap();

    // First reader starts the source and is parked until it records.
    let reader = manager.attach_reader("cam2", ident(), anon()).await.unwrap();
    assert!(matches!(reader.handle().next().await, ReaderItem::Frame(_)));
    reader.detach().await;

    // An attach at t=9.9s cancels the teardown and is served live.
    tokio::time::sleep(Duration::from_millis(9_900)).await;
    let reader = manager.attach_reader("cam2", ident(), anon()).await.unwrap();
    assert!(matches!(reader.handle().next().await, ReaderItem::Frame(_)));
    reader.detach().await;

    // Past the close-after interval the source is torn down. The
    // teardown crosses a few tasks, so poll for it.
    tokio::time::sleep(Duration::from_millis(10_100)).await;
    let mut torn_down = false;
    for _ in 0..100 {
        if !manager.describe("cam2").await.unwrap().ready {
            torn_down = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(torn_down, "on-demand source still up past close-after");

    // ...and the next attach restarts it.
    let reader = manager.attach_reader("cam2", ident(), anon()).await.unwrap();
    assert!(matches!(reader.handle().next().await, ReaderItem::Frame(_)));
    reader.detach().await;

    pool.cancel();
    pool.wait().await;
}

// ── Scenario: authentication challenge on the segment front ──────────

mod hls_auth {
    use super::*;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{header, Request, StatusCode};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use relay_rs::hls::{HlsConfig, HlsServer};
    use relay_rs::playback::PlaybackServer;
    use relay_rs::web::{self, WebState};
    use tower::ServiceExt;

    async fn media_router(manager: PathManagerHandle, pool: &RoutinePool) -> axum::Router {
        let hls = HlsServer::new(
            manager.clone(),
            HlsConfig::from_conf(&Conf::default()),
            pool,
            metrics::new(),
        );
        let playback = PlaybackServer::new(manager.clone(), "./recordings".into());
        web::router(Arc::new(WebState {
            manager,
            hls,
            playback,
            conns: ConnRegistry::new(),
            pool: pool.clone(),
            metrics: metrics::new(),
        }))
    }

    fn request(path: &str, auth: Option<(&str, &str)>) -> Request<Body> {
        let mut builder = Request::get(path);
        if let Some((user, pass)) = auth {
            builder = builder.header(
                header::AUTHORIZATION,
                format!("Basic {}", BASE64.encode(format!("{user}:{pass}"))),
            );
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("127.0.0.1:9000".parse().unwrap()));
        req
    }

    #[tokio::test]
    async fn test_basic_challenge_flow() {
        let pconf = PathConf {
            read_user: Some("u".into()),
            read_pass: Some("p".into()),
            ..Default::default()
        };
        let pool = RoutinePool::new();
        let manager = manager::spawn(
            conf_with(&[("secure", pconf)]),
            PathSettings::default(),
            Arc::new(CommandLauncher),
            None,
            metrics::new(),
            &pool,
        );

        // A publisher makes the path live so authorized requests can be
        // served a playlist.
        let publisher = manager.attach_publisher("secure", ident(), anon()).await.unwrap();
        let stream = publisher.record(video_tracks()).await.unwrap();
        for i in 0..31 {
            stream.write_frame(video_frame(i, 30));
        }

        let router = media_router(manager, &pool).await;

        // No credentials: 401 plus a challenge.
        let resp = router
            .clone()
            .oneshot(request("/secure/index.m3u8", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().contains_key(header::WWW_AUTHENTICATE));

        // Wrong password: 401, but no challenge and no hint about the
        // username.
        let resp = router
            .clone()
            .oneshot(request("/secure/index.m3u8", Some(("u", "wrong"))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(!resp.headers().contains_key(header::WWW_AUTHENTICATE));

        // Correct credentials: the master playlist.
        let resp = router
            .oneshot(request("/secure/index.m3u8", Some(("u", "p"))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        pool.cancel();
        pool.wait().await;
    }
}

// ── Scenario: graceful shutdown at scale ─────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_shutdown_terminates_every_reader() {
    let paths: Vec<(String, PathConf)> = (0..10)
        .map(|i| (format!("cam{i}"), PathConf::default()))
        .collect();
    let mut conf = Conf::default();
    for (name, pc) in &paths {
        conf.paths.insert(name.clone(), pc.clone());
    }

    let pool = RoutinePool::new();
    let manager = manager::spawn(
        conf,
        PathSettings::default(),
        Arc::new(CommandLauncher),
        None,
        metrics::new(),
        &pool,
    );

    let mut publishers = Vec::new();
    let mut readers = Vec::new();
    for i in 0..10 {
        let name = format!("cam{i}");
        let publisher = manager.attach_publisher(&name, ident(), anon()).await.unwrap();
        publisher.record(video_tracks()).await.unwrap();
        for _ in 0..10 {
            readers.push(manager.attach_reader(&name, ident(), anon()).await.unwrap());
        }
        // Publishers stay attached for the duration of the test.
        publishers.push(publisher);
    }
    assert_eq!(readers.len(), 100);

    pool.cancel();
    // The supervisor returns within the configured grace.
    tokio::time::timeout(Duration::from_secs(2), pool.wait())
        .await
        .expect("shutdown exceeded grace");

    for reader in &readers {
        match reader.handle().next().await {
            ReaderItem::Terminated(_) => {}
            other => panic!("expected terminal after shutdown, got {other:?}"),
        }
    }
}
