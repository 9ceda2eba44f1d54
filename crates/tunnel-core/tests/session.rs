//! Integration tests for the tunnel session lifecycle.
//!
//! The mock transport opens "channels" by dialing the target directly over
//! loopback TCP, so everything except the secure transport itself is real:
//! the local listener, the accept loop, and the forwarders.

use std::{
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{Duration, sleep, timeout},
};
use tunnel_core::{
    ChannelStream, SecureTransport, SessionState, TransportConnector, TunnelError, TunnelEvent, TunnelResult,
    TunnelSession,
};
use tunnel_types::{AuthParams, Endpoint, HostKeyPolicy, TunnelConfig};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwards_bytes_unchanged_to_the_remote() -> Result<()> {
    let (target, mut uploads) = spawn_sink_server().await?;
    let (session, tally) = tunnel(Mode::Direct, target, "127.0.0.1:0");
    let local = timeout(WAIT, session.open()).await??;
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.local_addr(), Some(local));

    for size in [0usize, 1, 4096, 1 << 20] {
        let payload = pattern(size, 7);
        let mut client = TcpStream::connect(local).await?;
        client.write_all(&payload).await?;
        client.shutdown().await?;

        let received = timeout(WAIT, uploads.recv()).await?.ok_or_else(|| anyhow!("server gone"))?;
        assert_eq!(received.len(), size);
        assert!(received == payload, "upload of {size} bytes was altered");

        let mut rest = Vec::new();
        assert_eq!(timeout(WAIT, client.read_to_end(&mut rest)).await??, 0);
    }

    assert_eq!(tally.channels.load(Ordering::SeqCst), 4);
    session.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwards_bytes_unchanged_from_the_remote() -> Result<()> {
    for size in [0usize, 1, 4096, 1 << 20] {
        let payload = pattern(size, 3);
        let target = spawn_source_server(payload.clone()).await?;
        let (session, _tally) = tunnel(Mode::Direct, target, "127.0.0.1:0");
        let local = timeout(WAIT, session.open()).await??;

        let mut client = TcpStream::connect(local).await?;
        let mut received = Vec::new();
        timeout(WAIT, client.read_to_end(&mut received)).await??;
        assert_eq!(received.len(), size);
        assert!(received == payload, "download of {size} bytes was altered");

        session.close().await;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_end_of_stream_releases_a_silent_remote() -> Result<()> {
    let (target, mut held) = spawn_holding_server().await?;
    let (session, _tally) = tunnel(Mode::Direct, target, "127.0.0.1:0");
    let mut events = session.subscribe();
    let local = timeout(WAIT, session.open()).await??;

    let mut client = TcpStream::connect(local).await?;
    client.write_all(b"bye").await?;
    client.shutdown().await?;

    let mut rest = Vec::new();
    assert_eq!(timeout(WAIT, client.read_to_end(&mut rest)).await??, 0);
    next_event(&mut events, |event| matches!(event, TunnelEvent::ForwarderFinished { .. })).await?;
    assert!(session.active_forwarders().is_empty(), "forwarder outlived its connection");

    // the target sees the channel close even though it never closed its side
    let mut remote = timeout(WAIT, held.recv()).await?.ok_or_else(|| anyhow!("server gone"))?;
    let mut request = Vec::new();
    timeout(WAIT, remote.read_to_end(&mut request)).await??;
    assert_eq!(request, b"bye");

    session.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_connections_are_independent() -> Result<()> {
    const CONNECTIONS: usize = 8;
    let target = spawn_echo_server().await?;
    let (session, _tally) = tunnel(Mode::Direct, target, "127.0.0.1:0");
    let local = timeout(WAIT, session.open()).await??;

    let mut clients = Vec::new();
    for n in 0..CONNECTIONS {
        let mut client = TcpStream::connect(local).await?;
        client.write_all(&[n as u8]).await?;
        let mut first = [0u8; 1];
        timeout(WAIT, client.read_exact(&mut first)).await??;
        assert_eq!(first[0], n as u8);
        clients.push(client);
    }
    assert_eq!(session.active_forwarders().len(), CONNECTIONS);

    let tasks: Vec<JoinHandle<Result<()>>> = clients
        .into_iter()
        .enumerate()
        .map(|(n, mut client)| {
            tokio::spawn(async move {
                let payload = pattern(64 * 1024, n as u8);
                let (mut rd, mut wr) = client.split();
                let mut echoed = vec![0u8; payload.len()];
                let (written, read) = tokio::join!(wr.write_all(&payload), rd.read_exact(&mut echoed));
                written?;
                read?;
                assert!(echoed == payload, "connection {n} saw foreign bytes");
                Ok(())
            })
        })
        .collect();
    for task in tasks {
        timeout(WAIT, task).await???;
    }

    session.close().await;
    assert!(session.active_forwarders().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_terminates_every_active_forwarder() -> Result<()> {
    const ACTIVE: usize = 5;
    let target = spawn_echo_server().await?;
    let (session, tally) = tunnel(Mode::Direct, target, "127.0.0.1:0");
    let mut events = session.subscribe();
    let local = timeout(WAIT, session.open()).await??;

    let mut clients = Vec::new();
    for _ in 0..ACTIVE {
        let mut client = TcpStream::connect(local).await?;
        client.write_all(b"hi").await?;
        let mut buf = [0u8; 2];
        timeout(WAIT, client.read_exact(&mut buf)).await??;
        clients.push(client);
    }
    assert_eq!(session.active_forwarders().len(), ACTIVE);

    timeout(WAIT, session.close()).await?;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.active_forwarders().is_empty());
    assert!(tally.closed.load(Ordering::SeqCst), "transport left open");

    for client in &mut clients {
        let mut rest = Vec::new();
        match timeout(WAIT, client.read_to_end(&mut rest)).await? {
            Ok(0) => {}
            Ok(n) => panic!("unexpected {n} bytes after close"),
            Err(err) => assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset),
        }
    }

    let cancelled = drain(&mut events)
        .iter()
        .filter(|event| matches!(event, TunnelEvent::ForwarderCancelled { .. }))
        .count();
    assert_eq!(cancelled, ACTIVE, "every forwarder must observe cancellation");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_session_refuses_connections_and_close_is_idempotent() -> Result<()> {
    let target = spawn_echo_server().await?;
    let (session, _tally) = tunnel(Mode::Direct, target, "127.0.0.1:0");
    let local = timeout(WAIT, session.open()).await??;

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.local_addr(), None);
    assert!(TcpStream::connect(local).await.is_err(), "listener still accepting");

    timeout(WAIT, session.close()).await?;
    timeout(WAIT, session.clone().close()).await?;
    assert_eq!(session.state(), SessionState::Closed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_transport_is_a_dial_error_and_nothing_listens() -> Result<()> {
    let ssh_port = pick_free_port();
    let local_port = pick_free_port();
    let config = config_for(
        &format!("127.0.0.1:{ssh_port}"),
        "127.0.0.1:5432",
        &format!("127.0.0.1:{local_port}"),
    );
    let connector = MockConnector::new(Mode::DialSsh);
    let tally = connector.tally.clone();
    let session = TunnelSession::new(config, connector);

    let err = timeout(WAIT, session.open()).await?.unwrap_err();
    assert!(matches!(err, TunnelError::Dial { .. }), "got {err:?}");
    assert!(err.is_establishment_error());
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.local_addr(), None);
    assert!(TcpStream::connect(("127.0.0.1", local_port)).await.is_err());
    assert_eq!(tally.connects.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_port_in_use_is_a_listen_error_and_closes_transport() -> Result<()> {
    let occupied = StdTcpListener::bind(("127.0.0.1", 0))?;
    let occupied_addr = occupied.local_addr()?;
    let target = spawn_echo_server().await?;
    let (session, tally) = tunnel(Mode::Direct, target, &occupied_addr.to_string());

    let err = timeout(WAIT, session.open()).await?.unwrap_err();
    assert!(matches!(err, TunnelError::Listen { .. }), "got {err:?}");
    assert_eq!(session.state(), SessionState::Failed);
    assert!(tally.closed.load(Ordering::SeqCst), "transport must be closed after a bind failure");
    drop(occupied);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_credentials_are_an_authentication_error() -> Result<()> {
    let target = spawn_echo_server().await?;
    let (session, _tally) = tunnel(Mode::RejectAuth, target, "127.0.0.1:0");
    let err = timeout(WAIT, session.open()).await?.unwrap_err();
    assert!(matches!(err, TunnelError::Authentication(_)), "got {err:?}");
    assert_eq!(session.state(), SessionState::Failed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_address_fails_before_dialing() -> Result<()> {
    let config = config_for("bastion-without-port", "127.0.0.1:5432", "127.0.0.1:0");
    let connector = MockConnector::new(Mode::Direct);
    let tally = connector.tally.clone();
    let session = TunnelSession::new(config, connector);

    let err = timeout(WAIT, session.open()).await?.unwrap_err();
    match err {
        TunnelError::Config(config_err) => assert_eq!(config_err.field(), "ssh address"),
        other => panic!("expected config error, got {other:?}"),
    }
    assert_eq!(tally.connects.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_transport_is_bounded_by_connect_timeout() -> Result<()> {
    let config = config_for("127.0.0.1:22", "127.0.0.1:5432", "127.0.0.1:0").with_connect_timeout(Duration::from_millis(100));
    let session = TunnelSession::new(config, MockConnector::new(Mode::Hang));

    let err = timeout(WAIT, session.open()).await?.unwrap_err();
    match &err {
        TunnelError::Dial { reason, .. } => assert!(reason.contains("timed out"), "reason: {reason}"),
        other => panic!("expected dial timeout, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Failed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_while_establishing_cancels_readiness() -> Result<()> {
    let config = config_for("127.0.0.1:22", "127.0.0.1:5432", "127.0.0.1:0");
    let session = TunnelSession::new(config, MockConnector::new(Mode::Hang));
    let readiness = session.open();
    sleep(Duration::from_millis(25)).await;
    assert_eq!(session.state(), SessionState::Establishing);

    timeout(WAIT, session.close()).await?;
    let err = timeout(WAIT, readiness).await?.unwrap_err();
    assert!(matches!(err, TunnelError::Cancelled), "got {err:?}");
    assert_eq!(session.state(), SessionState::Closed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_before_open_is_a_no_op_and_open_is_single_use() -> Result<()> {
    let target = spawn_echo_server().await?;
    let (session, _tally) = tunnel(Mode::Direct, target, "127.0.0.1:0");

    session.close().await;
    assert_eq!(session.state(), SessionState::Created);

    timeout(WAIT, session.open()).await??;
    let err = timeout(WAIT, session.open()).await?.unwrap_err();
    assert!(matches!(err, TunnelError::AlreadyOpened));
    assert!(!err.is_establishment_error());
    assert_eq!(session.state(), SessionState::Ready);

    session.close().await;
    assert_eq!(session.terminated().await, SessionState::Closed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn channel_open_failure_drops_only_that_connection() -> Result<()> {
    let target = spawn_echo_server().await?;
    let (session, _tally) = tunnel(Mode::FailChannels, target, "127.0.0.1:0");
    let mut events = session.subscribe();
    let local = timeout(WAIT, session.open()).await??;

    for _ in 0..2 {
        let mut client = TcpStream::connect(local).await?;
        let mut buf = Vec::new();
        match timeout(WAIT, client.read_to_end(&mut buf)).await? {
            Ok(n) => assert_eq!(n, 0),
            Err(err) => assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset),
        }
        let failed = next_event(&mut events, |event| matches!(event, TunnelEvent::ChannelOpenFailed { .. })).await?;
        if let TunnelEvent::ChannelOpenFailed { error, .. } = failed {
            assert!(matches!(*error, TunnelError::Dial { .. }));
        }
    }

    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.active_forwarders().is_empty());
    session.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_report_lifecycle_and_byte_counts() -> Result<()> {
    let target = spawn_echo_server().await?;
    let (session, _tally) = tunnel(Mode::Direct, target, "127.0.0.1:0");
    let mut events = session.subscribe();
    let local = timeout(WAIT, session.open()).await??;

    let ready = next_event(&mut events, |event| matches!(event, TunnelEvent::Ready { .. })).await?;
    assert!(matches!(ready, TunnelEvent::Ready { local: addr } if addr == local));

    let mut client = TcpStream::connect(local).await?;
    client.write_all(b"twelve bytes").await?;
    let mut echoed = [0u8; 12];
    timeout(WAIT, client.read_exact(&mut echoed)).await??;
    assert_eq!(&echoed, b"twelve bytes");
    drop(client);

    let finished = next_event(&mut events, |event| matches!(event, TunnelEvent::ForwarderFinished { .. })).await?;
    match finished {
        TunnelEvent::ForwarderFinished {
            bytes_up, bytes_down, ..
        } => {
            assert_eq!(bytes_up, 12);
            assert_eq!(bytes_down, 12);
        }
        other => panic!("unexpected event {other:?}"),
    }

    session.close().await;
    next_event(&mut events, |event| matches!(event, TunnelEvent::Closed)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// helpers

fn tunnel(mode: Mode, target: SocketAddr, local: &str) -> (TunnelSession<MockConnector>, Arc<Tally>) {
    let config = config_for("127.0.0.1:22", &target.to_string(), local);
    let connector = MockConnector::new(mode);
    let tally = connector.tally.clone();
    (TunnelSession::new(config, connector), tally)
}

fn config_for(ssh: &str, remote: &str, local: &str) -> TunnelConfig {
    TunnelConfig::new(ssh, remote, local, AuthParams::new("tester", HostKeyPolicy::AcceptAny))
}

fn pick_free_port() -> u16 {
    StdTcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Echo every byte back and half-close when the client does.
async fn spawn_echo_server() -> Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
        }
    });
    Ok(addr)
}

/// Read each upload to the end and report it.
async fn spawn_sink_server() -> Result<(SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut upload = Vec::new();
                if socket.read_to_end(&mut upload).await.is_ok() {
                    let _ = tx.send(upload);
                }
            });
        }
    });
    Ok((addr, rx))
}

/// Send `payload` to every connection, then close it.
async fn spawn_source_server(payload: Vec<u8>) -> Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    let payload = Arc::new(payload);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let payload = Arc::clone(&payload);
            tokio::spawn(async move {
                let _ = socket.write_all(&payload).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    Ok(addr)
}

/// Hand every accepted socket to the test without ever closing it.
async fn spawn_holding_server() -> Result<(SocketAddr, mpsc::UnboundedReceiver<TcpStream>)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let _ = tx.send(socket);
        }
    });
    Ok((addr, rx))
}

async fn next_event<F>(events: &mut broadcast::Receiver<TunnelEvent>, wanted: F) -> Result<TunnelEvent>
where
    F: Fn(&TunnelEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(anyhow!("event stream closed")),
            }
        }
    })
    .await?
}

fn drain(events: &mut broadcast::Receiver<TunnelEvent>) -> Vec<TunnelEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[derive(Clone, Copy)]
enum Mode {
    /// Succeed immediately; channels dial their target over loopback.
    Direct,
    /// Dial the configured SSH address for real before succeeding.
    DialSsh,
    RejectAuth,
    /// Never finish connecting.
    Hang,
    /// Connect, but refuse every channel.
    FailChannels,
}

#[derive(Default)]
struct Tally {
    connects: AtomicUsize,
    channels: AtomicUsize,
    closed: AtomicBool,
}

struct MockConnector {
    mode: Mode,
    tally: Arc<Tally>,
}

impl MockConnector {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            tally: Arc::new(Tally::default()),
        }
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self, address: &Endpoint, auth: &AuthParams) -> TunnelResult<MockTransport> {
        self.tally.connects.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            Mode::Direct | Mode::FailChannels => {}
            Mode::DialSsh => {
                TcpStream::connect((address.host.as_str(), address.port))
                    .await
                    .map_err(|err| TunnelError::dial(address, err))?;
            }
            Mode::RejectAuth => {
                return Err(TunnelError::auth(format!("{} rejected by {address}", auth.username)));
            }
            Mode::Hang => std::future::pending::<()>().await,
        }
        Ok(MockTransport {
            tally: self.tally.clone(),
            fail_channels: matches!(self.mode, Mode::FailChannels),
        })
    }
}

struct MockTransport {
    tally: Arc<Tally>,
    fail_channels: bool,
}

#[async_trait]
impl SecureTransport for MockTransport {
    async fn open_channel(&self, target: &Endpoint, _origin: SocketAddr) -> TunnelResult<ChannelStream> {
        if self.fail_channels || self.tally.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::dial(target, "channel refused"));
        }
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|err| TunnelError::dial(target, err))?;
        self.tally.channels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(stream))
    }

    async fn close(&self) -> TunnelResult<()> {
        self.tally.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
