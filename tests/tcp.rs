//! End-to-end drain scenarios over real TCP sockets.
//!
//! The server speaks a line protocol: the client sends the number of
//! milliseconds the request should take, the server answers `done` once
//! that time passed. Connections are keep-alive until the server ends them.

#![cfg(not(loom))]

use std::{net::SocketAddr, time::Duration};

use rand::Rng;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::Instant,
};
use tokio_drain::{
    accept_gate, close_signal, AcceptGate, AcceptSignal, CloseHandle, CloseSignal,
    ConnectionGuard, Coordinator, ShutdownOptions,
};

type Server = Coordinator<AcceptGate, CloseHandle>;

async fn start() -> (Server, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (gate, accepting) = accept_gate();
    let coordinator = Coordinator::new(gate);
    tokio::spawn(accept_loop(listener, accepting, coordinator.clone()));
    (coordinator, addr)
}

async fn accept_loop(listener: TcpListener, accepting: AcceptSignal, coordinator: Server) {
    loop {
        let stream = tokio::select! {
            _ = accepting.stopped() => break,
            result = listener.accept() => match result {
                Ok((stream, _)) => stream,
                Err(err) => {
                    tracing::warn!("accept error: {}", err);
                    continue;
                }
            },
        };
        let (handle, close) = close_signal();
        coordinator
            .on_connection_open(handle)
            .into_spawn_task_fn(move |guard| serve_connection(stream, guard, close));
    }
    drop(listener);
    drop(accepting);
}

async fn serve_connection(
    stream: TcpStream,
    guard: ConnectionGuard<CloseHandle>,
    close: CloseSignal,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = close.ended() => break,
            line = lines.next_line() => line,
        };
        let Ok(Some(line)) = line else {
            break;
        };
        let Ok(request) = guard.request() else {
            break;
        };
        let work = Duration::from_millis(line.trim().parse().unwrap_or(0));
        tokio::select! {
            _ = close.destroyed() => return,
            _ = tokio::time::sleep(work) => {}
        }
        if writer.write_all(b"done\n").await.is_err() {
            return;
        }
        drop(request);
    }
    let _ = writer.shutdown().await;
}

struct Client {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, work_ms: u64) {
        self.writer
            .write_all(format!("{}\n", work_ms).as_bytes())
            .await
            .unwrap();
    }

    /// Next response line, `None` once the server closed the connection.
    async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("server response within 5s")
            .ok()
            .flatten()
    }
}

async fn wait_for_connections(server: &Server, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.num_connections() != n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection count reached");
}

#[tokio::test]
async fn server_closed_connection_needs_no_drain() {
    let (server, addr) = start().await;
    let mut client = Client::connect(addr).await;
    client.send(0).await;
    assert_eq!(client.recv().await.as_deref(), Some("done"));

    drop(client);
    wait_for_connections(&server, 0).await;

    let graceful = server.shutdown(ShutdownOptions::new());
    assert_eq!(graceful.outcome(), Some(true));
    assert!(server.terminated().await);
}

#[tokio::test]
async fn idle_keep_alive_connection_is_ended() {
    let (server, addr) = start().await;
    let mut client = Client::connect(addr).await;
    client.send(0).await;
    assert_eq!(client.recv().await.as_deref(), Some("done"));
    wait_for_connections(&server, 1).await;

    assert!(server.shutdown(ShutdownOptions::new()).await);
    assert_eq!(client.recv().await, None);
    assert_eq!(server.num_connections(), 0);
    assert!(server.terminated().await);
}

#[tokio::test]
async fn in_flight_response_completes_within_grace_period() {
    let (server, addr) = start().await;
    let mut client = Client::connect(addr).await;
    client.send(500).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.num_connections(), 1);

    let start = Instant::now();
    let graceful = server.shutdown(ShutdownOptions::new().with_timeout_ms(1000));

    assert_eq!(client.recv().await.as_deref(), Some("done"));
    assert_eq!(client.recv().await, None);
    assert!(graceful.await);
    assert!(start.elapsed() < Duration::from_millis(1000));
    assert_eq!(server.num_connections(), 0);
}

#[tokio::test]
async fn in_flight_response_is_truncated_after_grace_period() {
    let (server, addr) = start().await;
    let mut client = Client::connect(addr).await;
    client.send(500).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    let graceful = server.shutdown(ShutdownOptions::new().with_timeout_ms(100));

    assert!(!graceful.await);
    assert!(start.elapsed() < Duration::from_millis(400));
    assert_eq!(client.recv().await, None);
    wait_for_connections(&server, 0).await;
}

#[tokio::test]
async fn new_connections_are_refused_once_closed() {
    let (server, addr) = start().await;
    let completed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let _graceful = server.shutdown(ShutdownOptions::new().on_complete({
        let completed = completed.clone();
        move || completed.store(true, std::sync::atomic::Ordering::SeqCst)
    }));

    server.closed().await;
    assert!(completed.load(std::sync::atomic::Ordering::SeqCst));
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_connections_drain_concurrently() {
    let (server, addr) = start().await;
    let mut rng = rand::thread_rng();

    let mut clients = Vec::new();
    for _ in 0..32 {
        let mut client = Client::connect(addr).await;
        if rng.gen_bool(0.75) {
            let work = rng.gen_range(200..600);
            client.send(work).await;
            clients.push((client, true));
        } else {
            clients.push((client, false));
        }
    }
    wait_for_connections(&server, 32).await;
    // let the server read every request line before draining starts
    tokio::time::sleep(Duration::from_millis(100)).await;

    let graceful = server.shutdown(ShutdownOptions::new().with_timeout(Duration::from_secs(3)));

    for (mut client, busy) in clients {
        if busy {
            assert_eq!(client.recv().await.as_deref(), Some("done"));
        }
        assert_eq!(client.recv().await, None);
    }
    assert!(graceful.await);
    assert!(server.terminated().await);
    assert_eq!(server.num_connections(), 0);
}
