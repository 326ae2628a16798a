//! An example showcasing how to use [`tokio_drain`] to gracefully shutdown a
//! [`tokio`] application which makes use of [`tokio::net::TcpListener`].
//!
//! Every line a client sends is one request, echoed back uppercased after
//! a short delay. On shutdown, in-flight lines are still answered before
//! the connection is closed.
//!
//! [`tokio_drain`]: https://docs.rs/tokio-drain
//! [`tokio`]: https://docs.rs/tokio
//! [`tokio::net::TcpListener`]: https://docs.rs/tokio/latest/tokio/net/struct.TcpListener.html

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_drain::{
    accept_gate, close_signal, AcceptSignal, CloseHandle, CloseSignal, ConnectionGuard,
    Coordinator, ShutdownOptions,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let (gate, accepting) = accept_gate();
    let coordinator = Coordinator::new(gate);

    let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
    tracing::info!("listening on {}", listener.local_addr().unwrap());
    tokio::spawn(serve_tcp(listener, accepting, coordinator.clone()));

    tokio::signal::ctrl_c().await.unwrap();
    tracing::info!(
        "signal received: draining {} connections",
        coordinator.num_connections()
    );

    if !coordinator
        .shutdown(ShutdownOptions::new().with_timeout_ms(5_000))
        .await
    {
        tracing::warn!("shutdown: forcefully due to timeout");
    }

    tracing::info!("Bye!");
}

async fn serve_tcp(
    listener: TcpListener,
    accepting: AcceptSignal,
    coordinator: Coordinator<tokio_drain::AcceptGate, CloseHandle>,
) {
    loop {
        tokio::select! {
            _ = accepting.stopped() => {
                tracing::info!("stop accepting connections");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, peer)) => {
                        let (handle, close) = close_signal();
                        let guard = coordinator.on_connection_open(handle);
                        tracing::debug!("accepted {} as {}", peer, guard.id());
                        guard.into_spawn_task_fn(move |guard| shout(socket, guard, close));
                    }
                    Err(e) => {
                        tracing::warn!("accept error: {:?}", e);
                    }
                }
            }
        }
    }
}

async fn shout(socket: TcpStream, guard: ConnectionGuard<CloseHandle>, close: CloseSignal) {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = close.ended() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            _ => break,
        };
        let Ok(request) = guard.request() else {
            break;
        };
        tokio::select! {
            _ = close.destroyed() => return,
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
        }
        let reply = format!("{}\n", line.to_uppercase());
        if let Err(err) = writer.write_all(reply.as_bytes()).await {
            tracing::warn!("conn {}: write error: {}", guard.id(), err);
            return;
        }
        drop(request);
    }
    let _ = writer.shutdown().await;
}
