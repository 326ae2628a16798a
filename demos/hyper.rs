//! An example showcasing how to use [`tokio_drain`] to gracefully shutdown a
//! [`hyper`] (1.x) server: on ctrl-c or SIGTERM the server stops accepting,
//! idle keep-alive connections are closed right away and busy ones once their
//! response went out, with a hard limit of 10 seconds.
//!
//! Try it with `curl -v -H 'x-delay-ms: 3000' http://127.0.0.1:8080` and
//! hit ctrl-c while the response is still pending.
//!
//! [`tokio_drain`]: https://docs.rs/tokio-drain
//! [`hyper`]: https://docs.rs/hyper

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1::Builder;
use hyper::service::service_fn;
use hyper::{body::Incoming, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_drain::{
    accept_gate, close_signal, AcceptGate, AcceptSignal, CloseHandle, Coordinator,
    ShutdownOptions,
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

    tokio::spawn(serve_tcp(accepting, coordinator.clone()));

    default_signal().await;
    tracing::info!("signal received: initiate graceful shutdown");

    let graceful = coordinator.shutdown(
        ShutdownOptions::new()
            .with_timeout(Duration::from_secs(10))
            .on_complete(|| tracing::info!("listener closed")),
    );

    if graceful.await {
        tracing::info!("shutdown: all connections drained");
    } else {
        tracing::warn!("shutdown: forcefully closed connections after timeout");
    }

    tracing::info!("Bye!");
}

async fn default_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let signal = async {
        let mut os_signal =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        os_signal.recv().await;
        std::io::Result::Ok(())
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = signal => {}
    }
}

async fn serve_tcp(accepting: AcceptSignal, coordinator: Coordinator<AcceptGate, CloseHandle>) {
    let addr: SocketAddr = ([127, 0, 0, 1], 8080).into();

    let listener = TcpListener::bind(&addr).await.unwrap();
    tracing::info!("listening on {}", addr);

    loop {
        let stream = tokio::select! {
            _ = accepting.stopped() => {
                tracing::info!("stop accepting connections");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        stream
                    }
                    Err(e) => {
                        tracing::warn!("accept error: {:?}", e);
                        continue;
                    }
                }
            }
        };
        let stream = TokioIo::new(stream);

        let (handle, close) = close_signal();
        let conn_guard = Arc::new(coordinator.on_connection_open(handle));

        tokio::spawn(async move {
            let service = {
                let conn_guard = conn_guard.clone();
                service_fn(move |req| {
                    let request = conn_guard.request();
                    // The guard drops once the handler returned, before hyper
                    // wrote the response. That is enough here: ending the
                    // connection maps to `graceful_shutdown`, which still
                    // flushes the response in flight. Servers that close the
                    // transport directly on end must hold the guard in the
                    // response body instead.
                    async move {
                        let response = slow_echo(req).await;
                        drop(request);
                        response
                    }
                })
            };
            let conn = Builder::new().serve_connection(stream, service);
            let mut conn = std::pin::pin!(conn);

            tokio::select! {
                _ = close.ended() => {
                    tracing::debug!("conn {}: graceful shutdown", conn_guard.id());
                    conn.as_mut().graceful_shutdown();
                }
                result = conn.as_mut() => {
                    if let Err(err) = result {
                        tracing::error!(error = &err as &dyn std::error::Error, "conn exited with error");
                    }
                    return;
                }
            }
            tokio::select! {
                _ = close.destroyed() => {
                    tracing::warn!("conn {}: destroyed with response in flight", conn_guard.id());
                }
                result = conn.as_mut() => {
                    if let Err(err) = result {
                        tracing::error!(error = &err as &dyn std::error::Error, "conn exited with error after graceful shutdown");
                    }
                }
            }
        });
    }
}

/// Responds after the number of milliseconds given in the `x-delay-ms`
/// request header (5 seconds when absent).
async fn slow_echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let delay = req
        .headers()
        .get("x-delay-ms")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(5));
    tokio::time::sleep(delay).await;
    Ok(Response::new(Full::from(format!(
        "{} {} served after {}ms\n",
        req.method(),
        req.uri().path(),
        delay.as_millis()
    ))))
}
