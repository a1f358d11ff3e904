//! Integration tests for DFE sessions over TCP

use dfe_session::check;
use dfe_session::client::{ClientConfig, DfeClient};
use dfe_session::error::{DfeError, TransportError};
use dfe_session::protocol::{RpcRequest, RpcResponse};
use dfe_session::server::{DfeServer, ServerConfig};
use dfe_session::session;
use dfe_session::suite::{run_example, Example, DEFAULT_SIZE};
use dfe_session::transport::{
    RpcTransport, TcpTransport, TransportConfig, TransportFuture,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        memory_pool_size: 16 * 1024 * 1024, // 16MB for testing
        lmem_size: 1024 * 1024,
        ..Default::default()
    }
}

/// Start a service on an ephemeral port
async fn start_server(config: ServerConfig) -> (Arc<DfeServer>, u16) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("dfe_session=debug")
        .try_init();

    let listener = TcpListener::bind(&config.listen_addr).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(DfeServer::new(config));

    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    (server, port)
}

fn client_config(port: u16) -> ClientConfig {
    ClientConfig {
        transport: TransportConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_lmem_loopback_over_tcp() {
    let (server, port) = start_server(test_config()).await;
    let client = DfeClient::connect(client_config(port)).await.unwrap();

    let n = DEFAULT_SIZE as i32;
    let a: Vec<i32> = (0..n).collect();
    let b: Vec<i32> = (0..n).map(|i| n - i).collect();

    let result = session::lmem_loopback(&client, &a, &b).await.unwrap();
    assert_eq!(result.output.len(), DEFAULT_SIZE);
    assert!(result.output.iter().all(|&v| v == n));
    assert!(check::compare(&result.output, &check::lmem_loopback_cpu(&a, &b)).passed());
    assert_eq!(result.timings.len(), 11);

    client.close().await.unwrap();
    assert_eq!(server.stats().live_objects(), 0);
}

#[tokio::test]
async fn test_pass_through_over_tcp() {
    let (server, port) = start_server(test_config()).await;
    let client = DfeClient::connect(client_config(port)).await.unwrap();

    let data: Vec<f32> = (1..=DEFAULT_SIZE).map(|i| i as f32).collect();
    let result = session::pass_through(&client, &data).await.unwrap();
    assert_eq!(result.output, data);

    client.close().await.unwrap();
    assert_eq!(server.stats().live_objects(), 0);
}

#[tokio::test]
async fn test_write_read_round_trip_over_tcp() {
    let (server, port) = start_server(test_config()).await;
    let client = DfeClient::connect(client_config(port)).await.unwrap();

    let data: Vec<f32> = (0..10_000).map(|i| (i as f32).sin()).collect();
    let buffer = client.allocate::<f32>(data.len()).await.unwrap();
    client.write_array(&buffer, &data).await.unwrap();
    assert_eq!(client.read_array(&buffer, data.len()).await.unwrap(), data);
    client.free(buffer).await.unwrap();

    let empty = client.allocate::<i32>(0).await.unwrap();
    client.write_array(&empty, &[]).await.unwrap();
    assert!(client.read_array(&empty, 0).await.unwrap().is_empty());
    client.free(empty).await.unwrap();

    assert_eq!(server.stats().live_objects(), 0);
}

#[tokio::test]
async fn test_all_examples_over_tcp() {
    let (server, port) = start_server(test_config()).await;
    let client = DfeClient::connect(client_config(port)).await.unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    for size in [0, 1, 2, DEFAULT_SIZE] {
        for example in Example::ALL {
            let report = run_example(&client, example, size, &mut rng).await.unwrap();
            assert!(
                report.passed(),
                "{} with N = {}: {:?}",
                example,
                size,
                report.mismatches
            );
        }
    }

    assert_eq!(server.stats().live_objects(), 0);
}

#[tokio::test]
async fn test_multiple_clients() {
    let (server, port) = start_server(test_config()).await;

    let mut handles = Vec::new();
    for i in 0..4 {
        let config = client_config(port);
        handles.push(tokio::spawn(async move {
            let client = DfeClient::connect(config).await.unwrap();
            let data: Vec<f32> = (0..256).map(|j| (i * 1000 + j) as f32).collect();
            let result = session::pass_through(&client, &data).await.unwrap();
            assert_eq!(result.output, data);
            client.close().await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(server.stats().live_objects(), 0);
}

#[tokio::test]
async fn test_connection_refused() {
    // Bind then drop to get a port with nothing listening
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let err = match DfeClient::connect(client_config(port)).await {
        Ok(_) => panic!("connected to a closed port"),
        Err(e) => e,
    };
    assert!(matches!(err, DfeError::Transport(TransportError::Io(_))));
}

#[tokio::test]
async fn test_connection_dropped_by_peer() {
    // Accepts one connection, reads a little, then hangs up
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut header = [0u8; 4];
            let _ = stream.read_exact(&mut header).await;
        }
    });

    let client = DfeClient::connect(client_config(port)).await.unwrap();
    let data = vec![1.0f32; 16];
    let err = session::pass_through(&client, &data).await.unwrap_err();
    assert!(err.is_transport(), "unexpected error: {:?}", err);
}

/// Transport that fails every call after the first `limit`
struct FlakyTransport {
    inner: TcpTransport,
    limit: usize,
    calls: AtomicUsize,
}

impl RpcTransport for FlakyTransport {
    fn call(&self, request: RpcRequest) -> TransportFuture<'_, RpcResponse> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.limit {
            return Box::pin(async {
                Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset",
                )))
            });
        }
        self.inner.call(request)
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        self.inner.close()
    }

    fn peer(&self) -> String {
        self.inner.peer()
    }
}

#[tokio::test]
async fn test_transport_failure_mid_session_never_passes() {
    // The sequence issues well over five calls
    for limit in [0, 3, 5] {
        // Cleanup cannot reach the service either, so each run gets its own
        let (_server, port) = start_server(test_config()).await;
        let config = client_config(port);
        let inner = TcpTransport::connect(&config.transport).await.unwrap();
        let transport = Arc::new(FlakyTransport {
            inner,
            limit,
            calls: AtomicUsize::new(0),
        });
        let client = DfeClient::with_transport(config.clone(), transport);

        let n = DEFAULT_SIZE as i32;
        let a: Vec<i32> = (0..n).collect();
        let b: Vec<i32> = (0..n).map(|i| n - i).collect();
        let err = session::lmem_loopback(&client, &a, &b).await.unwrap_err();
        assert!(
            matches!(err, DfeError::Transport(TransportError::Io(_))),
            "limit {}: {:?}",
            limit,
            err
        );
    }
}

#[tokio::test]
async fn test_remote_failure_releases_resources() {
    let (server, port) = start_server(ServerConfig {
        lmem_size: 512,
        ..test_config()
    })
    .await;
    let client = DfeClient::connect(client_config(port)).await.unwrap();

    let a = vec![7i32; DEFAULT_SIZE];
    let err = session::lmem_loopback(&client, &a, &a).await.unwrap_err();
    assert!(err.is_remote(), "unexpected error: {:?}", err);

    let stats = server.stats();
    assert_eq!(stats.live_objects(), 0);
    assert_eq!(stats.pool.used, 0);

    // The connection is still usable after a remote failure
    let data = vec![2.5f32; 8];
    let result = session::pass_through(&client, &data).await.unwrap();
    assert_eq!(result.output, data);
}

#[tokio::test]
async fn test_use_after_free_is_rejected() {
    let (_server, port) = start_server(test_config()).await;
    let transport = Arc::new(
        TcpTransport::connect(&client_config(port).transport)
            .await
            .unwrap(),
    );
    let client = DfeClient::with_transport(client_config(port), transport.clone());

    let buffer = client.allocate::<i32>(4).await.unwrap();
    let handle = buffer.handle();
    client.free(buffer).await.unwrap();

    // Bypass the typed stubs to reuse the stale handle
    let response = transport
        .call(RpcRequest {
            seq_id: 99,
            call: dfe_session::protocol::RpcCall::ReadArray { handle, count: 4 },
        })
        .await
        .unwrap();
    assert_eq!(response.seq_id, 99);
    let message = response.outcome.unwrap_err().message;
    assert!(message.contains("Invalid"), "{}", message);
}
