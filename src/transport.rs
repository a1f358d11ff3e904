//! RPC transport abstraction
//!
//! Carries framed requests to the service and returns the matching reply.
//! `TcpTransport` talks to a real service over a socket; `LocalTransport`
//! drives an in-process `DfeServer` through the same codec, for tests.

use crate::error::TransportError;
use crate::protocol::{
    decode_frame, encode_frame, read_frame, write_frame, RpcRequest, RpcResponse, DEFAULT_PORT,
};
use crate::server::DfeServer;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Configuration for the TCP transport
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Disable Nagle's algorithm on the socket
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            nodelay: true,
        }
    }
}

impl TransportConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Trait for RPC transport implementations
pub trait RpcTransport: Send + Sync {
    /// Send one request and wait for its reply
    fn call(&self, request: RpcRequest) -> TransportFuture<'_, RpcResponse>;

    /// Close the connection; later calls fail with `TransportError::Closed`
    fn close(&self) -> TransportFuture<'_, ()>;

    /// Human-readable peer description for logs
    fn peer(&self) -> String;
}

/// Buffered TCP connection to a DFE service
pub struct TcpTransport {
    addr: String,
    stream: Mutex<Option<BufStream<TcpStream>>>,
}

impl TcpTransport {
    /// Open a connection
    pub async fn connect(config: &TransportConfig) -> Result<Self, TransportError> {
        let addr = config.addr();
        tracing::debug!("Connecting to {}", addr);

        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(config.nodelay)?;

        Ok(Self {
            addr,
            stream: Mutex::new(Some(BufStream::new(stream))),
        })
    }
}

async fn exchange(
    stream: &mut BufStream<TcpStream>,
    request: &RpcRequest,
) -> Result<RpcResponse, TransportError> {
    write_frame(stream, request).await?;
    read_frame::<_, RpcResponse>(stream)
        .await?
        .ok_or(TransportError::Closed)
}

impl RpcTransport for TcpTransport {
    fn call(&self, request: RpcRequest) -> TransportFuture<'_, RpcResponse> {
        Box::pin(async move {
            let mut guard = self.stream.lock().await;
            let stream = guard.as_mut().ok_or(TransportError::Closed)?;

            let result = exchange(stream, &request).await;

            // The stream position is unknown after a failed exchange
            if result.is_err() {
                tracing::warn!("Dropping connection to {} after transport failure", self.addr);
                *guard = None;
            }
            result
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if let Some(mut stream) = self.stream.lock().await.take() {
                stream.shutdown().await?;
                tracing::debug!("Closed connection to {}", self.addr);
            }
            Ok(())
        })
    }

    fn peer(&self) -> String {
        self.addr.clone()
    }
}

/// In-process transport for testing without a socket
///
/// Requests and replies still pass through the frame codec.
pub struct LocalTransport {
    server: Arc<DfeServer>,
    closed: AtomicBool,
}

impl LocalTransport {
    pub fn new(server: Arc<DfeServer>) -> Self {
        Self {
            server,
            closed: AtomicBool::new(false),
        }
    }
}

impl RpcTransport for LocalTransport {
    fn call(&self, request: RpcRequest) -> TransportFuture<'_, RpcResponse> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            let request: RpcRequest = decode_frame(&encode_frame(&request)?)?;
            let response = self.server.handle_request(request);
            decode_frame(&encode_frame(&response)?)
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        self.closed.store(true, Ordering::Release);
        Box::pin(async { Ok(()) })
    }

    fn peer(&self) -> String {
        "local".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RemoteHandle, RpcCall, RpcValue};
    use crate::server::ServerConfig;

    fn local() -> LocalTransport {
        LocalTransport::new(Arc::new(DfeServer::new(ServerConfig {
            memory_pool_size: 1024 * 1024,
            lmem_size: 4096,
            ..Default::default()
        })))
    }

    #[tokio::test]
    async fn test_local_transport_round_trip() {
        let transport = local();

        let response = transport
            .call(RpcRequest {
                seq_id: 5,
                call: RpcCall::Allocate {
                    element_type: crate::protocol::ElementType::Int32,
                    count: 4,
                },
            })
            .await
            .unwrap();
        assert_eq!(response.seq_id, 5);
        assert!(matches!(response.outcome, Ok(RpcValue::Handle(_))));

        let response = transport
            .call(RpcRequest {
                seq_id: 6,
                call: RpcCall::Free {
                    handle: RemoteHandle(999),
                },
            })
            .await
            .unwrap();
        assert!(response.outcome.is_err());
    }

    #[tokio::test]
    async fn test_local_transport_close() {
        let transport = local();
        transport.close().await.unwrap();

        let result = transport
            .call(RpcRequest {
                seq_id: 0,
                call: RpcCall::Free {
                    handle: RemoteHandle(1),
                },
            })
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = TransportConfig {
            host: "127.0.0.1".to_string(),
            port,
            nodelay: true,
        };
        let result = TcpTransport::connect(&config).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }
}
