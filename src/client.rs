//! DFE client implementation
//!
//! Typed stubs over the session protocol. Every call is issued and its
//! reply awaited before the next one goes out. Handles returned by the
//! service are wrapped in move-only types so a freed buffer, unloaded
//! engine or released image cannot be passed to a later call.

use crate::error::{DfeError, Result, TransportError};
use crate::protocol::{
    AcceleratorImage, ActionDescriptor, Element, RemoteHandle, RpcCall, RpcRequest, RpcValue,
    ANY_ENGINE,
};
use crate::transport::{RpcTransport, TcpTransport, TransportConfig};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Transport configuration
    pub transport: TransportConfig,
    /// Engine selector passed to `load`
    pub engine_selector: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            engine_selector: ANY_ENGINE.to_string(),
        }
    }
}

/// A typed buffer allocated on the service
#[derive(Debug)]
pub struct RemoteBuffer<T: Element> {
    handle: RemoteHandle,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> RemoteBuffer<T> {
    pub fn handle(&self) -> RemoteHandle {
        self.handle
    }

    /// Capacity in elements
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> u64 {
        (self.len * T::TYPE.size()) as u64
    }
}

/// An initialized accelerator image
#[derive(Debug)]
pub struct ImageHandle {
    handle: RemoteHandle,
    image: AcceleratorImage,
}

impl ImageHandle {
    pub fn handle(&self) -> RemoteHandle {
        self.handle
    }

    pub fn image(&self) -> AcceleratorImage {
        self.image
    }
}

/// A loaded engine
#[derive(Debug)]
pub struct EngineHandle(RemoteHandle);

impl EngineHandle {
    pub fn handle(&self) -> RemoteHandle {
        self.0
    }
}

/// Action descriptor stored on the service
#[derive(Debug)]
pub struct ActionHandle(RemoteHandle);

impl ActionHandle {
    pub fn handle(&self) -> RemoteHandle {
        self.0
    }
}

/// DFE client
pub struct DfeClient {
    config: ClientConfig,
    transport: Arc<dyn RpcTransport>,
    /// Sequence id counter
    seq_counter: AtomicU32,
}

impl DfeClient {
    /// Connect to the service over TCP
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        tracing::info!("Connecting to DFE service at {}", config.transport.addr());
        let transport = TcpTransport::connect(&config.transport).await?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Build a client over an existing transport
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            config,
            transport,
            seq_counter: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn peer(&self) -> String {
        self.transport.peer()
    }

    async fn invoke(&self, call: RpcCall) -> Result<RpcValue> {
        let method = call.method();
        let seq_id = self.seq_counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("-> {} seq_id={}", method, seq_id);

        let response = self.transport.call(RpcRequest { seq_id, call }).await?;
        if response.seq_id != seq_id {
            return Err(TransportError::SequenceMismatch {
                expected: seq_id,
                got: response.seq_id,
            }
            .into());
        }

        response.outcome.map_err(|e| DfeError::Remote {
            method,
            message: e.message,
        })
    }

    async fn invoke_handle(&self, call: RpcCall) -> Result<RemoteHandle> {
        let method = call.method();
        match self.invoke(call).await? {
            RpcValue::Handle(handle) => Ok(handle),
            other => Err(unexpected(method, &other)),
        }
    }

    async fn invoke_unit(&self, call: RpcCall) -> Result<()> {
        let method = call.method();
        match self.invoke(call).await? {
            RpcValue::Unit => Ok(()),
            other => Err(unexpected(method, &other)),
        }
    }

    /// Initialize an accelerator image
    pub async fn init(&self, image: AcceleratorImage) -> Result<ImageHandle> {
        let handle = self.invoke_handle(RpcCall::Init { image }).await?;
        Ok(ImageHandle { handle, image })
    }

    /// Load an image onto an engine matching `selector`
    pub async fn load(&self, image: &ImageHandle, selector: &str) -> Result<EngineHandle> {
        let handle = self
            .invoke_handle(RpcCall::Load {
                image: image.handle,
                selector: selector.to_string(),
            })
            .await?;
        Ok(EngineHandle(handle))
    }

    /// Allocate a buffer of `len` elements on the service
    pub async fn allocate<T: Element>(&self, len: usize) -> Result<RemoteBuffer<T>> {
        let handle = self
            .invoke_handle(RpcCall::Allocate {
                element_type: T::TYPE,
                count: len as u64,
            })
            .await?;
        Ok(RemoteBuffer {
            handle,
            len,
            _marker: PhantomData,
        })
    }

    /// Upload `data` to the start of `buffer`
    pub async fn write_array<T: Element>(&self, buffer: &RemoteBuffer<T>, data: &[T]) -> Result<()> {
        if data.len() > buffer.len {
            return Err(DfeError::LengthMismatch {
                expected: buffer.len,
                got: data.len(),
            });
        }
        self.invoke_unit(RpcCall::WriteArray {
            handle: buffer.handle,
            data: T::into_array(data.to_vec()),
        })
        .await
    }

    /// Download the first `count` elements of `buffer`
    pub async fn read_array<T: Element>(
        &self,
        buffer: &RemoteBuffer<T>,
        count: usize,
    ) -> Result<Vec<T>> {
        if count > buffer.len {
            return Err(DfeError::LengthMismatch {
                expected: buffer.len,
                got: count,
            });
        }
        let value = self
            .invoke(RpcCall::ReadArray {
                handle: buffer.handle,
                count: count as u64,
            })
            .await?;

        let array = match value {
            RpcValue::Array(array) => array,
            other => return Err(unexpected("read_array", &other)),
        };
        let element_type = array.element_type();
        let data = T::from_array(array).ok_or(DfeError::TypeMismatch {
            expected: T::TYPE.name(),
            got: element_type.name(),
        })?;
        if data.len() != count {
            return Err(DfeError::LengthMismatch {
                expected: count,
                got: data.len(),
            });
        }
        Ok(data)
    }

    /// Free a buffer
    pub async fn free<T: Element>(&self, buffer: RemoteBuffer<T>) -> Result<()> {
        self.free_handle(buffer.handle).await
    }

    pub(crate) async fn free_handle(&self, handle: RemoteHandle) -> Result<()> {
        self.invoke_unit(RpcCall::Free { handle }).await
    }

    /// Store an action descriptor on the service
    pub async fn send_actions(&self, actions: ActionDescriptor) -> Result<ActionHandle> {
        let handle = self.invoke_handle(RpcCall::SendActions { actions }).await?;
        Ok(ActionHandle(handle))
    }

    /// Run stored actions on an engine
    pub async fn run_actions(&self, engine: &EngineHandle, actions: &ActionHandle) -> Result<()> {
        self.invoke_unit(RpcCall::RunActions {
            engine: engine.0,
            actions: actions.0,
        })
        .await
    }

    pub async fn free_actions(&self, actions: ActionHandle) -> Result<()> {
        self.free_handle(actions.0).await
    }

    pub async fn unload(&self, engine: EngineHandle) -> Result<()> {
        self.unload_handle(engine.0).await
    }

    pub(crate) async fn unload_handle(&self, engine: RemoteHandle) -> Result<()> {
        self.invoke_unit(RpcCall::Unload { engine }).await
    }

    pub async fn release_image(&self, image: ImageHandle) -> Result<()> {
        self.release_image_handle(image.handle).await
    }

    pub(crate) async fn release_image_handle(&self, image: RemoteHandle) -> Result<()> {
        self.invoke_unit(RpcCall::ReleaseImage { image }).await
    }

    /// Run a single-stream kernel directly on `size` elements
    pub async fn compute<T: Element>(
        &self,
        image: AcceleratorImage,
        size: usize,
        input: &RemoteBuffer<T>,
        output: &RemoteBuffer<T>,
    ) -> Result<()> {
        self.invoke_unit(RpcCall::Compute {
            image,
            size: size as u64,
            input: input.handle,
            output: output.handle,
        })
        .await
    }

    /// Close the connection
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await?;
        tracing::info!("Disconnected from {}", self.peer());
        Ok(())
    }
}

fn unexpected(method: &'static str, value: &RpcValue) -> DfeError {
    TransportError::UnexpectedReply {
        method,
        detail: format!("{:?}", value),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{DfeServer, ServerConfig};
    use crate::transport::LocalTransport;

    fn local_client() -> (Arc<DfeServer>, DfeClient) {
        let server = Arc::new(DfeServer::new(ServerConfig {
            memory_pool_size: 1024 * 1024,
            lmem_size: 64 * 1024,
            ..Default::default()
        }));
        let transport = Arc::new(LocalTransport::new(Arc::clone(&server)));
        (server, DfeClient::with_transport(ClientConfig::default(), transport))
    }

    #[test]
    fn test_default_config_matches_any_engine() {
        let config = ClientConfig::default();
        assert_eq!(config.engine_selector, ANY_ENGINE);
        assert_eq!(config.transport.port, crate::protocol::DEFAULT_PORT);
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let (server, client) = local_client();

        let data: Vec<i32> = (0..384).map(|i| i * 3 - 100).collect();
        let buffer = client.allocate::<i32>(data.len()).await.unwrap();
        client.write_array(&buffer, &data).await.unwrap();
        let read = client.read_array(&buffer, data.len()).await.unwrap();
        assert_eq!(read, data);

        client.free(buffer).await.unwrap();
        assert_eq!(server.stats().live_objects(), 0);
    }

    #[tokio::test]
    async fn test_length_checks_happen_before_the_call() {
        let (_server, client) = local_client();
        let buffer = client.allocate::<f32>(2).await.unwrap();

        let err = client
            .write_array(&buffer, &[1.0, 2.0, 3.0])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DfeError::LengthMismatch {
                expected: 2,
                got: 3
            }
        ));

        let err = client.read_array(&buffer, 3).await.unwrap_err();
        assert!(matches!(err, DfeError::LengthMismatch { .. }));
    }

    #[tokio::test]
    async fn test_remote_failure_carries_method_and_message() {
        let (_server, client) = local_client();
        let image = client.init(AcceleratorImage::Simple).await.unwrap();

        let err = client.load(&image, "remote:3").await.unwrap_err();
        match err {
            DfeError::Remote { method, message } => {
                assert_eq!(method, "load");
                assert!(message.contains("remote:3"));
            }
            other => panic!("expected remote failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_client_reports_transport_failure() {
        let (_server, client) = local_client();
        client.close().await.unwrap();

        let err = client.allocate::<i32>(4).await.unwrap_err();
        assert!(err.is_transport());
    }
}
