//! Remote object ledger for a single session
//!
//! Every object a session acquires is recorded here and dropped from the
//! ledger when the session releases it. When a session stops early the
//! remaining objects are released newest first, so actions and buffers
//! go before the engine, and the engine before its image.

use crate::client::{ActionHandle, DfeClient, EngineHandle, ImageHandle, RemoteBuffer};
use crate::error::Result;
use crate::protocol::{AcceleratorImage, ActionDescriptor, Element, RemoteHandle};
use std::fmt;

/// An acquired remote object awaiting release
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteObject {
    Buffer(RemoteHandle),
    Actions(RemoteHandle),
    Engine(RemoteHandle),
    Image(RemoteHandle),
}

impl RemoteObject {
    fn handle(&self) -> RemoteHandle {
        match *self {
            RemoteObject::Buffer(h)
            | RemoteObject::Actions(h)
            | RemoteObject::Engine(h)
            | RemoteObject::Image(h) => h,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            RemoteObject::Buffer(_) => "buffer",
            RemoteObject::Actions(_) => "actions",
            RemoteObject::Engine(_) => "engine",
            RemoteObject::Image(_) => "image",
        }
    }
}

impl fmt::Display for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.handle())
    }
}

/// Tracks the remote objects a session holds
pub struct RemoteScope<'c> {
    client: &'c DfeClient,
    live: Vec<RemoteObject>,
}

impl<'c> RemoteScope<'c> {
    pub fn new(client: &'c DfeClient) -> Self {
        Self {
            client,
            live: Vec::new(),
        }
    }

    /// Client for calls that neither acquire nor release
    pub fn client(&self) -> &'c DfeClient {
        self.client
    }

    /// Objects still held, oldest first
    pub fn live(&self) -> &[RemoteObject] {
        &self.live
    }

    fn forget(&mut self, object: RemoteObject) {
        if let Some(pos) = self.live.iter().rposition(|o| *o == object) {
            self.live.remove(pos);
        }
    }

    pub async fn init(&mut self, image: AcceleratorImage) -> Result<ImageHandle> {
        let handle = self.client.init(image).await?;
        self.live.push(RemoteObject::Image(handle.handle()));
        Ok(handle)
    }

    /// Load `image` using the client's engine selector
    pub async fn load(&mut self, image: &ImageHandle) -> Result<EngineHandle> {
        let selector = self.client.config().engine_selector.as_str();
        let engine = self.client.load(image, selector).await?;
        self.live.push(RemoteObject::Engine(engine.handle()));
        Ok(engine)
    }

    pub async fn allocate<T: Element>(&mut self, len: usize) -> Result<RemoteBuffer<T>> {
        let buffer = self.client.allocate::<T>(len).await?;
        self.live.push(RemoteObject::Buffer(buffer.handle()));
        Ok(buffer)
    }

    /// Allocate a buffer and upload `data` into it
    pub async fn upload<T: Element>(&mut self, data: &[T]) -> Result<RemoteBuffer<T>> {
        let buffer = self.allocate::<T>(data.len()).await?;
        self.client.write_array(&buffer, data).await?;
        Ok(buffer)
    }

    pub async fn send_actions(&mut self, actions: ActionDescriptor) -> Result<ActionHandle> {
        let handle = self.client.send_actions(actions).await?;
        self.live.push(RemoteObject::Actions(handle.handle()));
        Ok(handle)
    }

    /// Store, run and free a one-shot action descriptor
    pub async fn run(&mut self, engine: &EngineHandle, actions: ActionDescriptor) -> Result<()> {
        let handle = self.send_actions(actions).await?;
        self.client.run_actions(engine, &handle).await?;
        self.free_actions(handle).await
    }

    pub async fn free<T: Element>(&mut self, buffer: RemoteBuffer<T>) -> Result<()> {
        self.forget(RemoteObject::Buffer(buffer.handle()));
        self.client.free(buffer).await
    }

    pub async fn free_actions(&mut self, actions: ActionHandle) -> Result<()> {
        self.forget(RemoteObject::Actions(actions.handle()));
        self.client.free_actions(actions).await
    }

    pub async fn unload(&mut self, engine: EngineHandle) -> Result<()> {
        self.forget(RemoteObject::Engine(engine.handle()));
        self.client.unload(engine).await
    }

    pub async fn release_image(&mut self, image: ImageHandle) -> Result<()> {
        self.forget(RemoteObject::Image(image.handle()));
        self.client.release_image(image).await
    }

    /// Release everything still held, newest first
    ///
    /// Keeps going past failures and returns the first one.
    pub async fn release_all(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(object) = self.live.pop() {
            let handle = object.handle();
            let result = match object {
                RemoteObject::Buffer(_) | RemoteObject::Actions(_) => {
                    self.client.free_handle(handle).await
                }
                RemoteObject::Engine(_) => self.client.unload_handle(handle).await,
                RemoteObject::Image(_) => self.client.release_image_handle(handle).await,
            };
            if let Err(e) = result {
                tracing::warn!("Failed to release {}: {}", object, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Settle the session outcome
    ///
    /// On failure, remaining objects are released best effort and the
    /// original error is returned.
    pub async fn finish<T>(mut self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                if !self.live.is_empty() {
                    tracing::debug!("Releasing {} remote objects left by session", self.live.len());
                }
                self.release_all().await?;
                Ok(value)
            }
            Err(e) => {
                if !self.live.is_empty() {
                    tracing::warn!(
                        "Session failed ({}), releasing {} remote objects",
                        e,
                        self.live.len()
                    );
                    if let Err(cleanup) = self.release_all().await {
                        tracing::warn!("Cleanup incomplete: {}", cleanup);
                    }
                }
                Err(e)
            }
        }
    }
}

impl Drop for RemoteScope<'_> {
    fn drop(&mut self) {
        if !self.live.is_empty() {
            tracing::warn!("{} remote objects were never released", self.live.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::error::DfeError;
    use crate::protocol::ComputeAction;
    use crate::server::{DfeServer, ServerConfig};
    use crate::transport::LocalTransport;
    use std::sync::Arc;

    fn local_client() -> (Arc<DfeServer>, DfeClient) {
        let server = Arc::new(DfeServer::new(ServerConfig {
            memory_pool_size: 1024 * 1024,
            lmem_size: 4096,
            ..Default::default()
        }));
        let transport = Arc::new(LocalTransport::new(Arc::clone(&server)));
        (server, DfeClient::with_transport(ClientConfig::default(), transport))
    }

    #[tokio::test]
    async fn test_release_all_frees_in_reverse_order() {
        let (server, client) = local_client();
        let mut scope = RemoteScope::new(&client);

        let image = scope.init(AcceleratorImage::Simple).await.unwrap();
        let engine = scope.load(&image).await.unwrap();
        let _x = scope.upload(&[1.0f32, 2.0]).await.unwrap();
        let _actions = scope
            .send_actions(ActionDescriptor::Compute(ComputeAction::new()))
            .await
            .unwrap();
        assert_eq!(scope.live().len(), 4);
        assert_eq!(scope.live()[1], RemoteObject::Engine(engine.handle()));

        // The image cannot be released while loaded, so order matters
        scope.release_all().await.unwrap();
        assert!(scope.live().is_empty());
        assert_eq!(server.stats().live_objects(), 0);
    }

    #[tokio::test]
    async fn test_finish_keeps_original_error() {
        let (server, client) = local_client();
        let mut scope = RemoteScope::new(&client);

        let outcome: Result<()> = async {
            let image = scope.init(AcceleratorImage::LMemLoopback).await?;
            let engine = scope.load(&image).await?;
            let data = scope.upload(&[1i32; 8]).await?;
            // Past the end of a 4 KiB LMem
            scope
                .run(
                    &engine,
                    ActionDescriptor::WriteLMem {
                        address: 4090,
                        nbytes: data.byte_len(),
                        source: data.handle(),
                    },
                )
                .await
        }
        .await;

        let err = scope.finish(outcome).await.unwrap_err();
        match err {
            DfeError::Remote { method, .. } => assert_eq!(method, "run_actions"),
            other => panic!("expected remote failure, got {:?}", other),
        }
        assert_eq!(server.stats().live_objects(), 0);
    }

    #[test]
    fn test_remote_object_names_its_handle_once() {
        let object = RemoteObject::Engine(RemoteHandle(0x2a));
        assert_eq!(object.to_string(), "engine 0x0000002a");
        assert_eq!(
            RemoteObject::Buffer(RemoteHandle(7)).to_string(),
            "buffer 0x00000007"
        );
    }

    #[tokio::test]
    async fn test_explicit_release_leaves_nothing_to_clean() {
        let (server, client) = local_client();
        let mut scope = RemoteScope::new(&client);

        let buffer = scope.allocate::<i32>(16).await.unwrap();
        scope.free(buffer).await.unwrap();
        assert!(scope.live().is_empty());

        scope.finish(Ok(())).await.unwrap();
        assert_eq!(server.stats().live_objects(), 0);
    }
}
