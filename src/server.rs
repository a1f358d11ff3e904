//! Reference accelerator service
//!
//! Speaks the session protocol over TCP and simulates the accelerator in
//! host memory: remote buffers live in a `MemoryPool`, each loaded engine
//! owns a `LocalMemory` (LMem), and kernels run on the host.

use crate::error::TransportError;
use crate::memory::{LocalMemory, MemoryPool, MemoryPoolConfig, PoolAllocation, PoolStats};
use crate::protocol::{
    read_frame, write_frame, AcceleratorImage, ActionDescriptor, ComputeAction, Element,
    ElementType, RemoteHandle, RpcCall, RpcRequest, RpcResponse, RpcValue, StreamBinding, TypedArray,
    ANY_ENGINE, DEFAULT_PORT,
};
use anyhow::{anyhow, bail, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// TCP listen address
    pub listen_addr: String,
    /// Host memory available for remote buffers, in bytes
    pub memory_pool_size: usize,
    /// LMem size per engine, in bytes
    pub lmem_size: usize,
    /// Number of engines that can be loaded at once
    pub num_engines: usize,
    /// Name matched by non-wildcard load selectors
    pub device_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            memory_pool_size: 256 * 1024 * 1024, // 256MB
            lmem_size: 64 * 1024 * 1024,         // 64MB
            num_engines: 1,
            device_name: "local:0".to_string(),
        }
    }
}

/// A remote buffer as the service sees it
#[derive(Clone, Copy, Debug)]
struct BufferEntry {
    element_type: ElementType,
    capacity: usize,
    allocation: PoolAllocation,
}

impl BufferEntry {
    fn byte_capacity(&self) -> usize {
        self.allocation.size
    }
}

/// A loaded engine
struct Engine {
    image: AcceleratorImage,
    /// Image handle the engine was loaded from
    source: RemoteHandle,
    lmem: Mutex<LocalMemory>,
}

/// Counts of live remote objects
#[derive(Clone, Debug)]
pub struct ServerStats {
    pub buffers: usize,
    pub actions: usize,
    pub images: usize,
    pub engines: usize,
    pub pool: PoolStats,
}

impl ServerStats {
    /// Objects a well-behaved session must have released before disconnecting
    pub fn live_objects(&self) -> usize {
        self.buffers + self.actions + self.images + self.engines
    }
}

/// Reference DFE service
pub struct DfeServer {
    config: ServerConfig,
    memory_pool: RwLock<MemoryPool>,
    buffers: DashMap<RemoteHandle, BufferEntry>,
    actions: DashMap<RemoteHandle, ActionDescriptor>,
    images: DashMap<RemoteHandle, AcceleratorImage>,
    engines: DashMap<RemoteHandle, Arc<Engine>>,
    /// Engine slots in use, reserved before an engine is inserted
    engine_slots: AtomicUsize,
    /// Next handle value; 0 is never handed out
    next_handle: AtomicU64,
}

impl DfeServer {
    pub fn new(config: ServerConfig) -> Self {
        let memory_pool = MemoryPool::new(MemoryPoolConfig {
            size: config.memory_pool_size,
            ..Default::default()
        });

        Self {
            config,
            memory_pool: RwLock::new(memory_pool),
            buffers: DashMap::new(),
            actions: DashMap::new(),
            images: DashMap::new(),
            engines: DashMap::new(),
            engine_slots: AtomicUsize::new(0),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            buffers: self.buffers.len(),
            actions: self.actions.len(),
            images: self.images.len(),
            engines: self.engines.len(),
            pool: self.memory_pool.read().stats(),
        }
    }

    fn new_handle(&self) -> RemoteHandle {
        RemoteHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Execute one request, turning failures into remote exceptions
    pub fn handle_request(&self, request: RpcRequest) -> RpcResponse {
        let method = request.call.method();
        tracing::debug!("{} request: seq_id={}", method, request.seq_id);

        match self.dispatch(request.call) {
            Ok(value) => RpcResponse::ok(request.seq_id, value),
            Err(e) => {
                tracing::warn!("{} failed: seq_id={}, error={}", method, request.seq_id, e);
                RpcResponse::exception(request.seq_id, e.to_string())
            }
        }
    }

    /// Execute one call against the service state
    pub fn dispatch(&self, call: RpcCall) -> Result<RpcValue> {
        match call {
            RpcCall::Init { image } => self.init(image).map(RpcValue::Handle),
            RpcCall::Load { image, selector } => self.load(image, &selector).map(RpcValue::Handle),
            RpcCall::Allocate {
                element_type,
                count,
            } => self.allocate(element_type, count).map(RpcValue::Handle),
            RpcCall::WriteArray { handle, data } => {
                self.write_array(handle, &data).map(|_| RpcValue::Unit)
            }
            RpcCall::ReadArray { handle, count } => {
                self.read_array(handle, count).map(RpcValue::Array)
            }
            RpcCall::Free { handle } => self.free(handle).map(|_| RpcValue::Unit),
            RpcCall::SendActions { actions } => {
                let handle = self.new_handle();
                tracing::debug!("Stored {} actions as {}", actions.kind(), handle);
                self.actions.insert(handle, actions);
                Ok(RpcValue::Handle(handle))
            }
            RpcCall::RunActions { engine, actions } => {
                self.run_actions(engine, actions).map(|_| RpcValue::Unit)
            }
            RpcCall::Unload { engine } => self.unload(engine).map(|_| RpcValue::Unit),
            RpcCall::ReleaseImage { image } => self.release_image(image).map(|_| RpcValue::Unit),
            RpcCall::Compute {
                image,
                size,
                input,
                output,
            } => self.compute(image, size, input, output).map(|_| RpcValue::Unit),
        }
    }

    fn init(&self, image: AcceleratorImage) -> Result<RemoteHandle> {
        let handle = self.new_handle();
        self.images.insert(handle, image);
        tracing::info!("Initialized image {} as {}", image, handle);
        Ok(handle)
    }

    fn load(&self, source: RemoteHandle, selector: &str) -> Result<RemoteHandle> {
        let image = *self
            .images
            .get(&source)
            .ok_or_else(|| anyhow!("Invalid image handle {}", source))?;

        if selector != ANY_ENGINE && selector != self.config.device_name {
            bail!("No engine matches selector '{}'", selector);
        }
        let limit = self.config.num_engines;
        let reserved = self
            .engine_slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            });
        if let Err(loaded) = reserved {
            bail!("No free engine: {} of {} loaded", loaded, limit);
        }

        let handle = self.new_handle();
        self.engines.insert(
            handle,
            Arc::new(Engine {
                image,
                source,
                lmem: Mutex::new(LocalMemory::new(self.config.lmem_size)),
            }),
        );
        tracing::info!("Loaded {} onto engine {}", image, handle);
        Ok(handle)
    }

    fn allocate(&self, element_type: ElementType, count: u64) -> Result<RemoteHandle> {
        let capacity = usize::try_from(count)?;
        let bytes = capacity
            .checked_mul(element_type.size())
            .ok_or_else(|| anyhow!("Allocation of {} elements overflows", count))?;

        let allocation = self.memory_pool.read().allocate(bytes)?;
        let handle = self.new_handle();
        self.buffers.insert(
            handle,
            BufferEntry {
                element_type,
                capacity,
                allocation,
            },
        );
        tracing::debug!(
            "Allocated {} x {} as {}",
            capacity,
            element_type.name(),
            handle
        );
        Ok(handle)
    }

    fn buffer(&self, handle: RemoteHandle) -> Result<BufferEntry> {
        self.buffers
            .get(&handle)
            .map(|entry| *entry)
            .ok_or_else(|| anyhow!("Invalid buffer handle {}", handle))
    }

    fn write_array(&self, handle: RemoteHandle, data: &TypedArray) -> Result<()> {
        let entry = self.buffer(handle)?;
        if data.element_type() != entry.element_type {
            bail!(
                "Buffer {} holds {}, got {} data",
                handle,
                entry.element_type.name(),
                data.element_type().name()
            );
        }
        if data.len() > entry.capacity {
            bail!(
                "Write of {} elements exceeds buffer {} capacity of {}",
                data.len(),
                handle,
                entry.capacity
            );
        }
        self.memory_pool
            .write()
            .write(entry.allocation.offset, &data.to_le_bytes())
    }

    fn read_array(&self, handle: RemoteHandle, count: u64) -> Result<TypedArray> {
        let entry = self.buffer(handle)?;
        let count = usize::try_from(count)?;
        if count > entry.capacity {
            bail!(
                "Read of {} elements exceeds buffer {} capacity of {}",
                count,
                handle,
                entry.capacity
            );
        }
        let pool = self.memory_pool.read();
        let bytes = pool.read(entry.allocation.offset, count * entry.element_type.size())?;
        Ok(TypedArray::from_le_bytes(entry.element_type, bytes))
    }

    fn free(&self, handle: RemoteHandle) -> Result<()> {
        if let Some((_, entry)) = self.buffers.remove(&handle) {
            self.memory_pool.read().deallocate(&entry.allocation);
            tracing::debug!("Freed buffer {}", handle);
            return Ok(());
        }
        if self.actions.remove(&handle).is_some() {
            tracing::debug!("Freed actions {}", handle);
            return Ok(());
        }
        Err(anyhow!("Invalid handle {}", handle))
    }

    fn unload(&self, engine: RemoteHandle) -> Result<()> {
        let (_, engine_state) = self
            .engines
            .remove(&engine)
            .ok_or_else(|| anyhow!("Invalid engine handle {}", engine))?;
        self.engine_slots.fetch_sub(1, Ordering::AcqRel);
        tracing::info!("Unloaded {} from engine {}", engine_state.image, engine);
        Ok(())
    }

    fn release_image(&self, image: RemoteHandle) -> Result<()> {
        let kind = *self
            .images
            .get(&image)
            .ok_or_else(|| anyhow!("Invalid image handle {}", image))?;

        let loaded = self
            .engines
            .iter()
            .filter(|engine| engine.source == image)
            .count();
        if loaded > 0 {
            bail!("Image {} is still loaded on {} engine(s)", kind, loaded);
        }

        self.images.remove(&image);
        tracing::info!("Released image {} ({})", kind, image);
        Ok(())
    }

    fn run_actions(&self, engine: RemoteHandle, actions: RemoteHandle) -> Result<()> {
        let engine = self
            .engines
            .get(&engine)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| anyhow!("Invalid engine handle {}", engine))?;
        let actions = self
            .actions
            .get(&actions)
            .map(|a| a.clone())
            .ok_or_else(|| anyhow!("Invalid actions handle {}", actions))?;

        tracing::debug!("Running {} on {}", actions.kind(), engine.image);

        match actions {
            ActionDescriptor::WriteLMem {
                address,
                nbytes,
                source,
            } => {
                let entry = self.buffer(source)?;
                let nbytes = checked_stream_len(nbytes, &entry)?;
                let pool = self.memory_pool.read();
                let data = pool.read(entry.allocation.offset, nbytes)?;
                engine.lmem.lock().write(address, data)
            }
            ActionDescriptor::ReadLMem {
                address,
                nbytes,
                destination,
            } => {
                let entry = self.buffer(destination)?;
                let nbytes = checked_stream_len(nbytes, &entry)?;
                let data = engine.lmem.lock().read(address, nbytes)?.to_vec();
                self.memory_pool
                    .write()
                    .write(entry.allocation.offset, &data)
            }
            ActionDescriptor::Compute(action) => self.run_kernel(&engine, &action),
        }
    }

    fn run_kernel(&self, engine: &Engine, action: &ComputeAction) -> Result<()> {
        let n = required_param(action, "N")?;

        match engine.image {
            AcceleratorImage::LMemLoopback => {
                let bytes = byte_len(n, ElementType::Int32)?;
                let b_address = bytes as u64;
                let out_address = b_address
                    .checked_mul(2)
                    .ok_or_else(|| anyhow!("LMem layout for N = {} overflows", n))?;
                let mut lmem = engine.lmem.lock();
                let a: Vec<i32> = decode(lmem.read(0, bytes)?);
                let b: Vec<i32> = decode(lmem.read(b_address, bytes)?);
                let sum = TypedArray::Int32(add_i32(&a, &b, 0));
                lmem.write(out_address, &sum.to_le_bytes())
            }
            AcceleratorImage::VectorAddition => {
                let scalar = required_param(action, "A")? as i32;
                let bytes = byte_len(n, ElementType::Int32)?;
                let x: Vec<i32> = decode(engine.lmem.lock().read(0, bytes)?);
                let y: Vec<i32> = self.read_stream(required_input(action, "y")?, n)?;
                let s = add_i32(&x, &y, scalar);
                self.write_stream(required_output(action, "s")?, TypedArray::Int32(s))
            }
            image => {
                let x: Vec<f32> = self.read_stream(required_input(action, "x")?, n)?;
                let y = float_kernel(image, &x)?;
                self.write_stream(required_output(action, "y")?, TypedArray::Float32(y))
            }
        }
    }

    /// Basic-static call: run a single-stream kernel without explicit engine management
    fn compute(
        &self,
        image: AcceleratorImage,
        size: u64,
        input: RemoteHandle,
        output: RemoteHandle,
    ) -> Result<()> {
        let n = usize::try_from(size)?;
        let data = match self.read_array(input, size)? {
            TypedArray::Float32(data) => data,
            TypedArray::Int32(_) => bail!("{} expects a float input stream", image),
        };
        let out_entry = self.buffer(output)?;
        if out_entry.capacity < n {
            bail!(
                "Output buffer {} holds {} elements, {} needed",
                output,
                out_entry.capacity,
                n
            );
        }

        let result = float_kernel(image, &data)?;
        self.write_array(output, &TypedArray::Float32(result))?;
        tracing::debug!("{} computed {} elements", image, n);
        Ok(())
    }

    fn read_stream<T: Element>(&self, binding: &StreamBinding, count: usize) -> Result<Vec<T>> {
        let entry = self.buffer(binding.handle)?;
        if entry.element_type != T::TYPE {
            bail!(
                "Stream {} expects {}, buffer {} holds {}",
                binding.name,
                T::TYPE.name(),
                binding.handle,
                entry.element_type.name()
            );
        }
        let nbytes = checked_stream_len(binding.nbytes, &entry)?;
        let needed = byte_len(count, T::TYPE)?;
        if needed > nbytes {
            bail!(
                "Stream {} queued {} bytes, kernel needs {}",
                binding.name,
                nbytes,
                needed
            );
        }
        let array = self.read_array(binding.handle, count as u64)?;
        T::from_array(array).ok_or_else(|| anyhow!("Stream {} changed type", binding.name))
    }

    fn write_stream(&self, binding: &StreamBinding, data: TypedArray) -> Result<()> {
        let entry = self.buffer(binding.handle)?;
        let nbytes = checked_stream_len(binding.nbytes, &entry)?;
        if data.byte_len() > nbytes {
            bail!(
                "Stream {} queued {} bytes, kernel produced {}",
                binding.name,
                nbytes,
                data.byte_len()
            );
        }
        self.write_array(binding.handle, &data)
    }

    /// Serve one client connection until it disconnects
    async fn handle_connection(&self, stream: TcpStream) -> Result<(), TransportError> {
        let mut stream = BufStream::new(stream);
        while let Some(request) = read_frame::<_, RpcRequest>(&mut stream).await? {
            let response = self.handle_request(request);
            write_frame(&mut stream, &response).await?;
        }
        Ok(())
    }

    /// Accept connections forever, one task per connection
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::info!("Client connected: {}", peer);

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                match server.handle_connection(stream).await {
                    Ok(()) => tracing::info!("Client disconnected: {}", peer),
                    Err(e) => tracing::warn!("Connection {} failed: {}", peer, e),
                }
            });
        }
    }
}

fn required_param(action: &ComputeAction, name: &str) -> Result<usize> {
    let value = action
        .param(name)
        .ok_or_else(|| anyhow!("Missing parameter {}", name))?;
    Ok(usize::try_from(value)?)
}

fn required_input<'a>(action: &'a ComputeAction, name: &str) -> Result<&'a StreamBinding> {
    action
        .input(name)
        .ok_or_else(|| anyhow!("Missing input stream {}", name))
}

fn required_output<'a>(action: &'a ComputeAction, name: &str) -> Result<&'a StreamBinding> {
    action
        .output(name)
        .ok_or_else(|| anyhow!("Missing output stream {}", name))
}

/// Size in bytes of `count` elements
fn byte_len(count: usize, element_type: ElementType) -> Result<usize> {
    count
        .checked_mul(element_type.size())
        .ok_or_else(|| anyhow!("{} x {} overflows", count, element_type.name()))
}

fn checked_stream_len(nbytes: u64, entry: &BufferEntry) -> Result<usize> {
    let nbytes = usize::try_from(nbytes)?;
    if nbytes > entry.byte_capacity() {
        bail!(
            "Transfer of {} bytes exceeds buffer of {} bytes",
            nbytes,
            entry.byte_capacity()
        );
    }
    Ok(nbytes)
}

fn decode<T: Element>(bytes: &[u8]) -> Vec<T> {
    T::from_array(TypedArray::from_le_bytes(T::TYPE, bytes)).unwrap_or_default()
}

fn add_i32(a: &[i32], b: &[i32], scalar: i32) -> Vec<i32> {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.wrapping_add(*y).wrapping_add(scalar))
        .collect()
}

fn float_kernel(image: AcceleratorImage, input: &[f32]) -> Result<Vec<f32>> {
    match image {
        AcceleratorImage::PassThrough => Ok(input.to_vec()),
        AcceleratorImage::Simple => Ok(input.iter().map(|x| x * x + x).collect()),
        AcceleratorImage::MovingAverage => Ok(moving_average(input)),
        other => Err(anyhow!("{} has no single-stream float kernel", other)),
    }
}

fn moving_average(input: &[f32]) -> Vec<f32> {
    let n = input.len();
    if n < 2 {
        return input.to_vec();
    }
    let mut out = Vec::with_capacity(n);
    out.push((input[0] + input[1]) / 2.0);
    for window in input.windows(3) {
        out.push((window[0] + window[1] + window[2]) / 3.0);
    }
    out.push((input[n - 2] + input[n - 1]) / 2.0);
    out
}

/// Run the server
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Starting DFE service on {}", listener.local_addr()?);

    Arc::new(DfeServer::new(config)).serve(listener).await
}
