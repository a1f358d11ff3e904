//! Protocol types for DFE sessions
//!
//! Wire format is a length-prefixed bincode message per call:
//!
//!   [4 bytes: payload length, big-endian]
//!   [payload: bincode-encoded `RpcRequest` or `RpcResponse`]
//!
//! Each request carries a sequence id that the reply echoes back.

use crate::error::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames above this size are rejected on both ends
pub const MAX_FRAME_LEN: u64 = 256 * 1024 * 1024;

/// Default service port
pub const DEFAULT_PORT: u16 = 9090;

/// Load selector that matches any engine
pub const ANY_ENGINE: &str = "*";

/// Opaque reference to an object owned by the service
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteHandle(pub u64);

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Element type of a remote buffer
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ElementType {
    Int32,
    Float32,
}

impl ElementType {
    /// Width of one element in bytes
    pub const fn size(self) -> usize {
        match self {
            Self::Int32 | Self::Float32 => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Int32 => "int32_t",
            Self::Float32 => "float",
        }
    }
}

/// A full array payload, sent or received in one call
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum TypedArray {
    Int32(Vec<i32>),
    Float32(Vec<f32>),
}

impl TypedArray {
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Int32(_) => ElementType::Int32,
            Self::Float32(_) => ElementType::Float32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int32(v) => v.len(),
            Self::Float32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * self.element_type().size()
    }

    /// Pack the elements little-endian, the layout the accelerator sees
    pub fn to_le_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.byte_len());
        match self {
            Self::Int32(v) => v.iter().for_each(|x| buf.put_i32_le(*x)),
            Self::Float32(v) => v.iter().for_each(|x| buf.put_f32_le(*x)),
        }
        buf.freeze()
    }

    /// Unpack little-endian elements; trailing partial elements are ignored
    pub fn from_le_bytes(element_type: ElementType, mut bytes: &[u8]) -> Self {
        let count = bytes.len() / element_type.size();
        match element_type {
            ElementType::Int32 => Self::Int32((0..count).map(|_| bytes.get_i32_le()).collect()),
            ElementType::Float32 => {
                Self::Float32((0..count).map(|_| bytes.get_f32_le()).collect())
            }
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for i32 {}
    impl Sealed for f32 {}
}

/// Element types that can live in a remote buffer
pub trait Element:
    sealed::Sealed + Copy + PartialEq + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    const TYPE: ElementType;

    fn into_array(values: Vec<Self>) -> TypedArray;

    /// Returns `None` if the array holds a different element type
    fn from_array(array: TypedArray) -> Option<Vec<Self>>;
}

impl Element for i32 {
    const TYPE: ElementType = ElementType::Int32;

    fn into_array(values: Vec<Self>) -> TypedArray {
        TypedArray::Int32(values)
    }

    fn from_array(array: TypedArray) -> Option<Vec<Self>> {
        match array {
            TypedArray::Int32(v) => Some(v),
            _ => None,
        }
    }
}

impl Element for f32 {
    const TYPE: ElementType = ElementType::Float32;

    fn into_array(values: Vec<Self>) -> TypedArray {
        TypedArray::Float32(values)
    }

    fn from_array(array: TypedArray) -> Option<Vec<Self>> {
        match array {
            TypedArray::Float32(v) => Some(v),
            _ => None,
        }
    }
}

/// Accelerator configurations the service knows how to load
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AcceleratorImage {
    LMemLoopback,
    PassThrough,
    Simple,
    MovingAverage,
    VectorAddition,
}

impl AcceleratorImage {
    pub fn name(self) -> &'static str {
        match self {
            Self::LMemLoopback => "LMemLoopback",
            Self::PassThrough => "PassThrough",
            Self::Simple => "Simple",
            Self::MovingAverage => "MovingAverage",
            Self::VectorAddition => "VectorAddition",
        }
    }
}

impl fmt::Display for AcceleratorImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A remote buffer queued as a named kernel stream
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamBinding {
    pub name: String,
    pub handle: RemoteHandle,
    pub nbytes: u64,
}

/// Parameters and streams for one kernel run
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputeAction {
    pub params: SmallVec<[(String, u64); 4]>,
    pub inputs: SmallVec<[StreamBinding; 2]>,
    pub outputs: SmallVec<[StreamBinding; 2]>,
}

impl ComputeAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_param(mut self, name: &str, value: u64) -> Self {
        self.params.push((name.to_string(), value));
        self
    }

    pub fn queue_input(mut self, name: &str, handle: RemoteHandle, nbytes: u64) -> Self {
        self.inputs.push(StreamBinding {
            name: name.to_string(),
            handle,
            nbytes,
        });
        self
    }

    pub fn queue_output(mut self, name: &str, handle: RemoteHandle, nbytes: u64) -> Self {
        self.outputs.push(StreamBinding {
            name: name.to_string(),
            handle,
            nbytes,
        });
        self
    }

    pub fn param(&self, name: &str) -> Option<u64> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn input(&self, name: &str) -> Option<&StreamBinding> {
        self.inputs.iter().find(|s| s.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&StreamBinding> {
        self.outputs.iter().find(|s| s.name == name)
    }
}

/// One operation for the accelerator to perform
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionDescriptor {
    /// Copy `nbytes` from a remote buffer into LMem at `address`
    WriteLMem {
        address: u64,
        nbytes: u64,
        source: RemoteHandle,
    },
    /// Copy `nbytes` from LMem at `address` into a remote buffer
    ReadLMem {
        address: u64,
        nbytes: u64,
        destination: RemoteHandle,
    },
    /// Run the loaded kernel
    Compute(ComputeAction),
}

impl ActionDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WriteLMem { .. } => "writeLMem",
            Self::ReadLMem { .. } => "readLMem",
            Self::Compute(_) => "default",
        }
    }
}

/// Remote methods exposed by the service
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum RpcCall {
    Init {
        image: AcceleratorImage,
    },
    Load {
        image: RemoteHandle,
        selector: String,
    },
    Allocate {
        element_type: ElementType,
        count: u64,
    },
    WriteArray {
        handle: RemoteHandle,
        data: TypedArray,
    },
    ReadArray {
        handle: RemoteHandle,
        count: u64,
    },
    Free {
        handle: RemoteHandle,
    },
    SendActions {
        actions: ActionDescriptor,
    },
    RunActions {
        engine: RemoteHandle,
        actions: RemoteHandle,
    },
    Unload {
        engine: RemoteHandle,
    },
    ReleaseImage {
        image: RemoteHandle,
    },
    Compute {
        image: AcceleratorImage,
        size: u64,
        input: RemoteHandle,
        output: RemoteHandle,
    },
}

impl RpcCall {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Load { .. } => "load",
            Self::Allocate { .. } => "allocate",
            Self::WriteArray { .. } => "write_array",
            Self::ReadArray { .. } => "read_array",
            Self::Free { .. } => "free",
            Self::SendActions { .. } => "send_actions",
            Self::RunActions { .. } => "run_actions",
            Self::Unload { .. } => "unload",
            Self::ReleaseImage { .. } => "release_image",
            Self::Compute { .. } => "compute",
        }
    }
}

/// Return value of a successful call
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum RpcValue {
    Unit,
    Handle(RemoteHandle),
    Array(TypedArray),
}

/// Failure raised by the service while executing a call
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteException {
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub seq_id: u32,
    pub call: RpcCall,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub seq_id: u32,
    pub outcome: Result<RpcValue, RemoteException>,
}

impl RpcResponse {
    pub fn ok(seq_id: u32, value: RpcValue) -> Self {
        Self {
            seq_id,
            outcome: Ok(value),
        }
    }

    pub fn exception(seq_id: u32, message: impl Into<String>) -> Self {
        Self {
            seq_id,
            outcome: Err(RemoteException {
                message: message.into(),
            }),
        }
    }
}

/// Serialize a message into a complete frame (length prefix included)
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Bytes, TransportError> {
    let payload = bincode::serialize(message)?;
    if payload.len() as u64 > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(payload.len() as u64));
    }

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Decode a complete frame produced by `encode_frame`
pub fn decode_frame<T: DeserializeOwned>(mut frame: &[u8]) -> Result<T, TransportError> {
    if frame.len() < 4 {
        return Err(TransportError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated frame header",
        )));
    }
    let len = frame.get_u32() as u64;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    if frame.len() as u64 != len {
        return Err(TransportError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} does not match payload of {} bytes", len, frame.len()),
        )));
    }
    Ok(bincode::deserialize(frame)?)
}

/// Write one frame and flush
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` if the peer closed cleanly between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as u64,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}
