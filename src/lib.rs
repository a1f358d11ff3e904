pub mod check;
pub mod client;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod scope;
pub mod server;
pub mod session;
pub mod suite;
pub mod transport;

pub use client::{ClientConfig, DfeClient, RemoteBuffer};
pub use error::{DfeError, TransportError};
pub use protocol::{AcceleratorImage, ActionDescriptor, ComputeAction, ElementType};
pub use server::{DfeServer, ServerConfig};
pub use session::{SessionOutput, Stage, StageTimings};
pub use transport::{LocalTransport, RpcTransport, TcpTransport, TransportConfig};
