//! Connection layer: buffers, the per-connection receive loop, the
//! outbound send pipeline and the live-connection registry.

mod buffer;
mod close;
mod connection;
mod history;
mod receive;
mod registry;
mod send;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{BufferPool, PooledBuffer};
pub use close::CloseSignal;
pub use connection::{Connection, ConnectionId, OversizePolicy, SendLimits};
pub use history::{Direction, PacketHistory, PacketRecord, MAX_LAST_PACKETS};
pub use receive::{BoxedReader, ProtocolFault};
pub use registry::ConnectionRegistry;
pub use send::{BoxedWriter, SendError, SendPipeline};

pub(crate) use receive::receive_loop;
