//! Async side of the validator stream: sockets, the pending request table,
//! inbound dispatch and the connection that ties them together.

pub mod backoff;
pub mod channel;
pub mod connection;
pub mod dispatcher;
pub mod pending;
pub mod socket;
pub mod tcp;

pub use backoff::ExponentialBackoff;
pub use channel::{channel_pair, ChannelPeer, ChannelSocket, ChannelSocketFactory};
pub use connection::{Connection, ConnectionState, ConnectionStats, Replier};
pub use dispatcher::{DispatchStats, InboundHandler, InboundQueue, Route};
pub use pending::{PendingStats, PendingTable, ReplySlot, Resolution, RetiredIds, Settlement};
pub use socket::{EventSink, MessageSocket, SocketEvent, SocketFactory};
pub use tcp::{parse_address, TcpSocket, TcpSocketFactory};
