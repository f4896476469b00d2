pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod operation;
pub mod parser;
pub mod session;
pub mod subscription;
pub mod transport;

pub use codec::{StompCodec, StompItem, decode, encode};
pub use config::{ConnectOptions, HeartbeatPolicy, SessionConfig};
pub use error::{Result, ServerError, StompError};
pub use frame::{Command, Frame};
pub use heartbeat::{
    Heartbeat, HeartbeatStats, negotiate, negotiate_heartbeats, parse_heartbeat_header,
};
pub use operation::{Expectation, Operation, OperationId, OperationState};
pub use session::{Session, SessionEvent, SessionState};
pub use subscription::{AckMode, MessageHandler, Subscription, SubscriptionOptions};
pub use transport::{MemoryPeer, MemoryTransport, TcpTransport, Transport, TransportEvent};

#[cfg(feature = "websocket")]
pub use transport::WebSocketTransport;

