//! Task log channel
//!
//! Streams the log lines, progress updates and completion result of one
//! execution task over the console's WebSocket endpoint, reconnecting after
//! transport failures until the task reports completion.

pub mod aggregate;
pub mod channel;
pub mod connector;
pub mod error;
pub mod event;
pub mod monitor;

pub use aggregate::{LogAggregate, LogEntry, TaskLogs, TaskResult};
pub use channel::{
    ChannelHandle, ChannelHandler, ChannelOptions, SocketState, TaskChannel, OUTGOING_CAPACITY,
};
pub use connector::{Connector, FrameSocket, WsConnector};
pub use error::{ChannelError, DecodeError};
pub use event::{decode, encode, EventKind, TaskEvent};
pub use monitor::TaskMonitor;
