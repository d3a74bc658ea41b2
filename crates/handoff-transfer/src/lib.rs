/// Handoff Transfer: encrypted device-to-device data migration.
///
/// One device runs a `TransferServer` holding the data set, the other a
/// `TransferClient` that receives it:
/// - Pairing payload carries host, port, 3-digit code and session key
/// - Every frame is AES-256-GCM sealed and HMAC-SHA256 tagged
/// - Records stream as message frames, attachments as sliced file frames
/// - Sender is throttled by a byte-based flow conditioner
/// - Receiver persists on a dedicated processor thread

pub mod client;
pub mod config;
pub mod error;
pub mod file_stream;
pub mod flow;
pub(crate) mod net;
pub mod processor;
pub mod protocol;
pub mod server;
pub mod source;
pub mod speed;

// Re-export key types for convenience.
pub use client::{ClientState, TransferClient};
pub use config::{
    ClientConfig, DEFAULT_FLOW_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_IN_FLIGHT,
    DEFAULT_SLICE_SIZE, DEFAULT_STATS_INTERVAL, ServerConfig,
};
pub use error::TransferError;
pub use file_stream::file_path;
pub use flow::{Admission, FlowConditioner};
pub use processor::MessageProcessor;
pub use protocol::{FileSlice, Frame, FrameType, MAX_FRAME_SIZE, MAX_SLICE_SIZE};
pub use server::{BlockedReason, ClosedReason, ServerState, TransferServer};
pub use source::DataSource;
pub use speed::SpeedInspector;
