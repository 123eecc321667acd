mod network;
mod service;

pub use network::{
    encode_length_prefix, ConnectionSession, ConnectionState, FrameReader, FrameWriter,
    KeepaliveScheduler, ListenerSession, ReadCompletion, ReadEvent, ReadPhase, ReadSubmission,
    SessionEvent, Transport, TransportWriteHalf, WriteOrigin, WriteOutcome, WritePart,
    WriteSubmission, WriteTag, WriteToken, LENGTH_PREFIX_SIZE,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, FramewireConfig, NetworkConfig,
    SessionConfig,
};
