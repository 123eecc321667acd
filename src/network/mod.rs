//! Network Module Implementation
//!
//! This module turns an asynchronous byte stream into discrete packets and
//! governs how a connection ends.
//!
//! # Architecture
//!
//! Each connection is driven by one session task that owns all of its state;
//! two io workers execute read and write submissions against the transport
//! halves and report completions back to that task.
//!
//! # Components
//!
//! - `FrameReader`: reassembles length-prefixed frames from fragmented reads
//! - `FrameWriter`: encodes frames and keeps logical writes in submission order
//! - `KeepaliveScheduler`: idle timer for zero-length keepalive frames
//! - `ConnectionSession`: per-connection surface and teardown state machine
//! - `ListenerSession`: accept loop producing `ConnectionSession`s
//!
//! # Wire format
//!
//! `length: i32 (little-endian) || payload[length]`. A length of 0 is a
//! keepalive and never reaches the application; a negative length is a
//! corrupted frame.

pub use connection::{ConnectionSession, ConnectionState, SessionEvent};
pub use frame_reader::{FrameReader, ReadEvent, ReadPhase, LENGTH_PREFIX_SIZE};
pub use frame_writer::{
    encode_length_prefix, FrameWriter, WriteOrigin, WriteOutcome, WritePart, WriteTag, WriteToken,
};
pub use keepalive::KeepaliveScheduler;
pub use listener::ListenerSession;
pub use transport::{
    ReadCompletion, ReadSubmission, Transport, TransportWriteHalf, WriteSubmission,
};

mod connection;
mod frame_reader;
mod frame_writer;
mod keepalive;
mod listener;
mod transport;
