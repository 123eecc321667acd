// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pull-driven frame reassembly.
//!
//! Frames on the wire are a 4-byte signed little-endian length followed by
//! that many payload bytes. A length of 0 is a keepalive and is consumed here.
//! The reader never touches the transport itself: it hands out one
//! [`ReadSubmission`] at a time and is fed the matching [`ReadCompletion`].

use bytes::{Bytes, BytesMut};
use tracing::trace;

use super::transport::{ReadCompletion, ReadSubmission};
use crate::AppError;

pub const LENGTH_PREFIX_SIZE: usize = 4;

// the payload buffer grows past this as bytes actually arrive
const INITIAL_PAYLOAD_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    ReadingLength,
    ReadingPayload(usize),
}

/// Output of a read completion that the session has to act on.
#[derive(Debug)]
pub enum ReadEvent {
    Frame(Bytes),
    /// zero-byte read, the peer closed its send direction
    RemoteClosed,
    Failed(AppError),
}

impl ReadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReadEvent::Frame(_))
    }
}

#[derive(Debug)]
pub struct FrameReader {
    phase: ReadPhase,
    length_buf: [u8; LENGTH_PREFIX_SIZE],
    payload: BytesMut,
    accumulated: usize,
    outstanding: bool,
    finished: bool,
    max_packet_size: usize,
}

impl FrameReader {
    pub fn new(max_packet_size: usize) -> Self {
        FrameReader {
            phase: ReadPhase::ReadingLength,
            length_buf: [0; LENGTH_PREFIX_SIZE],
            payload: BytesMut::new(),
            accumulated: 0,
            outstanding: false,
            finished: false,
            max_packet_size,
        }
    }

    pub fn phase(&self) -> ReadPhase {
        self.phase
    }

    /// Bytes still missing for the length prefix or payload being read.
    pub fn remaining(&self) -> usize {
        self.target() - self.accumulated
    }

    /// A terminal event has been emitted, no more reads will be handed out.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn has_outstanding_read(&self) -> bool {
        self.outstanding
    }

    /// Hands out the next read, or `None` while a read is outstanding or after
    /// a terminal event.
    pub fn next_read(&mut self) -> Option<ReadSubmission> {
        if self.finished || self.outstanding {
            return None;
        }
        self.outstanding = true;
        let len = self.remaining();
        let buf = match self.phase {
            ReadPhase::ReadingLength => BytesMut::with_capacity(len),
            // the transport appends straight into the payload buffer
            ReadPhase::ReadingPayload(_) => std::mem::take(&mut self.payload),
        };
        Some(ReadSubmission { buf, len })
    }

    /// Feeds the completion of the outstanding read.
    ///
    /// Returns `None` when more bytes are needed (including after a keepalive),
    /// in which case the caller issues the next read.
    pub fn on_read_completed(&mut self, completion: ReadCompletion) -> Option<ReadEvent> {
        if !self.outstanding || self.finished {
            return Some(self.finish(AppError::IllegalStateError(
                "read completion without an outstanding read".to_string(),
            )));
        }
        self.outstanding = false;
        let ReadCompletion { buf, result } = completion;

        let read = match result {
            Err(err) => return Some(self.finish(AppError::TransportRead(err))),
            Ok(0) => {
                self.finished = true;
                return Some(ReadEvent::RemoteClosed);
            }
            Ok(read) => read,
        };
        if read > self.remaining() {
            return Some(self.finish(AppError::IllegalStateError(format!(
                "transport returned {} bytes for a read of {}",
                read,
                self.remaining()
            ))));
        }

        match self.phase {
            ReadPhase::ReadingLength => {
                let start = self.accumulated;
                self.length_buf[start..start + read].copy_from_slice(&buf[..read]);
                self.accumulated += read;
                if self.accumulated < LENGTH_PREFIX_SIZE {
                    return None;
                }
                self.accumulated = 0;
                self.on_length_prefix(i32::from_le_bytes(self.length_buf))
            }
            ReadPhase::ReadingPayload(length) => {
                self.payload = buf;
                self.accumulated += read;
                if self.accumulated < length {
                    return None;
                }
                self.accumulated = 0;
                self.phase = ReadPhase::ReadingLength;
                let payload = std::mem::take(&mut self.payload).freeze();
                trace!(length, "frame arrived");
                Some(ReadEvent::Frame(payload))
            }
        }
    }

    fn on_length_prefix(&mut self, declared: i32) -> Option<ReadEvent> {
        if declared < 0 {
            return Some(self.finish(AppError::CorruptedFrame(declared)));
        }
        let length = declared as usize;
        if length == 0 {
            trace!("keepalive frame consumed");
            return None;
        }
        if length > self.max_packet_size {
            return Some(self.finish(AppError::FrameTooLarge(length, self.max_packet_size)));
        }
        self.payload = BytesMut::with_capacity(length.min(INITIAL_PAYLOAD_CAPACITY));
        self.phase = ReadPhase::ReadingPayload(length);
        None
    }

    fn finish(&mut self, error: AppError) -> ReadEvent {
        self.finished = true;
        self.outstanding = false;
        ReadEvent::Failed(error)
    }

    fn target(&self) -> usize {
        match self.phase {
            ReadPhase::ReadingLength => LENGTH_PREFIX_SIZE,
            ReadPhase::ReadingPayload(length) => length,
        }
    }
}
