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

//! Outgoing frame encoding.
//!
//! Every logical write becomes two submissions on the write worker's FIFO
//! queue: the length prefix, then the payload. Both are queued from the same
//! call on the session's thread, so the pair is never split by another write.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::trace;

use super::frame_reader::LENGTH_PREFIX_SIZE;
use super::transport::{WriteCommand, WriteSubmission};
use crate::{AppError, AppResult};

/// Caller-chosen correlation value echoed back in the write completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteTag(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    User(Option<WriteTag>),
    Keepalive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePart {
    /// length prefix, completion is only reported on failure
    Prefix,
    Payload,
    /// never reached the transport
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteToken {
    pub seq: u64,
    pub origin: WriteOrigin,
    pub part: WritePart,
}

#[derive(Debug)]
pub struct WriteOutcome {
    pub origin: WriteOrigin,
    pub result: AppResult<()>,
}

pub fn encode_length_prefix(length: i32) -> Bytes {
    let mut prefix = BytesMut::with_capacity(LENGTH_PREFIX_SIZE);
    prefix.put_i32_le(length);
    prefix.freeze()
}

#[derive(Debug)]
pub struct FrameWriter {
    connection_id: u64,
    commands: mpsc::UnboundedSender<WriteCommand>,
    next_seq: u64,
    in_flight: usize,
    failed: bool,
    // payload half of a write whose prefix already failed
    swallow_seq: Option<u64>,
}

impl FrameWriter {
    pub(crate) fn new(connection_id: u64, commands: mpsc::UnboundedSender<WriteCommand>) -> Self {
        FrameWriter {
            connection_id,
            commands,
            next_seq: 0,
            in_flight: 0,
            failed: false,
            swallow_seq: None,
        }
    }

    /// Submissions handed to the transport and not completed yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Stops issuing writes on the transport. Later writes are completed with
    /// [`AppError::TransportFailed`] in submission order.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn write_packet(&mut self, payload: Bytes, tag: Option<WriteTag>) -> AppResult<()> {
        if payload.is_empty() {
            return Err(AppError::InvalidValue(
                "empty payload is reserved for keepalive frames".to_string(),
            ));
        }
        let length = i32::try_from(payload.len()).map_err(|_| {
            AppError::InvalidValue(format!(
                "payload of {} bytes exceeds the frame limit of {}",
                payload.len(),
                i32::MAX
            ))
        })?;
        let seq = self.next_seq();
        let origin = WriteOrigin::User(tag);

        if self.failed {
            return self.submit(WriteCommand::Reject(WriteToken {
                seq,
                origin,
                part: WritePart::Rejected,
            }));
        }

        trace!(connection_id = self.connection_id, seq, length, "write packet");
        self.submit(WriteCommand::Submit(WriteSubmission {
            bytes: encode_length_prefix(length),
            token: WriteToken {
                seq,
                origin,
                part: WritePart::Prefix,
            },
        }))?;
        self.submit(WriteCommand::Submit(WriteSubmission {
            bytes: payload,
            token: WriteToken {
                seq,
                origin,
                part: WritePart::Payload,
            },
        }))
    }

    /// Queues a zero-length frame. Skipped once the transport has failed.
    pub fn write_keepalive(&mut self) -> AppResult<()> {
        if self.failed {
            return Ok(());
        }
        let seq = self.next_seq();
        trace!(connection_id = self.connection_id, seq, "write keepalive");
        self.submit(WriteCommand::Submit(WriteSubmission {
            bytes: encode_length_prefix(0),
            token: WriteToken {
                seq,
                origin: WriteOrigin::Keepalive,
                part: WritePart::Prefix,
            },
        }))
    }

    /// Queues an orderly shutdown behind every write already submitted.
    pub fn shutdown(&mut self) -> AppResult<()> {
        self.submit(WriteCommand::Shutdown)
    }

    /// Queues shutdown and release of the write half behind every write already submitted.
    pub fn close(&mut self) -> AppResult<()> {
        self.submit(WriteCommand::Close)
    }

    /// Maps a physical write completion to what the session has to report, if anything.
    pub fn on_write_completed(
        &mut self,
        token: WriteToken,
        result: io::Result<()>,
    ) -> Option<WriteOutcome> {
        self.in_flight = self.in_flight.saturating_sub(1);

        if token.part == WritePart::Payload && self.swallow_seq == Some(token.seq) {
            self.swallow_seq = None;
            return None;
        }

        let result = match (token.part, result) {
            (WritePart::Prefix, Ok(())) => return None,
            (WritePart::Payload, Ok(())) => Ok(()),
            (WritePart::Rejected, _) => Err(AppError::TransportFailed),
            (part, Err(err)) => {
                if part == WritePart::Prefix && token.origin != WriteOrigin::Keepalive {
                    self.swallow_seq = Some(token.seq);
                }
                // only the first failure touched the transport, the rest were skipped
                if self.failed {
                    Err(AppError::TransportFailed)
                } else {
                    self.failed = true;
                    Err(AppError::TransportWrite(err))
                }
            }
        };
        Some(WriteOutcome {
            origin: token.origin,
            result,
        })
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn submit(&mut self, command: WriteCommand) -> AppResult<()> {
        let counts = !matches!(command, WriteCommand::Shutdown | WriteCommand::Close);
        self.commands
            .send(command)
            .map_err(|_| AppError::ChannelSendError("write worker is gone".to_string()))?;
        if counts {
            self.in_flight += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> (FrameWriter, mpsc::UnboundedReceiver<WriteCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FrameWriter::new(1, tx), rx)
    }

    fn submission(command: WriteCommand) -> WriteSubmission {
        match command {
            WriteCommand::Submit(submission) => submission,
            other => panic!("expected a submission, got {:?}", other),
        }
    }

    #[test]
    fn prefix_then_payload() {
        let (mut writer, mut rx) = writer();

        writer
            .write_packet(Bytes::from_static(b"PING"), Some(WriteTag(7)))
            .unwrap();

        let prefix = submission(rx.try_recv().unwrap());
        let payload = submission(rx.try_recv().unwrap());
        assert_eq!(&prefix.bytes[..], &[0x04, 0x00, 0x00, 0x00]);
        assert_eq!(prefix.token.part, WritePart::Prefix);
        assert_eq!(&payload.bytes[..], b"PING");
        assert_eq!(payload.token.origin, WriteOrigin::User(Some(WriteTag(7))));
        assert_eq!(prefix.token.seq, payload.token.seq);
        assert_eq!(writer.in_flight(), 2);
    }

    #[test]
    fn writes_keep_call_order() {
        let (mut writer, mut rx) = writer();

        writer.write_packet(Bytes::from_static(b"b1"), None).unwrap();
        writer.write_keepalive().unwrap();
        writer.write_packet(Bytes::from_static(b"b2"), None).unwrap();

        let bytes: Vec<Bytes> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|command| submission(command).bytes)
            .collect();
        assert_eq!(
            bytes,
            vec![
                encode_length_prefix(2),
                Bytes::from_static(b"b1"),
                encode_length_prefix(0),
                encode_length_prefix(2),
                Bytes::from_static(b"b2"),
            ]
        );
    }

    #[test]
    fn silent_success_is_not_reported() {
        let (mut writer, mut rx) = writer();
        writer.write_keepalive().unwrap();
        writer
            .write_packet(Bytes::from_static(b"x"), Some(WriteTag(1)))
            .unwrap();

        let keepalive = submission(rx.try_recv().unwrap());
        let prefix = submission(rx.try_recv().unwrap());
        let payload = submission(rx.try_recv().unwrap());

        assert!(writer.on_write_completed(keepalive.token, Ok(())).is_none());
        assert!(writer.on_write_completed(prefix.token, Ok(())).is_none());
        let outcome = writer.on_write_completed(payload.token, Ok(())).unwrap();
        assert_eq!(outcome.origin, WriteOrigin::User(Some(WriteTag(1))));
        assert!(outcome.result.is_ok());
        assert_eq!(writer.in_flight(), 0);
    }

    #[test]
    fn failed_prefix_reports_once() {
        let (mut writer, mut rx) = writer();
        writer
            .write_packet(Bytes::from_static(b"x"), Some(WriteTag(3)))
            .unwrap();
        let prefix = submission(rx.try_recv().unwrap());
        let payload = submission(rx.try_recv().unwrap());

        let outcome = writer
            .on_write_completed(prefix.token, Err(io::ErrorKind::BrokenPipe.into()))
            .unwrap();
        assert_eq!(outcome.origin, WriteOrigin::User(Some(WriteTag(3))));
        assert!(matches!(outcome.result, Err(AppError::TransportWrite(_))));
        assert!(writer
            .on_write_completed(payload.token, Err(io::ErrorKind::BrokenPipe.into()))
            .is_none());
        assert!(writer.is_failed());
    }

    #[test]
    fn writes_queued_behind_a_failure_report_transport_failed() {
        let (mut writer, mut rx) = writer();
        writer
            .write_packet(Bytes::from_static(b"AB"), Some(WriteTag(1)))
            .unwrap();
        writer
            .write_packet(Bytes::from_static(b"CD"), Some(WriteTag(2)))
            .unwrap();
        let tokens: Vec<WriteToken> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|command| submission(command).token)
            .collect();
        assert_eq!(tokens.len(), 4);

        let first = writer
            .on_write_completed(tokens[0], Err(io::ErrorKind::TimedOut.into()))
            .unwrap();
        assert!(matches!(first.result, Err(AppError::TransportWrite(_))));
        assert!(writer
            .on_write_completed(tokens[1], Err(io::ErrorKind::NotConnected.into()))
            .is_none());

        let second = writer
            .on_write_completed(tokens[2], Err(io::ErrorKind::NotConnected.into()))
            .unwrap();
        assert_eq!(second.origin, WriteOrigin::User(Some(WriteTag(2))));
        assert!(matches!(second.result, Err(AppError::TransportFailed)));
        assert!(writer
            .on_write_completed(tokens[3], Err(io::ErrorKind::NotConnected.into()))
            .is_none());
        assert_eq!(writer.in_flight(), 0);
    }

    #[test]
    fn failed_keepalive_is_reported_with_its_origin() {
        let (mut writer, mut rx) = writer();
        writer.write_keepalive().unwrap();
        let keepalive = submission(rx.try_recv().unwrap());

        let outcome = writer
            .on_write_completed(keepalive.token, Err(io::ErrorKind::ConnectionReset.into()))
            .unwrap();

        assert_eq!(outcome.origin, WriteOrigin::Keepalive);
        assert!(matches!(outcome.result, Err(AppError::TransportWrite(_))));
    }

    #[test]
    fn writes_after_failure_are_rejected_in_order() {
        let (mut writer, mut rx) = writer();
        writer.mark_failed();

        writer
            .write_packet(Bytes::from_static(b"late"), Some(WriteTag(9)))
            .unwrap();
        writer.write_keepalive().unwrap();

        let token = match rx.try_recv().unwrap() {
            WriteCommand::Reject(token) => token,
            other => panic!("expected a rejection, got {:?}", other),
        };
        assert!(rx.try_recv().is_err());
        let outcome = writer
            .on_write_completed(token, Err(io::ErrorKind::NotConnected.into()))
            .unwrap();
        assert!(matches!(outcome.result, Err(AppError::TransportFailed)));
    }

    #[test]
    fn empty_payload_is_refused() {
        let (mut writer, mut rx) = writer();
        assert!(matches!(
            writer.write_packet(Bytes::new(), None),
            Err(AppError::InvalidValue(_))
        ));
        assert!(rx.try_recv().is_err());
    }
}
