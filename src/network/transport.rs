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

//! Byte-stream capability the framing layer runs on.
//!
//! A transport is split into a read half and a write half, each driven by its
//! own io worker task. The session submits operations to the workers and gets
//! exactly one [`Completion`] back per submission, always on the session's
//! completion channel, so every completion is handled on the session's single
//! logical thread of control.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::frame_writer::WriteToken;
use crate::SessionConfig;

/// A connected, bidirectional byte stream.
pub trait Transport: Send + 'static {
    type ReadHalf: AsyncRead + Unpin + Send + 'static;
    type WriteHalf: TransportWriteHalf;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Applies socket-level options. Sizing and no-delay are forwarded as is.
    fn apply_options(&self, config: &SessionConfig) -> io::Result<()>;

    fn into_split(self) -> (Self::ReadHalf, Self::WriteHalf);
}

pub trait TransportWriteHalf: AsyncWrite + Unpin + Send + 'static {
    /// Releases the write side without an orderly shutdown.
    fn abort(self);
}

impl Transport for TcpStream {
    type ReadHalf = OwnedReadHalf;
    type WriteHalf = OwnedWriteHalf;

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn apply_options(&self, config: &SessionConfig) -> io::Result<()> {
        self.set_nodelay(config.no_delay)
    }

    fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        TcpStream::into_split(self)
    }
}

impl TransportWriteHalf for OwnedWriteHalf {
    fn abort(self) {
        // zero linger turns the final close into a RST
        #[allow(deprecated)]
        let linger = self.as_ref().set_linger(Some(Duration::ZERO));
        if let Err(err) = linger {
            trace!("set zero linger failed: {}", err);
        }
        // skip the FIN an ordinary drop of the write half would send
        self.forget();
    }
}

impl Transport for DuplexStream {
    type ReadHalf = ReadHalf<DuplexStream>;
    type WriteHalf = WriteHalf<DuplexStream>;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn apply_options(&self, _config: &SessionConfig) -> io::Result<()> {
        Ok(())
    }

    fn into_split(self) -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        tokio::io::split(self)
    }
}

impl TransportWriteHalf for WriteHalf<DuplexStream> {
    fn abort(self) {
        drop(self);
    }
}

/// Forwards the configured SO_RCVBUF / SO_SNDBUF to a socket before connect or listen.
pub(crate) fn apply_buffer_sizes(socket: &TcpSocket, config: &SessionConfig) -> io::Result<()> {
    if let Some(size) = config.read_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.write_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    Ok(())
}

/// Read up to `len` bytes, appended to `buf`.
#[derive(Debug)]
pub struct ReadSubmission {
    pub buf: BytesMut,
    pub len: usize,
}

/// The buffer handed out with a [`ReadSubmission`] and the outcome of the read.
#[derive(Debug)]
pub struct ReadCompletion {
    pub buf: BytesMut,
    pub result: io::Result<usize>,
}

#[derive(Debug)]
pub struct WriteSubmission {
    pub bytes: Bytes,
    pub token: WriteToken,
}

#[derive(Debug)]
pub(crate) enum WriteCommand {
    Submit(WriteSubmission),
    /// Complete the token with an error without touching the transport.
    Reject(WriteToken),
    /// Orderly shutdown of the send direction, reported back.
    Shutdown,
    /// Orderly shutdown of the send direction, then release the write half.
    Close,
}

#[derive(Debug)]
pub(crate) enum Completion {
    Read(ReadCompletion),
    Write {
        token: WriteToken,
        result: io::Result<()>,
    },
    Shutdown(io::Result<()>),
}

/// Performs one read at a time until stopped or the session goes away.
pub(crate) async fn read_worker<R>(
    connection_id: u64,
    mut reader: R,
    mut submissions: mpsc::Receiver<ReadSubmission>,
    completions: mpsc::UnboundedSender<Completion>,
    stop: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let ReadSubmission { mut buf, len } = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            submission = submissions.recv() => match submission {
                Some(submission) => submission,
                None => break,
            },
        };

        let mut target = (&mut buf).limit(len);
        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            result = reader.read_buf(&mut target) => result,
        };
        trace!(connection_id, ?result, "read completed");

        if completions
            .send(Completion::Read(ReadCompletion { buf, result }))
            .is_err()
        {
            break;
        }
    }
    trace!(connection_id, "read worker exited");
}

/// Executes write commands strictly in the order they were queued.
pub(crate) async fn write_worker<W>(
    connection_id: u64,
    mut writer: W,
    mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    completions: mpsc::UnboundedSender<Completion>,
    abort: CancellationToken,
) where
    W: TransportWriteHalf,
{
    // set by the first failed write, nothing reaches the transport afterwards
    let mut failed = false;
    loop {
        let command = tokio::select! {
            biased;
            _ = abort.cancelled() => {
                writer.abort();
                trace!(connection_id, "write worker aborted");
                return;
            }
            command = commands.recv() => command,
        };

        let completion = match command {
            Some(WriteCommand::Submit(WriteSubmission { token, .. })) if failed => {
                Completion::Write {
                    token,
                    result: Err(transport_failed()),
                }
            }
            Some(WriteCommand::Submit(WriteSubmission { bytes, token })) => {
                let result = tokio::select! {
                    biased;
                    _ = abort.cancelled() => {
                        writer.abort();
                        trace!(connection_id, "write worker aborted");
                        return;
                    }
                    result = write_and_flush(&mut writer, &bytes) => result,
                };
                if let Err(err) = &result {
                    trace!(connection_id, "write failed, later submissions skipped: {}", err);
                    failed = true;
                }
                Completion::Write { token, result }
            }
            Some(WriteCommand::Reject(token)) => Completion::Write {
                token,
                result: Err(transport_failed()),
            },
            Some(WriteCommand::Shutdown) => {
                let result = tokio::select! {
                    biased;
                    _ = abort.cancelled() => {
                        writer.abort();
                        trace!(connection_id, "write worker aborted");
                        return;
                    }
                    result = writer.shutdown() => result,
                };
                Completion::Shutdown(result)
            }
            Some(WriteCommand::Close) => {
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => {
                        writer.abort();
                        trace!(connection_id, "write worker aborted");
                        return;
                    }
                    result = writer.shutdown() => {
                        if let Err(err) = result {
                            trace!(connection_id, "shutdown on close failed: {}", err);
                        }
                    }
                };
                break;
            }
            // session is gone, drop the write half
            None => break,
        };

        // a closed session still drains its queue up to the final Close
        if completions.send(completion).is_err() {
            trace!(connection_id, "completion dropped, session already ended");
        }
    }
    trace!(connection_id, "write worker exited");
}

fn transport_failed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport has already failed")
}

async fn write_and_flush<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}
