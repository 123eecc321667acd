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

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::net::{lookup_host, TcpSocket, TcpStream, ToSocketAddrs};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::frame_reader::{FrameReader, ReadEvent};
use super::frame_writer::{FrameWriter, WriteOrigin, WriteTag};
use super::keepalive::KeepaliveScheduler;
use super::transport::{
    apply_buffer_sizes, read_worker, write_worker, Completion, ReadSubmission, Transport,
};
use crate::{AppError, AppResult, SessionConfig};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of one connection. Transitions only move forward:
/// `Connected -> ShuttingDown -> Closed`, `Connected -> Closed`, or any
/// non-terminal state `-> Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    ShuttingDown,
    Closed,
    Aborted,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Aborted)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connected, ShuttingDown)
                | (Connected, Closed)
                | (ShuttingDown, Closed)
                | (Connected, Aborted)
                | (ShuttingDown, Aborted)
        )
    }

    fn transition(&mut self, next: ConnectionState) -> AppResult<()> {
        if !self.can_transition_to(next) {
            return Err(AppError::IllegalStateError(format!(
                "connection cannot move from {:?} to {:?}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }
}

/// Everything a session reports to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    PacketArrived(Bytes),
    /// The peer closed its send direction. Answer with `close()` or `shutdown()`.
    RemoteClosed,
    /// The read side is finished: transport error, corrupted or oversized frame.
    ReadFailed(AppError),
    WriteCompleted {
        origin: WriteOrigin,
        result: AppResult<()>,
    },
    /// Any error here can be treated like success: proceed to `close()`.
    ShutdownCompleted(AppResult<()>),
}

#[derive(Debug)]
enum SessionCommand {
    Write { payload: Bytes, tag: Option<WriteTag> },
    Shutdown,
    Close,
    Abort,
}

/// Owner-side handle of one framed connection.
///
/// All methods submit and return; results arrive through
/// [`next_event`](Self::next_event). A session has exactly one owner, the
/// task that calls `next_event`.
#[derive(Debug)]
pub struct ConnectionSession {
    id: u64,
    peer_addr: Option<SocketAddr>,
    state: ConnectionState,
    abort_on_close: bool,
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: mpsc::Receiver<SessionEvent>,
}

impl ConnectionSession {
    /// Connects to the first reachable address `addr` resolves to.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        config: &SessionConfig,
        runtime: &Handle,
    ) -> AppResult<ConnectionSession> {
        config.validate()?;
        let mut last_error = None;
        for address in lookup_host(addr).await? {
            match connect_socket(address, config).await {
                Ok(stream) => return ConnectionSession::spawn(stream, config, runtime),
                Err(err) => {
                    debug!(%address, "connect failed: {}", err);
                    last_error = Some(err);
                }
            }
        }
        Err(match last_error {
            Some(err) => AppError::IoError(err),
            None => AppError::InvalidValue("address resolved to no endpoint".to_string()),
        })
    }

    /// Wraps an established transport and starts its io workers on `runtime`.
    pub fn spawn<T: Transport>(
        transport: T,
        config: &SessionConfig,
        runtime: &Handle,
    ) -> AppResult<ConnectionSession> {
        ConnectionSession::spawn_with_permit(transport, config, runtime, None)
    }

    pub(crate) fn spawn_with_permit<T: Transport>(
        transport: T,
        config: &SessionConfig,
        runtime: &Handle,
        permit: Option<OwnedSemaphorePermit>,
    ) -> AppResult<ConnectionSession> {
        config.validate()?;
        transport.apply_options(config)?;
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let peer_addr = transport.peer_addr();
        let (read_half, write_half) = transport.into_split();

        // capacity 1: the reader never has more than one read outstanding
        let (read_tx, read_rx) = mpsc::channel(1);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let stop_reading = CancellationToken::new();
        let abort = CancellationToken::new();

        runtime.spawn(read_worker(
            id,
            read_half,
            read_rx,
            completion_tx.clone(),
            stop_reading.clone(),
        ));
        runtime.spawn(write_worker(
            id,
            write_half,
            write_rx,
            completion_tx,
            abort.clone(),
        ));

        let driver = SessionDriver {
            connection_id: id,
            state: ConnectionState::Connected,
            abort_on_close: config.abort_on_close,
            reader: FrameReader::new(config.max_packet_size),
            writer: FrameWriter::new(id, write_tx),
            keepalive: KeepaliveScheduler::new(config.keepalive_interval(), Instant::now()),
            commands: command_rx,
            completions: completion_rx,
            read_submissions: read_tx,
            events: event_tx,
            stop_reading,
            abort,
            _permit: permit,
        };
        runtime.spawn(driver.run());
        debug!(connection_id = id, peer = ?peer_addr, "session started");

        Ok(ConnectionSession {
            id,
            peer_addr,
            state: ConnectionState::Connected,
            abort_on_close: config.abort_on_close,
            commands: command_tx,
            events: event_rx,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Queues `payload` as one frame. Completion is reported as
    /// [`SessionEvent::WriteCompleted`] with origin `User(tag)`.
    pub fn write_packet(&self, payload: impl Into<Bytes>, tag: Option<WriteTag>) -> AppResult<()> {
        if self.state != ConnectionState::Connected {
            return Err(AppError::IllegalStateError(format!(
                "write on a {:?} connection",
                self.state
            )));
        }
        let payload = payload.into();
        if payload.is_empty() || payload.len() > i32::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "payload length {} outside 1..={}",
                payload.len(),
                i32::MAX
            )));
        }
        self.send(SessionCommand::Write { payload, tag })
    }

    /// Graceful shutdown with notification. Queued writes are flushed first;
    /// afterwards only [`SessionEvent::ShutdownCompleted`] is delivered.
    pub fn shutdown(&mut self) -> AppResult<()> {
        self.state.transition(ConnectionState::ShuttingDown)?;
        self.send(SessionCommand::Shutdown)
    }

    /// Graceful close in the background, no notification. Degrades to
    /// [`abortive_close`](Self::abortive_close) when `abort_on_close` is set.
    pub fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = if self.abort_on_close {
            ConnectionState::Aborted
        } else {
            ConnectionState::Closed
        };
        self.release(SessionCommand::Close);
    }

    /// Releases the transport immediately, pending writes are dropped.
    pub fn abortive_close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = ConnectionState::Aborted;
        self.release(SessionCommand::Abort);
    }

    /// Next event for the owner, `None` once the session is closed or aborted.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if self.state.is_terminal() {
                return None;
            }
            let event = self.events.recv().await?;
            // events already queued when shutdown was requested are discarded
            if self.state == ConnectionState::ShuttingDown
                && !matches!(event, SessionEvent::ShutdownCompleted(_))
            {
                continue;
            }
            return Some(event);
        }
    }

    fn send(&self, command: SessionCommand) -> AppResult<()> {
        self.commands
            .send(command)
            .map_err(|_| AppError::ChannelSendError(format!("session {} driver is gone", self.id)))
    }

    fn release(&mut self, command: SessionCommand) {
        if let Err(err) = self.send(command) {
            trace!(connection_id = self.id, "release: {}", err);
        }
        self.events.close();
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            debug!(connection_id = self.id, "session dropped while open, closing");
            self.close();
        }
    }
}

async fn connect_socket(address: SocketAddr, config: &SessionConfig) -> io::Result<TcpStream> {
    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    apply_buffer_sizes(&socket, config)?;
    socket.connect(address).await
}

/// The single logical thread of control of one connection. Owns the reader,
/// writer and keepalive timer; every command and io completion is handled here
/// one at a time.
struct SessionDriver {
    connection_id: u64,
    state: ConnectionState,
    abort_on_close: bool,
    reader: FrameReader,
    writer: FrameWriter,
    keepalive: KeepaliveScheduler,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    completions: mpsc::UnboundedReceiver<Completion>,
    read_submissions: mpsc::Sender<ReadSubmission>,
    events: mpsc::Sender<SessionEvent>,
    stop_reading: CancellationToken,
    abort: CancellationToken,
    _permit: Option<OwnedSemaphorePermit>,
}

impl SessionDriver {
    async fn run(mut self) {
        self.issue_read();
        while !self.state.is_terminal() {
            let keepalive_deadline = self.keepalive.deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!(connection_id = self.connection_id, "session owner is gone");
                        self.close();
                    }
                },
                Some(completion) = self.completions.recv() => self.on_completion(completion).await,
                _ = time::sleep_until(keepalive_deadline.unwrap_or_else(Instant::now)),
                    if keepalive_deadline.is_some() => self.on_keepalive_timer(),
            }
        }
        debug!(
            connection_id = self.connection_id,
            state = ?self.state,
            in_flight = self.writer.in_flight(),
            "session ended"
        );
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Write { payload, tag } => {
                if self.state != ConnectionState::Connected {
                    return;
                }
                match self.writer.write_packet(payload, tag) {
                    Ok(()) => self.keepalive.restart(Instant::now()),
                    Err(err) => {
                        self.emit(SessionEvent::WriteCompleted {
                            origin: WriteOrigin::User(tag),
                            result: Err(err),
                        })
                        .await
                    }
                }
            }
            SessionCommand::Shutdown => {
                if self.state.transition(ConnectionState::ShuttingDown).is_err() {
                    return;
                }
                debug!(connection_id = self.connection_id, "shutting down");
                self.keepalive.cancel();
                if let Err(err) = self.writer.shutdown() {
                    let err = AppError::Shutdown(io::Error::new(
                        io::ErrorKind::NotConnected,
                        err.to_string(),
                    ));
                    self.emit(SessionEvent::ShutdownCompleted(Err(err))).await;
                }
            }
            SessionCommand::Close => self.close(),
            SessionCommand::Abort => self.abortive_close(),
        }
    }

    async fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Read(completion) => match self.reader.on_read_completed(completion) {
                None => self.issue_read(),
                Some(ReadEvent::Frame(payload)) => {
                    self.emit(SessionEvent::PacketArrived(payload)).await;
                    self.issue_read();
                }
                Some(ReadEvent::RemoteClosed) => {
                    debug!(connection_id = self.connection_id, "remote closed");
                    self.emit(SessionEvent::RemoteClosed).await;
                }
                Some(ReadEvent::Failed(err)) => {
                    warn!(connection_id = self.connection_id, "read failed: {}", err);
                    self.writer.mark_failed();
                    self.keepalive.cancel();
                    self.emit(SessionEvent::ReadFailed(err)).await;
                }
            },
            Completion::Write { token, result } => {
                if let Some(outcome) = self.writer.on_write_completed(token, result) {
                    if let Err(err) = &outcome.result {
                        warn!(
                            connection_id = self.connection_id,
                            origin = ?outcome.origin,
                            "write failed: {}",
                            err
                        );
                        self.keepalive.cancel();
                    }
                    self.emit(SessionEvent::WriteCompleted {
                        origin: outcome.origin,
                        result: outcome.result,
                    })
                    .await;
                }
            }
            Completion::Shutdown(result) => {
                if self.state == ConnectionState::ShuttingDown {
                    debug!(connection_id = self.connection_id, ?result, "shutdown completed");
                    self.emit(SessionEvent::ShutdownCompleted(
                        result.map_err(AppError::Shutdown),
                    ))
                    .await;
                }
            }
        }
    }

    fn on_keepalive_timer(&mut self) {
        if self.state != ConnectionState::Connected || !self.keepalive.poll_due(Instant::now()) {
            return;
        }
        if let Err(err) = self.writer.write_keepalive() {
            error!(connection_id = self.connection_id, "keepalive not queued: {}", err);
            self.keepalive.cancel();
        }
    }

    /// Delivers an event unless the state forbids it.
    async fn emit(&mut self, event: SessionEvent) {
        let allowed = match self.state {
            ConnectionState::Connected => true,
            ConnectionState::ShuttingDown => matches!(event, SessionEvent::ShutdownCompleted(_)),
            ConnectionState::Closed | ConnectionState::Aborted => false,
        };
        if !allowed {
            trace!(connection_id = self.connection_id, ?event, "event discarded");
            return;
        }
        if self.events.send(event).await.is_err() {
            trace!(connection_id = self.connection_id, "owner stopped receiving events");
        }
    }

    fn issue_read(&mut self) {
        if self.state != ConnectionState::Connected || self.writer.is_failed() {
            return;
        }
        if let Some(submission) = self.reader.next_read() {
            if self.read_submissions.try_send(submission).is_err() {
                error!(connection_id = self.connection_id, "read worker is gone");
            }
        }
    }

    fn close(&mut self) {
        if self.abort_on_close {
            self.abortive_close();
            return;
        }
        if self.state.transition(ConnectionState::Closed).is_err() {
            return;
        }
        debug!(connection_id = self.connection_id, "closing in background");
        self.keepalive.cancel();
        if let Err(err) = self.writer.close() {
            trace!(connection_id = self.connection_id, "close: {}", err);
        }
        self.stop_reading.cancel();
    }

    fn abortive_close(&mut self) {
        if self.state.transition(ConnectionState::Aborted).is_err() {
            return;
        }
        debug!(connection_id = self.connection_id, "aborting");
        self.keepalive.cancel();
        self.abort.cancel();
        self.stop_reading.cancel();
    }
}
