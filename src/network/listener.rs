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

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::connection::ConnectionSession;
use super::transport::apply_buffer_sizes;
use crate::{AppError, AppResult, NetworkConfig, SessionConfig};

type Arrival = AppResult<ConnectionSession>;

/// Accepts connections on a bound endpoint and hands each one out as a
/// [`ConnectionSession`].
///
/// Accept is re-armed right after every arrival, including failed ones, until
/// the listener is closed. Closing the listener leaves sessions already handed
/// out untouched.
#[derive(Debug)]
pub struct ListenerSession {
    local_addr: SocketAddr,
    stop_accepting: CancellationToken,
    arrivals: async_channel::Receiver<Arrival>,
    closed: bool,
}

impl ListenerSession {
    pub async fn bind(
        network: &NetworkConfig,
        session_config: SessionConfig,
        runtime: &Handle,
    ) -> AppResult<ListenerSession> {
        session_config.validate()?;
        if network.max_connections == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connections must be greater than 0".to_string(),
            ));
        }
        let listen_address = network.listen_address()?;
        let listener = bind_listener(listen_address, network.backlog, &session_config).map_err(|err| {
            let error_msg = format!(
                "Failed to bind listener to address: {} - Error: {}",
                listen_address, err
            );
            error!("{}", error_msg);
            AppError::IllegalStateError(error_msg)
        })?;
        let local_addr = listener.local_addr()?;
        info!("listener bound to {} for accepting", local_addr);

        let stop_accepting = CancellationToken::new();
        let (arrival_tx, arrival_rx) = async_channel::bounded(network.max_connections);
        let acceptor = Acceptor {
            listener,
            limit_connections: Arc::new(Semaphore::new(network.max_connections)),
            session_config,
            runtime: runtime.clone(),
            arrivals: arrival_tx,
        };
        runtime.spawn(acceptor.run(stop_accepting.clone()));

        Ok(ListenerSession {
            local_addr,
            stop_accepting,
            arrivals: arrival_rx,
            closed: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The next accepted connection or accept failure, `None` once closed.
    pub async fn next_connection(&mut self) -> Option<Arrival> {
        if self.closed {
            return None;
        }
        self.arrivals.recv().await.ok()
    }

    /// Stops accepting. Arrivals not yet taken are dropped, which closes them.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stop_accepting.cancel();
        self.arrivals.close();
        debug!(local_addr = %self.local_addr, "listener closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for ListenerSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn bind_listener(
    address: SocketAddr,
    backlog: u32,
    session_config: &SessionConfig,
) -> std::io::Result<TcpListener> {
    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    // accepted sockets inherit the buffer sizes of the listening socket
    apply_buffer_sizes(&socket, session_config)?;
    socket.bind(address)?;
    socket.listen(backlog)
}

struct Acceptor {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    session_config: SessionConfig,
    runtime: Handle,
    arrivals: async_channel::Sender<Arrival>,
}

impl Acceptor {
    async fn run(self, stop: CancellationToken) {
        loop {
            let permit = tokio::select! {
                _ = stop.cancelled() => break,
                permit = self.limit_connections.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let arrival = match accepted {
                Ok((socket, peer)) => {
                    debug!(%peer, "accepted connection");
                    ConnectionSession::spawn_with_permit(
                        socket,
                        &self.session_config,
                        &self.runtime,
                        Some(permit),
                    )
                }
                Err(err) => {
                    error!("accept failed: {}", err);
                    Err(AppError::Accept(err.to_string()))
                }
            };

            if self.arrivals.send(arrival).await.is_err() {
                // listener closed while this arrival was in hand
                break;
            }
        }
        debug!("acceptor exited");
    }
}
