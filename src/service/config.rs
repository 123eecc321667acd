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
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Endpoint the listener binds to.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// accept backlog handed to `listen(2)`
    pub backlog: u32,
    /// maximum number of live accepted sessions
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 9527,
            backlog: 1024,
            max_connections: 1024,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> AppResult<SocketAddr> {
        let address = format!("{}:{}", self.ip, self.port);
        address
            .parse()
            .map_err(|err| AppError::InvalidValue(format!("listen address {}: {}", address, err)))
    }
}

/// Per-connection options.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle interval after which a keepalive frame is written. 0 disables keepalives.
    pub keepalive_interval_ms: u64,
    pub no_delay: bool,
    /// When set, `close()` behaves like `abortive_close()`.
    pub abort_on_close: bool,
    /// SO_RCVBUF, forwarded to the socket untouched
    pub read_buffer_size: Option<u32>,
    /// SO_SNDBUF, forwarded to the socket untouched
    pub write_buffer_size: Option<u32>,
    /// Largest payload length accepted from the peer.
    pub max_packet_size: usize,
    pub event_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            keepalive_interval_ms: 5_000,
            no_delay: true,
            abort_on_close: false,
            read_buffer_size: None,
            write_buffer_size: None,
            max_packet_size: i32::MAX as usize,
            event_channel_capacity: 1024,
        }
    }
}

impl SessionConfig {
    pub fn keepalive_interval(&self) -> Option<Duration> {
        match self.keepalive_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.event_channel_capacity == 0 {
            return Err(AppError::InvalidValue(
                "session.event_channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.max_packet_size == 0 || self.max_packet_size > i32::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "session.max_packet_size {} out of range 1..={}",
                self.max_packet_size,
                i32::MAX
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FramewireConfig {
    pub network: NetworkConfig,
    pub session: SessionConfig,
}

impl FramewireConfig {
    /// Loads the configuration file at `path`, overlaid with `FRAMEWIRE__SECTION__KEY`
    /// environment variables.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<FramewireConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("FRAMEWIRE")
                    .try_parsing(true)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let framewire_config: FramewireConfig = config.try_deserialize()?;
        framewire_config.session.validate()?;

        Ok(framewire_config)
    }
}
