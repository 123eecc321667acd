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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// protocol errors surfaced through session events
    #[error("transport read error: {0}")]
    TransportRead(#[source] io::Error),

    #[error("corrupted frame: negative length prefix {0}")]
    CorruptedFrame(i32),

    #[error("frame of length {0} exceeds the limit of {1}")]
    FrameTooLarge(usize, usize),

    #[error("transport write error: {0}")]
    TransportWrite(#[source] io::Error),

    #[error("transport has already failed, write was not issued")]
    TransportFailed,

    #[error("shutdown error: {0}")]
    Shutdown(#[source] io::Error),

    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),
}
