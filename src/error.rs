// Copyright 2026 Daniel Pelikan
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

//! Error types shared by the agent, the attribute registry and the bus layer.

use std::fmt;
use thiserror::Error;

/// Named protocol errors understood by BlueZ and its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Rejected,
    Canceled,
    Failed,
    InProgress,
    NotPermitted,
    NotAuthorized,
    InvalidValueLength,
    InvalidOffset,
    NotSupported,
    NotConnected,
    UnknownMethod,
    InvalidArgs,
    /// An error name we have no variant for; carried verbatim.
    Other(String),
}

impl ErrorKind {
    /// Fully qualified error name as sent on the bus.
    pub fn name(&self) -> &str {
        match self {
            ErrorKind::Rejected => "org.bluez.Error.Rejected",
            ErrorKind::Canceled => "org.bluez.Error.Canceled",
            ErrorKind::Failed => "org.bluez.Error.Failed",
            ErrorKind::InProgress => "org.bluez.Error.InProgress",
            ErrorKind::NotPermitted => "org.bluez.Error.NotPermitted",
            ErrorKind::NotAuthorized => "org.bluez.Error.NotAuthorized",
            ErrorKind::InvalidValueLength => "org.bluez.Error.InvalidValueLength",
            ErrorKind::InvalidOffset => "org.bluez.Error.InvalidOffset",
            ErrorKind::NotSupported => "org.bluez.Error.NotSupported",
            ErrorKind::NotConnected => "org.bluez.Error.NotConnected",
            ErrorKind::UnknownMethod => "org.freedesktop.DBus.Error.UnknownMethod",
            ErrorKind::InvalidArgs => "org.freedesktop.DBus.Error.InvalidArgs",
            ErrorKind::Other(name) => name,
        }
    }

    /// Map a bus error name back onto a kind. Unknown names are preserved.
    pub fn from_name(name: &str) -> Self {
        match name {
            "org.bluez.Error.Rejected" => ErrorKind::Rejected,
            "org.bluez.Error.Canceled" => ErrorKind::Canceled,
            "org.bluez.Error.Failed" => ErrorKind::Failed,
            "org.bluez.Error.InProgress" => ErrorKind::InProgress,
            "org.bluez.Error.NotPermitted" => ErrorKind::NotPermitted,
            "org.bluez.Error.NotAuthorized" => ErrorKind::NotAuthorized,
            "org.bluez.Error.InvalidValueLength" => ErrorKind::InvalidValueLength,
            "org.bluez.Error.InvalidOffset" => ErrorKind::InvalidOffset,
            "org.bluez.Error.NotSupported" => ErrorKind::NotSupported,
            "org.bluez.Error.NotConnected" => ErrorKind::NotConnected,
            "org.freedesktop.DBus.Error.UnknownMethod" => ErrorKind::UnknownMethod,
            "org.freedesktop.DBus.Error.InvalidArgs" => ErrorKind::InvalidArgs,
            other => ErrorKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A named error returned to (or received from) a remote caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProtocolError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProtocolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed, message)
    }

    pub fn not_permitted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotPermitted, message)
    }

    pub fn invalid_value_length(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidValueLength, message)
    }

    pub fn name(&self) -> &str {
        self.kind.name()
    }
}

/// The bus could not carry a call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Object path already registered: {0}")]
    PathInUse(String),
    #[error("Invalid object path: {0}")]
    InvalidPath(String),
    #[error("Bus disconnected")]
    Disconnected,
    #[error("Transport failure: {0}")]
    Failed(String),
}

/// Outcome of a failed remote call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Remote(#[from] ProtocolError),
}

impl CallError {
    /// The protocol error carried by the remote reply, if any.
    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            CallError::Remote(e) => Some(e),
            CallError::Transport(_) => None,
        }
    }
}
