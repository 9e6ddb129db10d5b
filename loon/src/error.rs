// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;
use tokio::sync::mpsc;

use crate::commands::{ConnectionToListenerCmd, ListenerToConnectionCmd};

/// Represent the types of errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller contract violation.
    InvalidArgument,

    /// Well-formed packet at the wrong time, or with invalid semantics.
    ProtocolError,

    /// Decoder-level failure, distinct from semantic protocol errors.
    MalformedPacket,

    /// Feature disabled by configuration.
    NotSupported,

    /// ACL or authentication denial.
    NotAuthorized,

    /// Outbound packet exceeds the peer's stated maximum.
    OversizePacket,

    /// Resource exhaustion.
    NoMemory,

    /// Session, packet id or subscription absent.
    NotFound,

    /// Socket closed or write failed permanently.
    ConnectionLost,

    /// Error occurred while performing I/O.
    IoError,

    /// Invalid option value in config file.
    ConfigError,

    /// mpsc channel error.
    ChannelError,
}

#[derive(Clone, Debug)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
        }
    }

    #[must_use]
    pub const fn from_string(kind: ErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_string(ErrorKind::IoError, format!("IoError {err}"))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Self::from_string(ErrorKind::MalformedPacket, format!("{err:?}"))
    }
}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        match err {
            codec::EncodeError::InvalidVarInt | codec::EncodeError::TooManyData => {
                Self::from_string(ErrorKind::OversizePacket, format!("{err:?}"))
            }
            _ => Self::from_string(ErrorKind::InvalidArgument, format!("{err:?}")),
        }
    }
}

macro_rules! convert_send_error {
    ($cmd_type: ident) => {
        impl From<mpsc::error::SendError<$cmd_type>> for Error {
            fn from(err: mpsc::error::SendError<$cmd_type>) -> Self {
                Self::from_string(
                    ErrorKind::ChannelError,
                    format!("$cmd_type channel error: {err}"),
                )
            }
        }
    };
}

convert_send_error!(ConnectionToListenerCmd);
convert_send_error!(ListenerToConnectionCmd);
