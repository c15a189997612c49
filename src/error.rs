// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;

use thiserror::Error;

/// Error codes carried in wire `ERROR` messages and reported to clients.
///
/// Numbering matches the protocol's error code table (spec.md §6) exactly,
/// so a v1 or v2 client sees the same numeric code for the same failure.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    #[error("internal server failure")]
    Internal = 1,
    #[error("bad command token")]
    BadToken = 2,
    #[error("unknown message type")]
    UnknownMessage = 3,
    #[error("bad command")]
    BadCommand = 4,
    #[error("unknown command")]
    UnknownCommand = 5,
    #[error("access denied")]
    AccessDenied = 6,
    #[error("too many arguments")]
    TooManyArgs = 7,
    #[error("too much data")]
    TooMuchData = 8,
}

impl ErrorCode {
    pub fn from_wire(code: u32) -> ErrorCode {
        match code {
            2 => ErrorCode::BadToken,
            3 => ErrorCode::UnknownMessage,
            4 => ErrorCode::BadCommand,
            5 => ErrorCode::UnknownCommand,
            6 => ErrorCode::AccessDenied,
            7 => ErrorCode::TooManyArgs,
            8 => ErrorCode::TooMuchData,
            _ => ErrorCode::Internal,
        }
    }
}

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("io error")]
    IoError(#[from] io::Error),
    #[error("nix error")]
    NixError(#[from] nix::Error),
    #[error("protocol error: {0}")]
    Protocol(ErrorCode),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("security context error: {0}")]
    Security(String),
    #[error("an error occurred: {0}")]
    ErrorMsg(String),
    #[error("an error occurred: {0}")]
    ErrorStr(&'static str),
    /// A clean end-of-stream seen where the next token's flag byte was
    /// expected (spec.md §4.1 "Early EOF on the flags byte is a
    /// distinguished end-of-file result"). Not a protocol violation: the
    /// message loop treats this as the peer closing the connection
    /// normally.
    #[error("end of file")]
    Eof,
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    pub fn protocol(code: ErrorCode) -> Self {
        Self::from_kind(ErrorKind::Protocol(code))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::Config(msg.into()))
    }

    pub fn security(msg: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::Security(msg.into()))
    }

    pub fn eof() -> Self {
        Self::from_kind(ErrorKind::Eof)
    }

    /// True for the distinguished clean-EOF case (spec.md §4.1/§4.8):
    /// callers use this to end a connection loop quietly instead of
    /// reporting a protocol error.
    pub fn is_eof(&self) -> bool {
        matches!(self.0, ErrorKind::Eof)
    }

    /// The process exit code a binary should use when this error reaches
    /// `main`, per the error code table in the external interface design.
    pub fn exit_code(&self) -> i32 {
        match &self.0 {
            ErrorKind::Protocol(code) => *code as i32,
            _ => ErrorCode::Internal as i32,
        }
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}

impl From<&'static str> for Error {
    fn from(err: &'static str) -> Self {
        Self::from_kind(ErrorKind::ErrorStr(err))
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::from_kind(ErrorKind::ErrorMsg(err))
    }
}

impl From<ErrorCode> for ErrorKind {
    fn from(code: ErrorCode) -> Self {
        ErrorKind::Protocol(code)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
