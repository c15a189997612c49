// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The client connection state machine (spec.md §4.7): `new` / `open` /
//! `command` / `output*` / `close`, unified across both wire versions.

use std::net::TcpStream;
use std::time::Duration;

use crate::error::{Error, ErrorCode};
use crate::gssapi::{Context, Mechanism};
use crate::handshake::{client_establish, ProtocolVersion};
use crate::message::{
    self, encode_argv, encode_command_fragment_v2, encode_quit_v2, v1, CommandFragment, MAX_COMMAND_DATA,
};
use crate::secure_token::{recv_secure, send_secure};
use crate::token::TokenFlags;

/// Current (4373) and legacy (4444) default server ports (spec.md §6).
pub const DEFAULT_PORT: u16 = 4373;
pub const LEGACY_PORT: u16 = 4444;

/// The default overall timeout for `open`, standing in for the original
/// implementation's `SIGALRM`-based alarm (60 minutes, bypassed in
/// standalone server mode; here expressed as a socket read/write
/// timeout, the idiomatic equivalent for a blocking `TcpStream`).
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// One item retrieved by [`Connection::output`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Data { stream: u8, data: Vec<u8> },
    Status { exit_status: i32 },
    Error { code: ErrorCode, message: String },
    /// No more output is available for the current command.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Ready,
    AwaitingOutput,
}

/// Tracks the synthesized two-call `output()` pattern a v1 connection
/// presents over its single combined response token.
enum V1Pending {
    /// Nothing has been read from the wire yet for the current command.
    NotFetched,
    /// Data already delivered to the caller; the status call remains.
    AwaitingStatus(i32),
}

/// A persistent client connection, reused across multiple `command`/
/// `output` cycles per spec.md §4.7.
pub struct Connection<M: Mechanism> {
    host: String,
    port: u16,
    principal: String,
    mechanism: M,
    open_timeout: Duration,

    state: State,
    stream: Option<TcpStream>,
    ctx: Option<M::Ctx>,
    version: Option<ProtocolVersion>,
    last_keepalive: bool,
    v1_pending: Option<V1Pending>,
    last_error: Option<String>,
}

impl<M: Mechanism> Connection<M> {
    /// Creates a new, unconnected connection. `port` of 0 means "try the
    /// default port, then the legacy port" on [`Connection::open`].
    pub fn new(host: impl Into<String>, port: u16, principal: impl Into<String>, mechanism: M) -> Self {
        Connection {
            host: host.into(),
            port,
            principal: principal.into(),
            mechanism,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            state: State::Idle,
            stream: None,
            ctx: None,
            version: None,
            last_keepalive: false,
            v1_pending: None,
            last_error: None,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn fail(&mut self, err: Error) -> Error {
        self.last_error = Some(err.to_string());
        err
    }

    /// Connects and establishes a security context, attempting the
    /// default port then the legacy port when `port` was given as 0
    /// (spec.md §4.3 "Port fallback").
    pub fn open(&mut self) -> Result<(), Error> {
        let candidate_ports: Vec<u16> = if self.port == 0 {
            vec![DEFAULT_PORT, LEGACY_PORT]
        } else {
            vec![self.port]
        };

        let mut last_connect_err = None;
        for port in candidate_ports {
            match TcpStream::connect((self.host.as_str(), port)) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.open_timeout)).ok();
                    stream.set_write_timeout(Some(self.open_timeout)).ok();
                    return self.finish_open(stream);
                }
                Err(e) => last_connect_err = Some(e),
            }
        }

        let err = Error::from(last_connect_err.expect("at least one port attempted"));
        Err(self.fail(err))
    }

    fn finish_open(&mut self, mut stream: TcpStream) -> Result<(), Error> {
        let result = client_establish(&mut stream, &mut self.mechanism, &self.principal, true);
        match result {
            Ok((ctx, version)) => {
                self.stream = Some(stream);
                self.ctx = Some(ctx);
                self.version = Some(version);
                self.state = State::Ready;
                self.v1_pending = None;
                self.last_error = None;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Closes the connection, returning to `Idle`. Sends `QUIT` first if
    /// a v2 session is active and ready for another command.
    pub fn close(&mut self) {
        if self.version == Some(ProtocolVersion::V2) && self.state != State::Idle {
            if let (Some(stream), Some(ctx)) = (self.stream.as_mut(), self.ctx.as_mut()) {
                let _ = send_secure(stream, ctx.as_dyn(), &encode_quit_v2(), false);
            }
        }
        self.stream = None;
        self.ctx = None;
        self.version = None;
        self.state = State::Idle;
        self.v1_pending = None;
    }

    /// Sends a command. `argv[0]`/`argv[1]` are the command/subcommand;
    /// on v2 this fragments transparently when the encoded command
    /// exceeds one token's data cap.
    pub fn command(&mut self, argv: &[Vec<u8>], keepalive: bool) -> Result<(), Error> {
        if self.state == State::Idle {
            return Err(self.fail(Error::protocol(ErrorCode::Internal)));
        }
        self.last_keepalive = keepalive;
        self.v1_pending = Some(V1Pending::NotFetched);

        let version = self.version.expect("ready implies a negotiated version");
        let stream = self.stream.as_mut().expect("ready implies a stream");
        let ctx = self.ctx.as_mut().expect("ready implies a context");

        let result = match version {
            ProtocolVersion::V2 => send_command_v2(stream, ctx.as_dyn(), argv, keepalive),
            ProtocolVersion::V1 => {
                let payload = v1::encode_command(argv);
                send_secure(stream, ctx.as_dyn(), &payload, true)
            }
        };

        match result {
            Ok(()) => {
                self.state = State::AwaitingOutput;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Retrieves the next output item for the in-flight command. Returns
    /// [`Output::Done`] once a `Status`/`Error` has already been
    /// delivered, until the next [`Connection::command`] call.
    pub fn output(&mut self) -> Result<Output, Error> {
        if self.state != State::AwaitingOutput {
            return Ok(Output::Done);
        }

        let version = self.version.expect("awaiting output implies a version");
        let stream = self.stream.as_mut().expect("awaiting output implies a stream");
        let ctx = self.ctx.as_mut().expect("awaiting output implies a context");

        let result = match version {
            ProtocolVersion::V2 => recv_output_v2(stream, ctx.as_dyn()),
            ProtocolVersion::V1 => recv_output_v1(stream, ctx.as_dyn(), &mut self.v1_pending),
        };

        match result {
            Ok((output, done)) => {
                if done {
                    self.state = State::Ready;
                }
                Ok(output)
            }
            Err(e) => Err(self.fail(e)),
        }
    }
}

/// `Context` objects are stored behind the mechanism's associated type;
/// this extension lets the client code above treat them uniformly as
/// `&mut dyn Context` at the call sites that need it.
trait AsDynContext {
    fn as_dyn(&mut self) -> &mut dyn Context;
}

impl<C: Context> AsDynContext for C {
    fn as_dyn(&mut self) -> &mut dyn Context {
        self
    }
}

/// Splits an argument vector into one or more v2 `COMMAND` fragments.
///
/// The encoded command is built once and then cut at byte offsets
/// bounded by the per-token data cap; because this crate's server
/// reassembles fragments by plain concatenation before parsing (rather
/// than parsing incrementally), any split point — including one that
/// falls inside a length prefix — reassembles correctly, so a fixed byte
/// budget per fragment is sufficient here.
fn fragment_command(argv: &[Vec<u8>]) -> Vec<Vec<u8>> {
    const FRAGMENT_BUDGET: usize = MAX_COMMAND_DATA - 4096;
    let encoded = encode_argv(argv);
    if encoded.len() <= FRAGMENT_BUDGET {
        return vec![encoded];
    }
    encoded
        .chunks(FRAGMENT_BUDGET)
        .map(|chunk| chunk.to_vec())
        .collect()
}

fn send_command_v2(
    stream: &mut TcpStream,
    ctx: &mut dyn Context,
    argv: &[Vec<u8>],
    keepalive: bool,
) -> Result<(), Error> {
    let fragments = fragment_command(argv);
    let last_index = fragments.len() - 1;
    for (i, data) in fragments.into_iter().enumerate() {
        let continue_status: u8 = if last_index == 0 {
            0
        } else if i == 0 {
            1
        } else if i == last_index {
            3
        } else {
            2
        };
        let wire = encode_command_fragment_v2(&CommandFragment {
            keepalive,
            continue_status,
            data,
        });
        send_secure(stream, ctx, &wire, false)?;
    }
    Ok(())
}

fn recv_output_v2(stream: &mut TcpStream, ctx: &mut dyn Context) -> Result<(Output, bool), Error> {
    let (_flags, payload) = recv_secure(stream, ctx)?;
    let msg = message::decode_server_message_v2(&payload)?;
    let output = match msg {
        message::ServerMessage::Output { stream, data } => Output::Data { stream, data },
        message::ServerMessage::Status { exit_status } => Output::Status { exit_status },
        message::ServerMessage::Error { code, message } => Output::Error { code, message },
        message::ServerMessage::Version { .. } => return Err(Error::protocol(ErrorCode::Internal)),
    };
    let done = matches!(output, Output::Status { .. } | Output::Error { .. });
    Ok((output, done))
}

fn recv_output_v1(
    stream: &mut TcpStream,
    ctx: &mut dyn Context,
    pending: &mut Option<V1Pending>,
) -> Result<(Output, bool), Error> {
    match pending.take() {
        Some(V1Pending::NotFetched) | None => {
            let (_flags, payload) = recv_secure(stream, ctx)?;
            let (exit_status, data) = v1::decode_output(&payload)?;
            *pending = Some(V1Pending::AwaitingStatus(exit_status));
            Ok((Output::Data { stream: 1, data }, false))
        }
        Some(V1Pending::AwaitingStatus(exit_status)) => {
            *pending = None;
            Ok((Output::Status { exit_status }, true))
        }
    }
}
