// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Protocol message encoding and decoding for both wire versions, and the
//! command-continuation reassembly v2 streaming commands need.

use crate::error::{Error, ErrorCode};

/// Maximum argument count accepted from a client, an arbitrary limit to
/// bound memory use against a hostile or buggy client.
pub const MAX_COMMAND_ARGS: usize = 4 * 1024;

/// Maximum size of a single logical command buffer (post-reassembly),
/// matching `TOKEN_MAX_DATA` / 64 KiB.
pub const MAX_COMMAND_DATA: usize = 64 * 1024;

const V2_VERSION: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Command = 1,
    Quit = 2,
    Output = 3,
    Status = 4,
    Error = 5,
    Version = 6,
}

impl MessageType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MessageType::Command),
            2 => Some(MessageType::Quit),
            3 => Some(MessageType::Output),
            4 => Some(MessageType::Status),
            5 => Some(MessageType::Error),
            6 => Some(MessageType::Version),
            _ => None,
        }
    }
}

/// A message a server sends to a client: output chunks, the final exit
/// status, a protocol error, or a version-negotiation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Output { stream: u8, data: Vec<u8> },
    Status { exit_status: i32 },
    Error { code: ErrorCode, message: String },
    Version { version: u8 },
}

pub fn encode_server_message_v2(msg: &ServerMessage) -> Vec<u8> {
    let mut buf = vec![V2_VERSION];
    match msg {
        ServerMessage::Output { stream, data } => {
            buf.push(MessageType::Output as u8);
            buf.push(*stream);
            buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
            buf.extend_from_slice(data);
        }
        ServerMessage::Status { exit_status } => {
            buf.push(MessageType::Status as u8);
            buf.push(*exit_status as u8);
        }
        ServerMessage::Error { code, message } => {
            buf.push(MessageType::Error as u8);
            buf.extend_from_slice(&(*code as u32).to_be_bytes());
            buf.extend_from_slice(&(message.len() as u32).to_be_bytes());
            buf.extend_from_slice(message.as_bytes());
        }
        ServerMessage::Version { version } => {
            buf.push(MessageType::Version as u8);
            buf.push(*version);
        }
    }
    buf
}

pub fn decode_server_message_v2(payload: &[u8]) -> Result<ServerMessage, Error> {
    if payload.len() < 2 || payload[0] != V2_VERSION {
        return Err(Error::protocol(ErrorCode::BadToken));
    }
    let msg_type =
        MessageType::from_u8(payload[1]).ok_or_else(|| Error::protocol(ErrorCode::UnknownMessage))?;
    let body = &payload[2..];
    match msg_type {
        MessageType::Output => {
            if body.len() < 5 {
                return Err(Error::protocol(ErrorCode::BadToken));
            }
            let stream = body[0];
            let len = u32::from_be_bytes(body[1..5].try_into().unwrap()) as usize;
            let data = body.get(5..5 + len).ok_or_else(|| Error::protocol(ErrorCode::BadToken))?;
            Ok(ServerMessage::Output {
                stream,
                data: data.to_vec(),
            })
        }
        MessageType::Status => {
            if body.is_empty() {
                return Err(Error::protocol(ErrorCode::BadToken));
            }
            // The wire field is a single unsigned byte (spec.md §4.4); a
            // real exit status of 0-254 round-trips exactly. -1
            // ("signalled", spec.md §4.6) and a genuine exit(255) both
            // collapse onto byte 255, an ambiguity inherent to a 1-byte
            // status field rather than something to paper over here.
            Ok(ServerMessage::Status {
                exit_status: body[0] as i32,
            })
        }
        MessageType::Error => {
            if body.len() < 8 {
                return Err(Error::protocol(ErrorCode::BadToken));
            }
            let code = u32::from_be_bytes(body[0..4].try_into().unwrap());
            let len = u32::from_be_bytes(body[4..8].try_into().unwrap()) as usize;
            let text = body.get(8..8 + len).ok_or_else(|| Error::protocol(ErrorCode::BadToken))?;
            Ok(ServerMessage::Error {
                code: ErrorCode::from_wire(code),
                message: String::from_utf8_lossy(text).into_owned(),
            })
        }
        MessageType::Version => {
            if body.is_empty() {
                return Err(Error::protocol(ErrorCode::BadToken));
            }
            Ok(ServerMessage::Version { version: body[0] })
        }
        MessageType::Command | MessageType::Quit => Err(Error::protocol(ErrorCode::UnknownMessage)),
    }
}

/// A single on-wire v2 COMMAND fragment, before continuation reassembly.
/// `continue_status` is 0 (whole command in this fragment), 1 (first of
/// several), 2 (middle), or 3 (last of several).
#[derive(Debug, Clone)]
pub struct CommandFragment {
    pub keepalive: bool,
    pub continue_status: u8,
    pub data: Vec<u8>,
}

/// Encodes one client->server COMMAND fragment.
pub fn encode_command_fragment_v2(fragment: &CommandFragment) -> Vec<u8> {
    let mut buf = vec![V2_VERSION, MessageType::Command as u8];
    buf.push(if fragment.keepalive { 1 } else { 0 });
    buf.push(fragment.continue_status);
    buf.extend_from_slice(&fragment.data);
    buf
}

pub fn encode_quit_v2() -> Vec<u8> {
    vec![V2_VERSION, MessageType::Quit as u8]
}

/// The result of decoding one raw v2 token payload from a client.
pub enum ClientToken {
    Command(CommandFragment),
    Quit,
    /// A client speaking a version newer than we understand.
    UnknownVersion,
}

pub fn decode_client_token_v2(payload: &[u8]) -> Result<ClientToken, Error> {
    if payload.is_empty() {
        return Err(Error::protocol(ErrorCode::BadToken));
    }
    if payload[0] != V2_VERSION {
        return Ok(ClientToken::UnknownVersion);
    }
    if payload.len() < 2 {
        return Err(Error::protocol(ErrorCode::BadToken));
    }
    match MessageType::from_u8(payload[1]) {
        Some(MessageType::Quit) => Ok(ClientToken::Quit),
        Some(MessageType::Command) => {
            if payload.len() < 4 {
                return Err(Error::protocol(ErrorCode::BadCommand));
            }
            let keepalive = payload[2] != 0;
            let continue_status = payload[3];
            Ok(ClientToken::Command(CommandFragment {
                keepalive,
                continue_status,
                data: payload[4..].to_vec(),
            }))
        }
        _ => Err(Error::protocol(ErrorCode::UnknownMessage)),
    }
}

/// Accumulates a command that may be spread across multiple v2
/// COMMAND fragments, enforcing the same continue-status state machine
/// as the original implementation: status 1 only starts a continuation,
/// 2 only continues one, 3 only ends one, 0 is only valid standalone.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    buffer: Vec<u8>,
    continuing: bool,
}

impl CommandBuffer {
    pub fn new() -> Self {
        CommandBuffer::default()
    }

    /// Feeds one fragment in. Returns `Some(data)` once a complete
    /// logical command is assembled, or `None` if more fragments are
    /// still expected.
    pub fn push(&mut self, fragment: CommandFragment) -> Result<Option<Vec<u8>>, Error> {
        let status = fragment.continue_status;
        if (status == 1 && self.continuing) || (status > 1 && !self.continuing) || status > 3 {
            return Err(Error::protocol(ErrorCode::BadCommand));
        }
        self.continuing = status == 1 || status == 2;

        if self.continuing || !self.buffer.is_empty() {
            if self.buffer.len() + fragment.data.len() > MAX_COMMAND_DATA {
                return Err(Error::protocol(ErrorCode::TooMuchData));
            }
            self.buffer.extend_from_slice(&fragment.data);
        } else {
            self.buffer = fragment.data;
        }

        if self.continuing {
            Ok(None)
        } else {
            Ok(Some(std::mem::take(&mut self.buffer)))
        }
    }
}

/// Parses a fully reassembled command buffer into its argument vector:
/// a 4-byte big-endian argc, then `argc` `(4-byte length, bytes)` pairs.
pub fn parse_argv(buffer: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
    if buffer.len() < 4 {
        return Err(Error::protocol(ErrorCode::UnknownCommand));
    }
    let argc = u32::from_be_bytes(buffer[0..4].try_into().unwrap()) as usize;
    if argc == 0 {
        return Err(Error::protocol(ErrorCode::UnknownCommand));
    }
    if argc > MAX_COMMAND_ARGS {
        return Err(Error::protocol(ErrorCode::TooManyArgs));
    }

    let mut args = Vec::with_capacity(argc);
    let mut pos = 4;
    while pos + 4 <= buffer.len() {
        if args.len() >= argc {
            return Err(Error::protocol(ErrorCode::BadCommand));
        }
        let arglen = u32::from_be_bytes(buffer[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        let arg = buffer
            .get(pos..pos + arglen)
            .ok_or_else(|| Error::protocol(ErrorCode::BadCommand))?;
        args.push(arg.to_vec());
        pos += arglen;
    }
    if args.len() != argc || pos != buffer.len() {
        return Err(Error::protocol(ErrorCode::BadCommand));
    }
    Ok(args)
}

/// Encodes an argument vector into the packed `(len, bytes)+` wire form
/// (without the argc prefix), used when building a command buffer to
/// send.
pub fn encode_argv(argv: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(argv.len() as u32).to_be_bytes());
    for arg in argv {
        buf.extend_from_slice(&(arg.len() as u32).to_be_bytes());
        buf.extend_from_slice(arg);
    }
    buf
}

/// Protocol v1 framing: the legacy wire format has no version/type
/// bytes at all, just the packed argv for commands and a fixed
/// `(status, length, data)` header for output.
pub mod v1 {
    use super::*;

    pub fn encode_command(argv: &[Vec<u8>]) -> Vec<u8> {
        encode_argv(argv)
    }

    pub fn encode_output(exit_status: i32, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + data.len());
        buf.extend_from_slice(&(exit_status as u32).to_be_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        buf.extend_from_slice(data);
        buf
    }

    pub fn decode_output(payload: &[u8]) -> Result<(i32, Vec<u8>), Error> {
        if payload.len() < 8 {
            return Err(Error::protocol(ErrorCode::BadToken));
        }
        let exit_status = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as i32;
        let len = u32::from_be_bytes(payload[4..8].try_into().unwrap()) as usize;
        let data = payload
            .get(8..8 + len)
            .ok_or_else(|| Error::protocol(ErrorCode::BadToken))?;
        Ok((exit_status, data.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_round_trips() {
        let argv = vec![b"test".to_vec(), b"status".to_vec()];
        let encoded = encode_argv(&argv);
        let decoded = parse_argv(&encoded).unwrap();
        assert_eq!(decoded, argv);
    }

    #[test]
    fn rejects_empty_argv() {
        let encoded = encode_argv(&[]);
        assert!(parse_argv(&encoded).is_err());
    }

    #[test]
    fn single_fragment_command_completes_immediately() {
        let mut buf = CommandBuffer::new();
        let fragment = CommandFragment {
            keepalive: false,
            continue_status: 0,
            data: encode_argv(&[b"test".to_vec()]),
        };
        let result = buf.push(fragment).unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn continuation_accumulates_across_fragments() {
        let whole = encode_argv(&[b"test".to_vec(), b"subcommand".to_vec()]);
        let (first, second) = whole.split_at(whole.len() / 2);

        let mut buf = CommandBuffer::new();
        let r1 = buf
            .push(CommandFragment {
                keepalive: false,
                continue_status: 1,
                data: first.to_vec(),
            })
            .unwrap();
        assert!(r1.is_none());

        let r2 = buf
            .push(CommandFragment {
                keepalive: false,
                continue_status: 3,
                data: second.to_vec(),
            })
            .unwrap();
        assert_eq!(r2, Some(whole));
    }

    #[test]
    fn bad_continuation_order_is_rejected() {
        let mut buf = CommandBuffer::new();
        // status 2 (middle) without a preceding status 1 is invalid.
        let err = buf
            .push(CommandFragment {
                keepalive: false,
                continue_status: 2,
                data: vec![],
            })
            .unwrap_err();
        assert_eq!(err.exit_code(), ErrorCode::BadCommand as i32);
    }

    #[test]
    fn v1_output_round_trips() {
        let encoded = v1::encode_output(0, b"ok");
        let (status, data) = v1::decode_output(&encoded).unwrap();
        assert_eq!(status, 0);
        assert_eq!(data, b"ok");
    }

    #[test]
    fn v2_status_byte_round_trips_high_exit_codes_unsigned() {
        // A child exiting 200 (common for shells signalling "command not
        // found" style failures in the 128-254 range) must not come back
        // as a negative number: the wire field is one unsigned byte.
        let encoded = encode_server_message_v2(&ServerMessage::Status { exit_status: 200 });
        match decode_server_message_v2(&encoded).unwrap() {
            ServerMessage::Status { exit_status } => assert_eq!(exit_status, 200),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
