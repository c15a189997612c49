// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The GSS-protected token layer sitting on top of [`crate::token`]:
//! sealed data tokens for the v2 protocol, and the legacy MIC-appended
//! plaintext tokens the v1 protocol uses instead of full sealing.

use std::io::{Read, Write};

use crate::error::{Error, ErrorCode};
use crate::gssapi::Context;
use crate::token::{read_token, write_token, Token, TokenFlags, MAX_TOKEN_LENGTH, MAX_TRANSPORT_LENGTH};

/// Seals `message` under `ctx` and writes it as a `DATA` token.
///
/// If `legacy_mic` is set (the v1 behavior: `SEND_MIC` without
/// `PROTOCOL`), the sealed token is followed by a second read of a `MIC`
/// token from the peer, verified as a MIC over the *original* cleartext,
/// exactly as spec.md §4.2 describes.
pub fn send_secure<S: Read + Write>(
    stream: &mut S,
    ctx: &mut dyn Context,
    message: &[u8],
    legacy_mic: bool,
) -> Result<(), Error> {
    let sealed = ctx.wrap(message)?;
    let mut flags = TokenFlags::DATA;
    if legacy_mic {
        flags |= TokenFlags::SEND_MIC;
    }
    write_token(stream, &Token::new(flags, sealed))?;

    if legacy_mic {
        let mic_token = read_token(stream, MAX_TRANSPORT_LENGTH)?;
        if mic_token.flags != TokenFlags::MIC {
            return Err(Error::protocol(ErrorCode::BadToken));
        }
        ctx.verify_mic(message, &mic_token.payload)?;
    }
    Ok(())
}

/// Reads a token and unwraps its sealed payload, returning the plaintext
/// and the flags the token was framed with. For the legacy v1 exchange
/// (`SEND_MIC` without `PROTOCOL`), computes a MIC over the recovered
/// plaintext and sends it back as a standalone `MIC` token.
pub fn recv_secure<S: Read + Write>(
    stream: &mut S,
    ctx: &mut dyn Context,
) -> Result<(TokenFlags, Vec<u8>), Error> {
    let token = read_token(stream, MAX_TRANSPORT_LENGTH)?;
    if !token.flags.contains(TokenFlags::DATA) {
        return Ok((token.flags, Vec::new()));
    }

    let message = ctx.unwrap(&token.payload)?;
    if message.len() as u32 > MAX_TOKEN_LENGTH {
        return Err(Error::protocol(ErrorCode::TooMuchData));
    }

    if token.flags.contains(TokenFlags::SEND_MIC) && !token.flags.contains(TokenFlags::PROTOCOL) {
        let mic = ctx.mic(&message)?;
        write_token(stream, &Token::new(TokenFlags::MIC, mic))?;
    }

    Ok((token.flags, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gssapi::LocalContext;
    use std::io::Cursor;

    /// A `Vec<u8>`-backed duplex good enough to exercise the send/recv
    /// protocol without a real socket: reads come from `inbound`, writes
    /// go to `outbound`.
    struct Duplex {
        inbound: Cursor<Vec<u8>>,
        outbound: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inbound.read(buf)
        }
    }
    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn round_trips_without_mic() {
        let mut client = LocalContext::new("client");
        let mut server = LocalContext::new("server");
        let mut stream = Duplex {
            inbound: Cursor::new(Vec::new()),
            outbound: Vec::new(),
        };
        send_secure(&mut stream, &mut client, b"run the command", false).unwrap();
        let mut recv_side = Duplex {
            inbound: Cursor::new(stream.outbound),
            outbound: Vec::new(),
        };
        let (flags, msg) = recv_secure(&mut recv_side, &mut server).unwrap();
        assert!(flags.contains(TokenFlags::DATA));
        assert_eq!(msg, b"run the command");
    }

    #[test]
    fn legacy_mic_exchange_round_trips() {
        let mut client = LocalContext::new("client");
        let mut server = LocalContext::new("server");

        // client -> server: sealed token, then blocks reading the MIC back.
        // We drive both sides over one shared duplex pair.
        let mut to_server = Duplex {
            inbound: Cursor::new(Vec::new()),
            outbound: Vec::new(),
        };

        // Simulate: client writes sealed DATA|SEND_MIC token synchronously
        // first (it is the first token on the wire); we capture it, then
        // feed it to the server side, capture its MIC reply, and feed that
        // back to resume the client's `send_secure` read.
        let sealed = client.wrap(b"payload").unwrap();
        let mut data_token_buf = Vec::new();
        write_token(
            &mut data_token_buf,
            &Token::new(TokenFlags::DATA | TokenFlags::SEND_MIC, sealed),
        )
        .unwrap();

        to_server.inbound = Cursor::new(data_token_buf);
        let (_, received) = recv_secure(&mut to_server, &mut server).unwrap();
        assert_eq!(received, b"payload");

        // The server's MIC reply is now in `to_server.outbound`.
        let mut to_client = Duplex {
            inbound: Cursor::new(to_server.outbound),
            outbound: Vec::new(),
        };
        let mic_token = read_token(&mut to_client, MAX_TOKEN_LENGTH).unwrap();
        assert_eq!(mic_token.flags, TokenFlags::MIC);
        client.verify_mic(b"payload", &mic_token.payload).unwrap();
    }
}
