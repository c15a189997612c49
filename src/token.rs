// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The plain token framing underlying both the GSS-protected channel and
//! the handshake that establishes it: a one-byte flag set, a four-byte
//! big-endian length, and a payload.

use std::io::{self, Read, Write};

use crate::error::{Error, ErrorCode};

/// Largest payload a single protocol data unit (a command, a server
/// message) may carry (64 KiB), matching `TOKEN_MAX_LENGTH` in the
/// original implementation. Enforced after GSS-unwrap, against the
/// cleartext length, not against the raw framed token off the wire.
pub const MAX_TOKEN_LENGTH: u32 = 64 * 1024;

/// Largest raw framed token accepted off the wire (1 MiB). This is wider
/// than `MAX_TOKEN_LENGTH` because a sealed GSS token carries mechanism
/// overhead on top of the cleartext it wraps; the narrower data limit is
/// enforced separately once that wrapping is removed.
pub const MAX_TRANSPORT_LENGTH: u32 = 1024 * 1024;

/// Flag bits carried in the first byte of every token.
///
/// A thin wrapper around the raw byte rather than pulling in a bitflags
/// crate the rest of this codebase has no other use for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenFlags(u8);

impl TokenFlags {
    pub const NOOP: TokenFlags = TokenFlags(0x01);
    pub const CONTEXT: TokenFlags = TokenFlags(0x02);
    pub const DATA: TokenFlags = TokenFlags(0x04);
    pub const MIC: TokenFlags = TokenFlags(0x08);
    pub const CONTEXT_NEXT: TokenFlags = TokenFlags(0x10);
    pub const SEND_MIC: TokenFlags = TokenFlags(0x20);
    pub const PROTOCOL: TokenFlags = TokenFlags(0x40);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits_truncate(bits: u8) -> Self {
        TokenFlags(bits)
    }

    pub fn contains(self, other: TokenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: TokenFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for TokenFlags {
    type Output = TokenFlags;
    fn bitor(self, rhs: TokenFlags) -> TokenFlags {
        TokenFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for TokenFlags {
    fn bitor_assign(&mut self, rhs: TokenFlags) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub flags: TokenFlags,
    pub payload: Vec<u8>,
}

impl Token {
    pub fn new(flags: TokenFlags, payload: Vec<u8>) -> Self {
        Token { flags, payload }
    }

    /// Whether this token announces a v2-capable peer: any v2 peer sets
    /// the `PROTOCOL` bit on its first token of the handshake.
    pub fn is_protocol_v2(&self) -> bool {
        self.flags.contains(TokenFlags::PROTOCOL)
    }
}

/// Writes a single token: 1-byte flags, 4-byte big-endian length, payload.
pub fn write_token<W: Write>(w: &mut W, token: &Token) -> Result<(), Error> {
    if token.payload.len() as u64 > u32::MAX as u64 {
        return Err(Error::protocol(ErrorCode::TooMuchData));
    }
    w.write_all(&[token.flags.bits()])?;
    w.write_all(&(token.payload.len() as u32).to_be_bytes())?;
    w.write_all(&token.payload)?;
    w.flush()?;
    Ok(())
}

/// Reads a single token, retrying short reads up to a bounded number of
/// times to tolerate `EINTR`, matching `xread` in the original `tokens.c`.
pub fn read_token<R: Read>(r: &mut R, max_length: u32) -> Result<Token, Error> {
    let mut flag_byte = [0u8; 1];
    if !read_full_retrying(r, &mut flag_byte)? {
        return Err(Error::eof());
    }
    let flags = TokenFlags::from_bits_truncate(flag_byte[0]);

    let mut len_bytes = [0u8; 4];
    read_exact_strict(r, &mut len_bytes)?;
    let length = u32::from_be_bytes(len_bytes);
    if length > max_length {
        return Err(Error::protocol(ErrorCode::TooMuchData));
    }

    let mut payload = vec![0u8; length as usize];
    read_exact_strict(r, &mut payload)?;

    Ok(Token { flags, payload })
}

/// Reads exactly `buf.len()` bytes, returning `Ok(false)` only if end of
/// stream is hit on the very first byte (a clean EOF before any token
/// begins); any other early EOF is a protocol error.
fn read_full_retrying<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, Error> {
    let mut filled = 0;
    let mut retries = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(Error::protocol(ErrorCode::BadToken));
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                retries += 1;
                if retries > 100 {
                    return Err(Error::protocol(ErrorCode::BadToken));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn read_exact_strict<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), Error> {
    if !read_full_retrying(r, buf)? {
        return Err(Error::protocol(ErrorCode::BadToken));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_token() {
        let token = Token::new(TokenFlags::DATA, b"hello".to_vec());
        let mut buf = Vec::new();
        write_token(&mut buf, &token).unwrap();

        let mut cursor = io::Cursor::new(buf);
        let decoded = read_token(&mut cursor, MAX_TOKEN_LENGTH).unwrap();
        assert_eq!(decoded.flags, token.flags);
        assert_eq!(decoded.payload, token.payload);
    }

    #[test]
    fn rejects_oversized_length() {
        let mut buf = Vec::new();
        buf.push(TokenFlags::DATA.bits());
        buf.extend_from_slice(&(MAX_TOKEN_LENGTH + 1).to_be_bytes());
        let mut cursor = io::Cursor::new(buf);
        let err = read_token(&mut cursor, MAX_TOKEN_LENGTH).unwrap_err();
        assert_eq!(err.exit_code(), ErrorCode::TooMuchData as i32);
    }

    #[test]
    fn clean_eof_before_any_byte_is_reported() {
        let mut cursor = io::Cursor::new(Vec::<u8>::new());
        let err = read_token(&mut cursor, MAX_TOKEN_LENGTH).unwrap_err();
        assert!(err.is_eof());
    }

    #[test]
    fn eof_mid_length_is_a_protocol_error_not_eof() {
        let mut cursor = io::Cursor::new(vec![TokenFlags::DATA.bits(), 0, 0]);
        let err = read_token(&mut cursor, MAX_TOKEN_LENGTH).unwrap_err();
        assert!(!err.is_eof());
        assert_eq!(err.exit_code(), ErrorCode::BadToken as i32);
    }
}
