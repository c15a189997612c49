// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! GSS-API context establishment: the client/server negotiation that
//! decides the protocol version and builds the shared security context
//! (spec.md §4.3).

use std::io::{Read, Write};

use crate::error::{Error, ErrorCode};
use crate::gssapi::{Context, Mechanism};
use crate::token::{read_token, write_token, Token, TokenFlags, MAX_TOKEN_LENGTH};

/// The protocol version negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

/// Server-side half of context establishment: reads the client's initial
/// negotiation token, then drives `mechanism.accept_step` to completion.
///
/// Returns the established context and the protocol version the client
/// asked for (v2 if its initial token carried `PROTOCOL`, else v1).
pub fn server_establish<S, M>(
    stream: &mut S,
    mechanism: &mut M,
) -> Result<(M::Ctx, ProtocolVersion), Error>
where
    S: Read + Write,
    M: Mechanism,
{
    let initial = read_token(stream, MAX_TOKEN_LENGTH)?;
    let v2_attempt = initial.flags == (TokenFlags::NOOP | TokenFlags::CONTEXT_NEXT | TokenFlags::PROTOCOL);
    let v1_only = initial.flags == (TokenFlags::NOOP | TokenFlags::CONTEXT_NEXT);
    if !v2_attempt && !v1_only {
        return Err(Error::protocol(ErrorCode::BadToken));
    }
    let version = if v2_attempt { ProtocolVersion::V2 } else { ProtocolVersion::V1 };

    let expected_context_flags = if version == ProtocolVersion::V2 {
        TokenFlags::CONTEXT | TokenFlags::PROTOCOL
    } else {
        TokenFlags::CONTEXT
    };

    let ctx = loop {
        let next = read_token(stream, MAX_TOKEN_LENGTH)?;
        if next.flags != expected_context_flags {
            return Err(Error::protocol(ErrorCode::BadToken));
        }

        let (out_token, established) = mechanism.accept_step(&next.payload)?;
        let mut resp_flags = TokenFlags::CONTEXT;
        if version == ProtocolVersion::V2 {
            resp_flags |= TokenFlags::PROTOCOL;
        }
        write_token(stream, &Token::new(resp_flags, out_token))?;

        if let Some(ctx) = established {
            break ctx;
        }
    };

    if version == ProtocolVersion::V2 && !ctx.has_required_flags() {
        tracing::warn!(peer = ctx.peer_name(), "rejecting context missing required capabilities");
        return Err(Error::security(
            "established context lacks mutual auth, confidentiality, or integrity",
        ));
    }

    tracing::debug!(peer = ctx.peer_name(), ?version, "server established security context");
    Ok((ctx, version))
}

/// Client-side half of context establishment. `want_v2` selects whether
/// the initial token requests v2 (`PROTOCOL` set) or only v1; the actual
/// negotiated version may be lower if the server replies without
/// `PROTOCOL` on any round (downgrade, spec.md §4.3).
pub fn client_establish<S, M>(
    stream: &mut S,
    mechanism: &mut M,
    target_name: &str,
    want_v2: bool,
) -> Result<(M::Ctx, ProtocolVersion), Error>
where
    S: Read + Write,
    M: Mechanism,
{
    let initial_flags = if want_v2 {
        TokenFlags::NOOP | TokenFlags::CONTEXT_NEXT | TokenFlags::PROTOCOL
    } else {
        TokenFlags::NOOP | TokenFlags::CONTEXT_NEXT
    };
    write_token(stream, &Token::new(initial_flags, Vec::new()))?;

    let mut version = if want_v2 { ProtocolVersion::V2 } else { ProtocolVersion::V1 };
    let mut in_token: Option<Vec<u8>> = None;
    let ctx = loop {
        let (out_token, established) = mechanism.init_step(target_name, in_token.as_deref())?;
        let mut flags = TokenFlags::CONTEXT;
        if version == ProtocolVersion::V2 {
            flags |= TokenFlags::PROTOCOL;
        }
        write_token(stream, &Token::new(flags, out_token))?;

        if let Some(ctx) = established {
            break ctx;
        }

        let resp = read_token(stream, MAX_TOKEN_LENGTH)?;
        if version == ProtocolVersion::V2 && !resp.flags.contains(TokenFlags::PROTOCOL) {
            version = ProtocolVersion::V1;
        }
        in_token = Some(resp.payload);
    };

    if version == ProtocolVersion::V2 && !ctx.has_required_flags() {
        return Err(Error::security(
            "established context lacks mutual auth, confidentiality, or integrity",
        ));
    }

    tracing::debug!(peer = ctx.peer_name(), ?version, "client established security context");
    Ok((ctx, version))
}
