// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The GSS-API security mechanism boundary.
//!
//! The real Kerberos 5 mechanism is an external collaborator: this crate
//! never links a GSS-API library, it only defines the operations a
//! mechanism must provide (`accept`, `init`, `wrap`, `unwrap`, `mic`,
//! `verify_mic`) and drives them from the handshake and secure-token
//! layers. A production deployment supplies its own [`Mechanism`]
//! implementation backed by a real GSS-API binding; this crate ships
//! [`LocalMechanism`], a non-cryptographic stand-in used by its own test
//! suite and by the `--insecure-test-mechanism` flag on both binaries.

use crate::error::Error;

/// A negotiated security context, established once per connection and
/// then used to protect every subsequent token.
pub trait Context: Send {
    /// True once the multi-round negotiation has produced a usable
    /// context (no more `CONTEXT`/`CONTEXT_NEXT` tokens are expected).
    fn is_established(&self) -> bool;

    /// True if the negotiated context supports mutual authentication,
    /// confidentiality, and integrity — the three capabilities spec.md
    /// §4.3 requires a v2 connection to confirm before trusting the
    /// context. A real GSS-API mechanism reports this from the ret_flags
    /// of `gss_accept_sec_context`/`gss_init_sec_context`.
    fn has_required_flags(&self) -> bool {
        true
    }

    /// The authenticated peer name, e.g. `user@REALM.EXAMPLE`. Only valid
    /// once [`Context::is_established`] is true.
    fn peer_name(&self) -> &str;

    /// Seals `plaintext` for transmission (GSS `gss_wrap`, confidentiality
    /// requested).
    fn wrap(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error>;

    /// Opens a sealed token produced by the peer's [`Context::wrap`].
    fn unwrap(&mut self, sealed: &[u8]) -> Result<Vec<u8>, Error>;

    /// Produces a detached integrity checksum over `message` (GSS
    /// `gss_get_mic`), used by the legacy v1 wire format in place of full
    /// sealing.
    fn mic(&mut self, message: &[u8]) -> Result<Vec<u8>, Error>;

    /// Verifies a checksum produced by [`Context::mic`] on the peer side.
    fn verify_mic(&mut self, message: &[u8], mic: &[u8]) -> Result<(), Error>;
}

/// The entry point for establishing a [`Context`], playing either the
/// initiator (client) or acceptor (server) role.
pub trait Mechanism {
    type Ctx: Context;

    /// Consumes one round of the initiator-side handshake: given the
    /// previous token from the acceptor (`None` on the very first call),
    /// returns the next token to send and, once complete, the established
    /// context.
    fn init_step(
        &mut self,
        target_name: &str,
        in_token: Option<&[u8]>,
    ) -> Result<(Vec<u8>, Option<Self::Ctx>), Error>;

    /// Consumes one round of the acceptor-side handshake: given the
    /// initiator's token, returns the response token and, once complete,
    /// the established context.
    fn accept_step(&mut self, in_token: &[u8]) -> Result<(Vec<u8>, Option<Self::Ctx>), Error>;
}

/// A deliberately non-cryptographic [`Mechanism`] used for tests and for
/// running this service without a real Kerberos deployment. The "sealing"
/// here is a fixed-key XOR stream and the "mic" a simple additive
/// checksum — suitable only for exercising the protocol state machine,
/// never for protecting real traffic.
#[derive(Debug, Clone, Default)]
pub struct LocalMechanism {
    local_name: String,
}

impl LocalMechanism {
    pub fn new(local_name: impl Into<String>) -> Self {
        LocalMechanism {
            local_name: local_name.into(),
        }
    }
}

impl Mechanism for LocalMechanism {
    type Ctx = LocalContext;

    fn init_step(
        &mut self,
        target_name: &str,
        _in_token: Option<&[u8]>,
    ) -> Result<(Vec<u8>, Option<Self::Ctx>), Error> {
        let out = self.local_name.clone().into_bytes();
        let ctx = LocalContext::new(target_name.to_string());
        Ok((out, Some(ctx)))
    }

    fn accept_step(&mut self, in_token: &[u8]) -> Result<(Vec<u8>, Option<Self::Ctx>), Error> {
        let peer = String::from_utf8_lossy(in_token).into_owned();
        let out = self.local_name.clone().into_bytes();
        let ctx = LocalContext::new(peer);
        Ok((out, Some(ctx)))
    }
}

const LOCAL_KEY: u8 = 0x5a;

#[derive(Debug, Clone)]
pub struct LocalContext {
    peer_name: String,
}

impl LocalContext {
    pub fn new(peer_name: impl Into<String>) -> Self {
        LocalContext {
            peer_name: peer_name.into(),
        }
    }
}

impl Context for LocalContext {
    fn is_established(&self) -> bool {
        true
    }

    fn peer_name(&self) -> &str {
        &self.peer_name
    }

    fn wrap(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(plaintext.iter().map(|b| b ^ LOCAL_KEY).collect())
    }

    fn unwrap(&mut self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(sealed.iter().map(|b| b ^ LOCAL_KEY).collect())
    }

    fn mic(&mut self, message: &[u8]) -> Result<Vec<u8>, Error> {
        let sum = message.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        Ok(vec![sum ^ LOCAL_KEY])
    }

    fn verify_mic(&mut self, message: &[u8], mic: &[u8]) -> Result<(), Error> {
        let expected = self.mic(message)?;
        if expected == mic {
            Ok(())
        } else {
            Err(Error::security("mic verification failed"))
        }
    }
}
