// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A secure remote command execution service: authenticated clients submit
//! a command and arguments over the network, the server checks it against
//! a configured access list, runs it, and streams its output and exit
//! status back.

pub mod acl;
pub mod client;
pub mod config;
pub mod gssapi;
pub mod handshake;
pub mod logging;
pub mod message;
pub mod pipe;
pub mod runner;
pub mod secure_token;
pub mod server;
pub mod token;

mod error;

pub use error::{Error, ErrorCode};
