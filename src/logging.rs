// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Structured logging setup, shared by both binaries.

use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber.
///
/// `stdout_stderr` mirrors the `-S` flag (spec.md §6): when set, logs go
/// to stderr as plain lines suitable for an interactive terminal; when
/// unset, the same formatter is used but the process is expected to run
/// under a supervisor that routes its stderr to syslog (this crate does
/// not itself link a syslog binding). `verbose` mirrors `-d`.
pub fn init(stdout_stderr: bool, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(stdout_stderr);

    if stdout_stderr {
        subscriber.with_writer(std::io::stderr).init();
    } else {
        subscriber.init();
    }
}
