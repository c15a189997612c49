// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `remctl`: the client binary. Opens a connection, submits one command,
//! and streams its output to stdout/stderr until the server reports a
//! final status (spec.md §4.7).

use std::io::{self, Write};

use clap::Parser;

use remctld::client::{Connection, Output};
use remctld::gssapi::LocalMechanism;
use remctld::{logging, Error};

#[derive(Parser, Debug)]
#[command(name = "remctl", version, about = "Secure remote command execution client")]
struct Cli {
    /// Enable debug-level logging.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Port to connect to; 0 tries the default port, then the legacy one.
    #[arg(short = 'p', long = "port", default_value_t = 0)]
    port: u16,

    /// Service principal name the server should be running as.
    #[arg(short = 's', long = "service", default_value = "host")]
    service: String,

    /// Use the crate's non-cryptographic test mechanism instead of a real
    /// GSS-API/Kerberos binding. Never set this against real traffic.
    #[arg(long = "insecure-test-mechanism")]
    insecure_test_mechanism: bool,

    /// Server to connect to.
    host: String,

    /// Command, subcommand, and arguments to submit.
    #[arg(required = true, num_args = 1..)]
    command: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    logging::init(true, cli.debug);

    if let Err(e) = run(cli) {
        eprintln!("remctl: {e}");
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    if !cli.insecure_test_mechanism {
        tracing::warn!(
            "this build only ships the non-cryptographic test mechanism; \
             a production deployment must supply a real GSS-API/Kerberos Mechanism"
        );
    }

    let argv: Vec<Vec<u8>> = cli.command.iter().map(|arg| arg.clone().into_bytes()).collect();
    let mechanism = LocalMechanism::new("client@LOCAL");

    let mut conn = Connection::new(cli.host.clone(), cli.port, cli.service.clone(), mechanism);
    conn.open()?;
    conn.command(&argv, false)?;

    let exit_status = loop {
        match conn.output()? {
            Output::Data { stream, data } => {
                if stream == 2 {
                    io::stderr().write_all(&data)?;
                } else {
                    io::stdout().write_all(&data)?;
                }
            }
            Output::Status { exit_status } => break exit_status,
            Output::Error { code: _, message } => {
                // spec.md §6: a remote ERROR token always exits 255,
                // regardless of which error code the server reported.
                eprintln!("remctl: {message}");
                conn.close();
                std::process::exit(255);
            }
            Output::Done => break 0,
        }
    };

    conn.close();
    std::process::exit(exit_status);
}
