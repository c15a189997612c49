// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `remctld`: the server binary. Parses its CLI flags (spec.md §6),
//! builds the configured [`remctld::gssapi::Mechanism`], and runs either
//! the standalone listener or the inetd/activation path.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

use remctld::gssapi::LocalMechanism;
use remctld::server::{self, ListenAddr};
use remctld::{client, logging, Error};

#[derive(Parser, Debug)]
#[command(name = "remctld", version, about = "Secure remote command execution server")]
struct Cli {
    /// Enable debug-level logging.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Path to the configuration file listing permitted commands.
    #[arg(short = 'f', long = "config", default_value = "/etc/remctl.conf")]
    config: PathBuf,

    /// Stay in the foreground instead of daemonizing (standalone mode only).
    #[arg(short = 'F', long = "foreground")]
    foreground: bool,

    /// Path to the keytab identifying this server to a real mechanism.
    #[arg(short = 'k', long = "keytab")]
    keytab: Option<PathBuf>,

    /// Run standalone, accepting connections on a listening socket, rather
    /// than servicing a single connection already bound to file
    /// descriptor 0 (inetd/socket-activation mode).
    #[arg(short = 'm', long = "standalone")]
    standalone: bool,

    /// Write the process id to this file once listening (standalone mode).
    #[arg(short = 'P', long = "pid-file")]
    pid_file: Option<PathBuf>,

    /// Port to listen on in standalone mode.
    #[arg(short = 'p', long = "port", default_value_t = client::DEFAULT_PORT)]
    port: u16,

    /// Log to stderr instead of the platform's syslog-style sink.
    #[arg(short = 'S', long = "stderr")]
    log_to_stderr: bool,

    /// Service principal name this server accepts connections as.
    #[arg(short = 's', long = "service")]
    service: Option<String>,

    /// Use the crate's non-cryptographic test mechanism instead of a real
    /// GSS-API/Kerberos binding. Never set this against real traffic.
    #[arg(long = "insecure-test-mechanism")]
    insecure_test_mechanism: bool,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_to_stderr, cli.debug);

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "remctld exiting");
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
    if cli.foreground {
        tracing::debug!("foreground requested; this binary never daemonizes on its own");
    }

    // spec.md §6: `-k <path>` and `$KRB5_KTNAME` are equivalent ways to
    // select the server's keytab; `-k` takes precedence when both are set.
    let keytab = cli.keytab.clone().or_else(|| std::env::var_os("KRB5_KTNAME").map(PathBuf::from));
    if let Some(keytab) = &keytab {
        tracing::debug!(keytab = %keytab.display(), "keytab configured (unused by the test mechanism)");
    }

    let service_name = cli.service.clone().unwrap_or_else(|| "host".to_string());
    let mechanism_factory = move || LocalMechanism::new(service_name.clone());

    if cli.standalone {
        let listen = ListenAddr {
            addr: IpAddr::from([0, 0, 0, 0]),
            port: cli.port,
        };
        server::run_standalone(listen, cli.config, cli.pid_file, mechanism_factory)
    } else {
        server::run_inetd(cli.config, mechanism_factory())
    }
}
