// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The server side of the protocol (spec.md §4.8): per-connection
//! dispatch, the standalone listener (`fork()`-per-connection, `SIGCHLD`
//! reaping, pidfile management, `SIGHUP` config reload), and the
//! inetd/activation mode that services a single connection already bound
//! to file descriptor 0.

use std::io::{self, Read, Write};
use std::net::{IpAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, fork, ForkResult, Pid};

use crate::config::Config;
use crate::error::{Error, ErrorCode, ErrorKind};
use crate::gssapi::{Context, Mechanism};
use crate::handshake::{server_establish, ProtocolVersion};
use crate::message::{self, v1, ClientToken, CommandBuffer, ServerMessage};
use crate::runner::{self, OutputSink, RequestEnv, Stream as RunnerStream, V1OutputBuffer};
use crate::secure_token::{recv_secure, send_secure};

/// Where the standalone listener binds.
pub struct ListenAddr {
    pub addr: IpAddr,
    pub port: u16,
}

static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_reload(_signum: libc::c_int) {
    RELOAD_REQUESTED.store(true, Ordering::SeqCst);
}

/// Reaps every exited/signalled child without blocking, matching the
/// original implementation's `SIGCHLD` handler.
extern "C" fn reap_children(_signum: libc::c_int) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => continue,
            _ => break,
        }
    }
}

/// Runs the server in standalone (multi-process listener) mode: binds
/// `listen`, forks one child per accepted connection, reaps them via
/// `SIGCHLD`, reloads `config_path` on `SIGHUP`, and maintains `pidfile`
/// for the process's lifetime.
pub fn run_standalone<M>(
    listen: ListenAddr,
    config_path: PathBuf,
    pidfile: Option<PathBuf>,
    mechanism_factory: impl Fn() -> M,
) -> Result<(), Error>
where
    M: Mechanism,
{
    unsafe {
        signal::signal(Signal::SIGCHLD, SigHandler::Handler(reap_children))?;
        signal::signal(Signal::SIGHUP, SigHandler::Handler(request_reload))?;
    }

    let config: Arc<RwLock<Arc<Config>>> = Arc::new(RwLock::new(Arc::new(Config::load(&config_path)?)));

    if let Some(path) = &pidfile {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .map_err(|e| Error::config(format!("cannot write pidfile {}: {e}", path.display())))?;
    }

    let listener = TcpListener::bind((listen.addr, listen.port))?;
    tracing::info!(addr = %listen.addr, port = listen.port, "listening");

    let result = accept_loop(&listener, &config, &config_path, mechanism_factory);

    if let Some(path) = &pidfile {
        let _ = std::fs::remove_file(path);
    }

    result
}

fn accept_loop<M: Mechanism>(
    listener: &TcpListener,
    config: &Arc<RwLock<Arc<Config>>>,
    config_path: &Path,
    mechanism_factory: impl Fn() -> M,
) -> Result<(), Error> {
    loop {
        if RELOAD_REQUESTED.swap(false, Ordering::SeqCst) {
            reload_config(config, config_path);
        }

        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        let snapshot = Arc::clone(&config.read().expect("config lock poisoned"));
        let mechanism = mechanism_factory();

        match unsafe { fork() }? {
            ForkResult::Child => {
                let _ = close(listener.as_raw_fd());
                let exit = run_child_connection(stream, peer.ip(), snapshot, mechanism);
                std::process::exit(exit);
            }
            ForkResult::Parent { .. } => {
                drop(stream);
            }
        }
    }
}

fn reload_config(config: &Arc<RwLock<Arc<Config>>>, path: &Path) {
    match Config::load(path) {
        Ok(new_config) => {
            *config.write().expect("config lock poisoned") = Arc::new(new_config);
            tracing::info!(path = %path.display(), "configuration reloaded");
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %path.display(),
                "configuration reload failed, keeping previous configuration"
            );
        }
    }
}

fn run_child_connection<M: Mechanism>(
    mut stream: TcpStream,
    peer_ip: IpAddr,
    config: Arc<Config>,
    mechanism: M,
) -> i32 {
    match handle_connection(&mut stream, mechanism, &config, peer_ip) {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(error = %e, "connection ended with an error");
            e.exit_code()
        }
    }
}

/// Services a single connection already bound to file descriptor 0, the
/// inetd/socket-activation mode (spec.md §4.8 "Operating modes").
pub fn run_inetd<M: Mechanism>(config_path: PathBuf, mechanism: M) -> Result<(), Error> {
    let config = Config::load(&config_path)?;
    let mut stream = unsafe { TcpStream::from_raw_fd(0) };
    let peer_ip = stream
        .peer_addr()
        .map(|addr| addr.ip())
        .unwrap_or_else(|_| IpAddr::from([0, 0, 0, 0]));
    handle_connection(&mut stream, mechanism, &config, peer_ip)
}

/// Establishes the security context on `stream` and runs the negotiated
/// version's command loop to completion.
fn handle_connection<S, M>(stream: &mut S, mut mechanism: M, config: &Config, peer_ip: IpAddr) -> Result<(), Error>
where
    S: Read + Write,
    M: Mechanism,
{
    let (mut ctx, version) = server_establish(stream, &mut mechanism)?;
    let peer_name = ctx.peer_name().to_string();
    let remote_host = dns_lookup::lookup_addr(&peer_ip).ok();

    tracing::info!(peer = %peer_name, addr = %peer_ip, ?version, "connection established");

    let env = RequestEnv {
        remote_user: peer_name,
        remote_addr: peer_ip.to_string(),
        remote_host,
    };

    match version {
        ProtocolVersion::V2 => handle_v2_session(stream, &mut ctx, config, &env),
        ProtocolVersion::V1 => handle_v1_session(stream, &mut ctx, config, &env),
    }
}

fn handle_v2_session<S: Read + Write>(
    stream: &mut S,
    ctx: &mut dyn Context,
    config: &Config,
    env: &RequestEnv,
) -> Result<(), Error> {
    let mut cmd_buffer = CommandBuffer::new();

    loop {
        let (_flags, payload) = match recv_secure(stream, ctx) {
            Ok(pair) => pair,
            Err(e) if e.is_eof() => break,
            Err(e) if matches!(e.kind(), ErrorKind::Protocol(ErrorCode::TooMuchData)) => {
                send_message_v2(
                    stream,
                    ctx,
                    &ServerMessage::Error {
                        code: ErrorCode::TooMuchData,
                        message: capitalized_error_text(ErrorCode::TooMuchData),
                    },
                )?;
                continue;
            }
            Err(e) => return Err(e),
        };
        let token = match message::decode_client_token_v2(&payload) {
            Ok(token) => token,
            Err(e) => {
                send_protocol_error_v2(stream, ctx, &e)?;
                return Err(e);
            }
        };

        match token {
            ClientToken::Quit => break,
            ClientToken::UnknownVersion => {
                send_message_v2(stream, ctx, &ServerMessage::Version { version: 2 })?;
            }
            ClientToken::Command(fragment) => {
                let keepalive = fragment.keepalive;
                match cmd_buffer.push(fragment) {
                    Ok(Some(data)) => {
                        match message::parse_argv(&data) {
                            Ok(argv) => dispatch_v2(stream, ctx, config, env, &argv)?,
                            Err(e) => send_protocol_error_v2(stream, ctx, &e)?,
                        }
                        if !keepalive {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        send_protocol_error_v2(stream, ctx, &e)?;
                        if !keepalive {
                            break;
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn dispatch_v2<S: Read + Write>(
    stream: &mut S,
    ctx: &mut dyn Context,
    config: &Config,
    env: &RequestEnv,
    argv: &[Vec<u8>],
) -> Result<(), Error> {
    let command = String::from_utf8_lossy(&argv[0]).into_owned();
    let subcommand = argv
        .get(1)
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .unwrap_or_default();

    let rule = match config.find(&command, &subcommand) {
        Some(rule) => rule,
        None => {
            return send_message_v2(
                stream,
                ctx,
                &ServerMessage::Error {
                    code: ErrorCode::UnknownCommand,
                    message: capitalized_error_text(ErrorCode::UnknownCommand),
                },
            );
        }
    };

    if !rule.permits(&env.remote_user) {
        tracing::warn!(user = %env.remote_user, %command, %subcommand, "access denied");
        return send_message_v2(
            stream,
            ctx,
            &ServerMessage::Error {
                code: ErrorCode::AccessDenied,
                message: capitalized_error_text(ErrorCode::AccessDenied),
            },
        );
    }

    let stdin_idx = runner::stdin_index(rule.options.stdin_arg, argv.len());
    if let Err(e) = runner::validate_argv(argv, stdin_idx) {
        return send_protocol_error_v2(stream, ctx, &e);
    }
    let (child_argv, stdin_data) = match runner::build_child_argv(&rule.program, argv, stdin_idx) {
        Ok(v) => v,
        Err(e) => return send_protocol_error_v2(stream, ctx, &e),
    };

    tracing::info!(
        user = %env.remote_user,
        program = %rule.program.display(),
        command_line = %rule.masked_command_line(argv),
        "running command"
    );

    let outcome = {
        let mut sink = V2Sink {
            stream: &mut *stream,
            ctx: &mut *ctx,
        };
        runner::run_command(&rule.program, &child_argv, env, stdin_data, &mut sink)
    };

    match outcome {
        Ok(result) => send_message_v2(stream, ctx, &ServerMessage::Status { exit_status: result.status }),
        Err(e) => send_protocol_error_v2(stream, ctx, &e),
    }
}

/// Streams each chunk of a running command's output as a v2 `OUTPUT`
/// message immediately, rather than buffering it.
struct V2Sink<'a, S: Read + Write> {
    stream: &'a mut S,
    ctx: &'a mut dyn Context,
}

impl<'a, S: Read + Write> OutputSink for V2Sink<'a, S> {
    fn on_output(&mut self, which: RunnerStream, data: &[u8]) -> Result<(), Error> {
        let stream_id = match which {
            RunnerStream::Stdout => 1,
            RunnerStream::Stderr => 2,
        };
        send_message_v2(
            self.stream,
            self.ctx,
            &ServerMessage::Output {
                stream: stream_id,
                data: data.to_vec(),
            },
        )
    }
}

fn send_message_v2<S: Read + Write>(stream: &mut S, ctx: &mut dyn Context, msg: &ServerMessage) -> Result<(), Error> {
    send_secure(stream, ctx, &message::encode_server_message_v2(msg), false)
}

fn send_protocol_error_v2<S: Read + Write>(stream: &mut S, ctx: &mut dyn Context, err: &Error) -> Result<(), Error> {
    let code = protocol_error_code(err);
    send_message_v2(
        stream,
        ctx,
        &ServerMessage::Error {
            code,
            message: capitalized_error_text(code),
        },
    )
}

/// Maps any crate error down to the protocol error code it should be
/// reported as; errors not already tagged with one (I/O, security, etc.)
/// are reported as `internal`.
fn protocol_error_code(err: &Error) -> ErrorCode {
    match err.kind() {
        ErrorKind::Protocol(code) => *code,
        _ => ErrorCode::Internal,
    }
}

/// Renders an error code's display text with its first letter
/// capitalized, matching the wording spec.md §8's scenario table uses
/// for both the v1 and v2 wire formats (e.g. "Unknown command").
fn capitalized_error_text(code: ErrorCode) -> String {
    let text = code.to_string();
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => text,
    }
}

/// Renders an error code as the capitalized, newline-terminated text
/// line the v1 wire format appends to its merged output buffer
/// (spec.md §4.4, §9 Open Questions #1: a single trailing `\n`).
fn v1_error_line(code: ErrorCode) -> Vec<u8> {
    let mut line = capitalized_error_text(code);
    line.push('\n');
    line.into_bytes()
}

/// The v1 protocol is single-shot: one command, one combined response,
/// then the connection ends (spec.md §1 Non-goals: "no multi-command
/// pipelining on v1").
fn handle_v1_session<S: Read + Write>(
    stream: &mut S,
    ctx: &mut dyn Context,
    config: &Config,
    env: &RequestEnv,
) -> Result<(), Error> {
    let (_flags, payload) = match recv_secure(stream, ctx) {
        Ok(pair) => pair,
        // A v1 client that disconnects before sending its single command
        // ends the connection normally; there is no response to send.
        Err(e) if e.is_eof() => return Ok(()),
        Err(e) if matches!(e.kind(), ErrorKind::Protocol(ErrorCode::TooMuchData)) => {
            return send_v1_error(stream, ctx, ErrorCode::TooMuchData);
        }
        Err(e) => return Err(e),
    };
    let argv = match message::parse_argv(&payload) {
        Ok(argv) => argv,
        Err(e) => return send_v1_error(stream, ctx, protocol_error_code(&e)),
    };

    let command = String::from_utf8_lossy(&argv[0]).into_owned();
    let subcommand = argv
        .get(1)
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .unwrap_or_default();

    let rule = match config.find(&command, &subcommand) {
        Some(rule) => rule,
        None => return send_v1_error(stream, ctx, ErrorCode::UnknownCommand),
    };

    if !rule.permits(&env.remote_user) {
        tracing::warn!(user = %env.remote_user, %command, %subcommand, "access denied");
        return send_v1_error(stream, ctx, ErrorCode::AccessDenied);
    }

    let stdin_idx = runner::stdin_index(rule.options.stdin_arg, argv.len());
    if let Err(e) = runner::validate_argv(&argv, stdin_idx) {
        return send_v1_error(stream, ctx, protocol_error_code(&e));
    }
    let (child_argv, stdin_data) = match runner::build_child_argv(&rule.program, &argv, stdin_idx) {
        Ok(v) => v,
        Err(e) => return send_v1_error(stream, ctx, protocol_error_code(&e)),
    };

    tracing::info!(
        user = %env.remote_user,
        program = %rule.program.display(),
        command_line = %rule.masked_command_line(&argv),
        "running command"
    );

    let mut sink = V1OutputBuffer::default();
    match runner::run_command(&rule.program, &child_argv, env, stdin_data, &mut sink) {
        Ok(result) => {
            let payload = v1::encode_output(result.status, &sink.data);
            send_secure(stream, ctx, &payload, true)
        }
        Err(_) => send_v1_error(stream, ctx, ErrorCode::Internal),
    }
}

/// Sends the v1 combined response for a request that never ran: status
/// -1 and `code`'s capitalized text as the sole output line (spec.md
/// §4.4, "error messages appended as a final text line").
fn send_v1_error<S: Read + Write>(stream: &mut S, ctx: &mut dyn Context, code: ErrorCode) -> Result<(), Error> {
    let payload = v1::encode_output(-1, &v1_error_line(code));
    send_secure(stream, ctx, &payload, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Rule, RuleOptions};
    use crate::gssapi::LocalContext;
    use crate::message::{encode_argv, encode_command_fragment_v2, CommandFragment};
    use crate::token::{read_token, write_token, Token, TokenFlags, MAX_TOKEN_LENGTH};
    use std::path::PathBuf;

    struct Duplex {
        inbound: io::Cursor<Vec<u8>>,
        outbound: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inbound.read(buf)
        }
    }
    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn client_command_token(ctx: &mut LocalContext, argv: &[Vec<u8>], keepalive: bool) -> Vec<u8> {
        let fragment = CommandFragment {
            keepalive,
            continue_status: 0,
            data: encode_argv(argv),
        };
        let wire = encode_command_fragment_v2(&fragment);
        let sealed = ctx.wrap(&wire).unwrap();
        let mut buf = Vec::new();
        write_token(&mut buf, &Token::new(TokenFlags::DATA, sealed)).unwrap();
        buf
    }

    fn read_server_message(ctx: &mut LocalContext, outbound: Vec<u8>) -> ServerMessage {
        let mut cursor = io::Cursor::new(outbound);
        let token = read_token(&mut cursor, MAX_TOKEN_LENGTH).unwrap();
        let plain = ctx.unwrap(&token.payload).unwrap();
        message::decode_server_message_v2(&plain).unwrap()
    }

    #[test]
    fn v2_unknown_command_yields_error() {
        let mut ctx = LocalContext::new("alice@EXAMPLE");
        let input = client_command_token(&mut ctx, &[b"nosuchcmd".to_vec()], false);
        let mut stream = Duplex {
            inbound: io::Cursor::new(input),
            outbound: Vec::new(),
        };
        let config = Config::default();
        let env = RequestEnv {
            remote_user: "alice@EXAMPLE".to_string(),
            remote_addr: "127.0.0.1".to_string(),
            remote_host: None,
        };

        handle_v2_session(&mut stream, &mut ctx, &config, &env).unwrap();

        match read_server_message(&mut ctx, stream.outbound) {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownCommand),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn v2_acl_denial_yields_access_denied() {
        let mut ctx = LocalContext::new("alice@EXAMPLE");
        let input = client_command_token(&mut ctx, &[b"test".to_vec(), b"status".to_vec()], false);
        let mut stream = Duplex {
            inbound: io::Cursor::new(input),
            outbound: Vec::new(),
        };

        let config = Config {
            rules: vec![Rule {
                file: PathBuf::from("test.conf"),
                lineno: 1,
                command: "test".to_string(),
                subcommand: "status".to_string(),
                program: PathBuf::from("/bin/true"),
                options: RuleOptions::default(),
                acls: vec!["princ:bob@EXAMPLE".to_string()],
            }],
        };
        let env = RequestEnv {
            remote_user: "alice@EXAMPLE".to_string(),
            remote_addr: "127.0.0.1".to_string(),
            remote_host: None,
        };

        handle_v2_session(&mut stream, &mut ctx, &config, &env).unwrap();

        match read_server_message(&mut ctx, stream.outbound) {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::AccessDenied),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn v1_unknown_command_yields_negative_status_and_message() {
        // The v1 wire exchange is a MIC round trip in *both* directions:
        // the client's command token draws a MIC token back from the
        // server, and the server's response token draws one back from the
        // client. Build both ahead of time since `LocalContext`'s MIC is
        // deterministic over the plaintext.
        let mut ctx = LocalContext::new("alice@EXAMPLE");

        let command_sealed = ctx.wrap(&encode_argv(&[b"nosuchcmd".to_vec()])).unwrap();
        let mut input = Vec::new();
        write_token(
            &mut input,
            &Token::new(TokenFlags::DATA | TokenFlags::SEND_MIC, command_sealed),
        )
        .unwrap();

        let expected_response = v1::encode_output(-1, b"Unknown command\n");
        let client_mic_ack = ctx.mic(&expected_response).unwrap();
        write_token(&mut input, &Token::new(TokenFlags::MIC, client_mic_ack)).unwrap();

        let mut stream = Duplex {
            inbound: io::Cursor::new(input),
            outbound: Vec::new(),
        };
        let config = Config::default();
        let env = RequestEnv {
            remote_user: "alice@EXAMPLE".to_string(),
            remote_addr: "127.0.0.1".to_string(),
            remote_host: None,
        };

        handle_v1_session(&mut stream, &mut ctx, &config, &env).unwrap();

        // The server's MIC ack for the client's command token is written
        // first; the sealed response token follows it.
        let mut cursor = io::Cursor::new(stream.outbound);
        let mic_token = read_token(&mut cursor, MAX_TOKEN_LENGTH).unwrap();
        assert_eq!(mic_token.flags, TokenFlags::MIC);
        let response_token = read_token(&mut cursor, MAX_TOKEN_LENGTH).unwrap();
        let plain = ctx.unwrap(&response_token.payload).unwrap();
        let (status, data) = v1::decode_output(&plain).unwrap();
        assert_eq!(status, -1);
        assert_eq!(data, b"Unknown command\n");
    }

    #[test]
    fn v2_session_ends_quietly_on_client_disconnect() {
        // A client that closes the socket instead of sending QUIT
        // produces a clean EOF on the next token read; spec.md §4.8 step
        // 1 says to end the loop, not to report a protocol error.
        let mut ctx = LocalContext::new("alice@EXAMPLE");
        let mut stream = Duplex {
            inbound: io::Cursor::new(Vec::new()),
            outbound: Vec::new(),
        };
        let config = Config::default();
        let env = RequestEnv {
            remote_user: "alice@EXAMPLE".to_string(),
            remote_addr: "127.0.0.1".to_string(),
            remote_host: None,
        };

        assert!(handle_v2_session(&mut stream, &mut ctx, &config, &env).is_ok());
        assert!(stream.outbound.is_empty());
    }

    #[test]
    fn v1_session_ends_quietly_on_client_disconnect() {
        let mut ctx = LocalContext::new("alice@EXAMPLE");
        let mut stream = Duplex {
            inbound: io::Cursor::new(Vec::new()),
            outbound: Vec::new(),
        };
        let config = Config::default();
        let env = RequestEnv {
            remote_user: "alice@EXAMPLE".to_string(),
            remote_addr: "127.0.0.1".to_string(),
            remote_host: None,
        };

        assert!(handle_v1_session(&mut stream, &mut ctx, &config, &env).is_ok());
        assert!(stream.outbound.is_empty());
    }
}
