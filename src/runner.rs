// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The command runner: forks the rule's program, feeds it stdin if the
//! rule asks for that, and multiplexes its stdout/stderr with a
//! `select`-driven nonblocking loop until the child exits and both pipes
//! have drained (spec.md §4.6).

use std::ffi::CString;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use nix::sys::select::{select, FdSet};
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, ForkResult, Pid};

use crate::config::StdinArg;
use crate::error::{Error, ErrorCode};
use crate::pipe::{self, Pipe, PipeEnd};

/// Size of each read from a child's stdout/stderr pipe.
const READ_CHUNK: usize = 64 * 1024;

/// The v1 protocol's cap on accumulated output; bytes beyond this are
/// read and discarded so the pipe keeps draining (spec.md §4.6).
pub const MAXBUFFER: usize = 64_000;

/// `select`'s timeout: a deliberate ceiling so the parent notices the
/// child has exited even if a detached grandchild keeps the pipes open
/// (spec.md §4.6, §9 "lingering descendant" note).
const SELECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Defensive fd-closing range applied in the child before `exec`,
/// matching the replay-cache-leak workaround in the original
/// implementation (spec.md §4.6).
const CLOSE_FD_RANGE: std::ops::Range<RawFd> = 3..16;

/// A chunk of output as it is read from the child, tagged by stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout = 1,
    Stderr = 2,
}

/// Receives output as the runner reads it from the child's pipes. v2
/// implementations emit an `OUTPUT` message per call; v1 implementations
/// accumulate into a capped buffer.
pub trait OutputSink {
    fn on_output(&mut self, stream: Stream, data: &[u8]) -> Result<(), Error>;
}

/// The final result of running a command to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitResult {
    /// The low 8 bits of the exit code, or -1 if the child was signalled
    /// (spec.md §4.6 "Completion").
    pub status: i32,
}

/// The environment variables injected into the child, per spec.md §6.
#[derive(Debug, Clone, Default)]
pub struct RequestEnv {
    pub remote_user: String,
    pub remote_addr: String,
    pub remote_host: Option<String>,
}

/// Validates that `argv[0]`, `argv[1]` (if present), and every argument
/// except the one selected by `stdin_arg` contain no NUL octet
/// (spec.md §3 invariant).
pub fn validate_argv(argv: &[Vec<u8>], stdin_index: Option<usize>) -> Result<(), Error> {
    for (i, arg) in argv.iter().enumerate() {
        if Some(i) == stdin_index {
            continue;
        }
        if arg.contains(&0) {
            return Err(Error::protocol(ErrorCode::BadCommand));
        }
    }
    Ok(())
}

/// Resolves a rule's `stdin_arg` option to a concrete 0-based index into
/// the request's argument vector, if any.
pub fn stdin_index(stdin_arg: Option<StdinArg>, argc: usize) -> Option<usize> {
    match stdin_arg {
        None => None,
        Some(StdinArg::None) => None,
        Some(StdinArg::Last) => argc.checked_sub(1),
        Some(StdinArg::Index(n)) => n.checked_sub(1),
    }
}

/// Builds the child's argv (element 0 is the program's basename,
/// subsequent elements are the request's arguments in order excluding
/// the one feeding stdin) and pulls out the stdin payload, if any.
pub fn build_child_argv(
    program: &Path,
    argv: &[Vec<u8>],
    stdin_index: Option<usize>,
) -> Result<(Vec<CString>, Option<Vec<u8>>), Error> {
    let basename = program
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| program.as_os_str().to_os_string());

    let mut child_argv = Vec::with_capacity(argv.len());
    child_argv.push(
        CString::new(basename.into_vec_lossy()).map_err(|_| Error::protocol(ErrorCode::BadCommand))?,
    );

    let mut stdin_data = None;
    for (i, arg) in argv.iter().enumerate() {
        if Some(i) == stdin_index {
            stdin_data = Some(arg.clone());
            continue;
        }
        child_argv.push(CString::new(arg.clone()).map_err(|_| Error::protocol(ErrorCode::BadCommand))?);
    }

    Ok((child_argv, stdin_data))
}

/// A small extension trait so we can build a `CString` from an
/// `OsString` without requiring it be valid UTF-8, matching the
/// original's byte-oriented argv handling.
trait IntoVecLossy {
    fn into_vec_lossy(self) -> Vec<u8>;
}

impl IntoVecLossy for std::ffi::OsString {
    fn into_vec_lossy(self) -> Vec<u8> {
        use std::os::unix::ffi::OsStringExt;
        self.into_vec()
    }
}

/// Forks `program`, feeding `stdin_data` (if any) on its standard input
/// and calling `sink.on_output` as bytes arrive on stdout/stderr, until
/// the child exits and both output pipes have drained.
pub fn run_command(
    program: &Path,
    child_argv: &[CString],
    env: &RequestEnv,
    stdin_data: Option<Vec<u8>>,
    sink: &mut dyn OutputSink,
) -> Result<ExitResult, Error> {
    let stdout_pipe = Pipe::new_blocking().map_err(Error::from)?;
    let stderr_pipe = Pipe::new_blocking().map_err(Error::from)?;
    let stdin_pipe = if stdin_data.is_some() {
        Some(Pipe::new_blocking().map_err(Error::from)?)
    } else {
        None
    };

    let program_cstr = CString::new(program.as_os_str().to_os_string().into_vec_lossy())
        .map_err(|_| Error::protocol(ErrorCode::BadCommand))?;

    match unsafe { fork() }.map_err(Error::from)? {
        ForkResult::Child => {
            run_child(program_cstr, child_argv, env, stdout_pipe, stderr_pipe, stdin_pipe);
            unreachable!("run_child always exits the process");
        }
        ForkResult::Parent { child } => {
            tracing::debug!(pid = child.as_raw(), program = %program.display(), "spawned child");

            let (stdout_read, _stdout_write) = stdout_pipe.split();
            let (stderr_read, _stderr_write) = stderr_pipe.split();
            stdout_read.set_nonblocking().ok();
            stderr_read.set_nonblocking().ok();

            let stdin_write = stdin_pipe.map(|p| {
                let (_read, write) = p.split();
                write.set_nonblocking().ok();
                write
            });

            let result = multiplex(child, stdout_read, stderr_read, stdin_write, stdin_data, sink);
            match &result {
                Ok(exit) => tracing::debug!(pid = child.as_raw(), status = exit.status, "child reaped"),
                Err(e) => tracing::warn!(pid = child.as_raw(), error = %e, "child multiplex failed"),
            }
            result
        }
    }
}

/// Never returns: sets up the child's standard streams, environment, and
/// `exec`s the program, or exits 255 on failure.
fn run_child(
    program: CString,
    child_argv: &[CString],
    env: &RequestEnv,
    stdout_pipe: Pipe,
    stderr_pipe: Pipe,
    stdin_pipe: Option<Pipe>,
) -> ! {
    let (_stdout_read, stdout_write) = stdout_pipe.split();
    let (_stderr_read, stderr_write) = stderr_pipe.split();

    if stdout_write.replace(1).is_err() || stderr_write.replace(2).is_err() {
        std::process::exit(255);
    }

    match stdin_pipe {
        Some(pipe) => {
            let (stdin_read, _stdin_write) = pipe.split();
            if stdin_read.replace(0).is_err() {
                std::process::exit(255);
            }
        }
        None => {
            if let Ok(devnull) = nix::fcntl::open(
                "/dev/null",
                nix::fcntl::OFlag::O_RDONLY,
                nix::sys::stat::Mode::empty(),
            ) {
                let _ = dup2(devnull, 0);
                let _ = close(devnull);
            }
        }
    }

    for fd in CLOSE_FD_RANGE {
        let _ = close(fd);
    }

    std::env::set_var("REMUSER", &env.remote_user);
    std::env::set_var("REMOTE_USER", &env.remote_user);
    std::env::set_var("REMOTE_ADDR", &env.remote_addr);
    if let Some(host) = &env.remote_host {
        std::env::set_var("REMOTE_HOST", host);
    }

    let args: Vec<&CString> = child_argv.iter().collect();
    let err = execvp(&program, &args);
    let _ = io::stderr().write_all(format!("remctld: cannot execute {}: {:?}\n", program.to_string_lossy(), err).as_bytes());
    std::process::exit(255);
}

/// The `select`-driven multiplex loop described in spec.md §4.6: reads
/// stdout/stderr as they become readable, writes stdin as it becomes
/// writable, reaps the child nonblockingly, and keeps a 5-second ceiling
/// on each `select` call so child exit is noticed even with pipes held
/// open by a lingering descendant.
fn multiplex(
    child: Pid,
    mut stdout: PipeEnd<pipe::Read>,
    mut stderr: PipeEnd<pipe::Read>,
    mut stdin: Option<PipeEnd<pipe::Write>>,
    mut stdin_data: Option<Vec<u8>>,
    sink: &mut dyn OutputSink,
) -> Result<ExitResult, Error> {
    let mut stdin_offset = 0usize;
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut reaped_status: Option<i32> = None;
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        if reaped_status.is_none() {
            match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => reaped_status = Some(code & 0xff),
                Ok(WaitStatus::Signaled(_, _, _)) => reaped_status = Some(-1),
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if !stdout_open && !stderr_open && reaped_status.is_some() {
            break;
        }

        let mut read_fds = FdSet::new();
        if stdout_open {
            read_fds.insert(stdout.as_raw_fd());
        }
        if stderr_open {
            read_fds.insert(stderr.as_raw_fd());
        }

        let mut write_fds = FdSet::new();
        let have_stdin_data = stdin.is_some() && stdin_data.as_ref().map_or(false, |d| stdin_offset < d.len());
        if have_stdin_data {
            write_fds.insert(stdin.as_ref().unwrap().as_raw_fd());
        }

        // Clear the timeout as soon as the child has exited so draining
        // completes promptly instead of waiting out the full tick.
        let mut timeout = if reaped_status.is_some() {
            TimeVal::new(0, 0)
        } else {
            TimeVal::new(SELECT_TIMEOUT.as_secs() as i64, 0)
        };

        let ready = match select(None, Some(&mut read_fds), Some(&mut write_fds), None, Some(&mut timeout)) {
            Ok(n) => n,
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(e.into()),
        };

        if ready == 0 {
            continue;
        }

        if have_stdin_data && write_fds.contains(stdin.as_ref().unwrap().as_raw_fd()) {
            let data = stdin_data.as_ref().unwrap();
            match stdin.as_mut().unwrap().write(&data[stdin_offset..]) {
                Ok(n) => {
                    stdin_offset += n;
                    if stdin_offset >= data.len() {
                        let mut closed = stdin.take().unwrap();
                        closed.close().ok();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    // Child declined the input; stop trying but keep
                    // draining its output.
                    let mut closed = stdin.take().unwrap();
                    closed.close().ok();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        if stdout_open && read_fds.contains(stdout.as_raw_fd()) {
            match stdout.read(&mut buf) {
                Ok(0) => stdout_open = false,
                Ok(n) => sink.on_output(Stream::Stdout, &buf[..n])?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        if stderr_open && read_fds.contains(stderr.as_raw_fd()) {
            match stderr.read(&mut buf) {
                Ok(0) => stderr_open = false,
                Ok(n) => sink.on_output(Stream::Stderr, &buf[..n])?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(ExitResult {
        status: reaped_status.unwrap_or(-1),
    })
}

/// An [`OutputSink`] that accumulates output for the v1 protocol, which
/// merges stdout and stderr into a single buffer capped at
/// [`MAXBUFFER`], discarding (but still draining) anything beyond the
/// cap (spec.md §4.6).
#[derive(Debug, Default)]
pub struct V1OutputBuffer {
    pub data: Vec<u8>,
}

impl OutputSink for V1OutputBuffer {
    fn on_output(&mut self, _stream: Stream, data: &[u8]) -> Result<(), Error> {
        if self.data.len() >= MAXBUFFER {
            return Ok(());
        }
        let remaining = MAXBUFFER - self.data.len();
        let take = remaining.min(data.len());
        self.data.extend_from_slice(&data[..take]);
        Ok(())
    }
}
