// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Owned pipe file descriptors, and the non-blocking pipe pair the command
//! runner uses to talk to a spawned child.

use std::fmt::Debug;
use std::io;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use nix::unistd::{close, dup2, pipe as nix_pipe, read as nix_read, write as nix_write};

#[derive(Clone, Copy, Debug)]
pub struct Read;
#[derive(Clone, Copy, Debug)]
pub struct Write;

/// A marker trait to designate the end of the pipe this represents.
pub trait End: Clone + Copy + Debug {
    type Reverse: End;

    fn display() -> &'static str;
}

impl End for Read {
    type Reverse = Write;

    fn display() -> &'static str {
        "Read"
    }
}
impl End for Write {
    type Reverse = Read;

    fn display() -> &'static str {
        "Write"
    }
}

#[derive(Debug)]
pub struct PipeEnd<E: End> {
    raw_fd: RawFd,
    ghost: PhantomData<E>,
}

impl<E: End> PipeEnd<E> {
    /// Forget the fd so that drop is not called after being associated to STDIN or similar.
    pub fn forget(&mut self) {
        self.raw_fd = -1;
    }

    /// Sets `O_NONBLOCK` on this end. Used by the command runner to make
    /// only the parent-side ends of each pipe non-blocking after `fork`,
    /// leaving the child's inherited ends with ordinary blocking I/O
    /// semantics (spec.md §4.6: "set all three parent-side pipe fds
    /// non-blocking").
    pub fn set_nonblocking(&self) -> nix::Result<()> {
        use nix::fcntl::{fcntl, FcntlArg, OFlag};
        fcntl(self.raw_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        Ok(())
    }

    pub fn close(&mut self) -> nix::Result<()> {
        if self.raw_fd < 0 {
            return Ok(());
        }

        let result = close(self.raw_fd);
        self.raw_fd = -1;
        result
    }

    /// Duplicates and moves the file descriptor onto `target_fd`, consuming self.
    ///
    /// This closes `target_fd` first, then `dup2`s onto it and forgets self,
    /// leaving `target_fd` as the only owner.
    pub fn replace(mut self, target_fd: RawFd) -> nix::Result<()> {
        if self.raw_fd == target_fd {
            self.forget();
            return Ok(());
        }

        if self.raw_fd == -1 {
            return Ok(());
        }
        close(target_fd).ok();

        let new_fd = dup2(self.raw_fd, target_fd)?;
        assert_eq!(new_fd, target_fd);
        self.forget();

        Ok(())
    }
}

impl<E: End> FromRawFd for PipeEnd<E> {
    unsafe fn from_raw_fd(raw_fd: RawFd) -> Self {
        Self {
            raw_fd,
            ghost: PhantomData,
        }
    }
}

impl<E: End> AsRawFd for PipeEnd<E> {
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd
    }
}

impl<E: End> IntoRawFd for PipeEnd<E> {
    fn into_raw_fd(mut self) -> RawFd {
        let raw_fd = self.raw_fd;
        self.forget();
        raw_fd
    }
}

impl<E: End> Drop for PipeEnd<E> {
    fn drop(&mut self) {
        match self.raw_fd {
            // don't implicitly close any of the std io
            0..=2 => return,
            // don't close -1, NULL
            i if i < 0 => return,
            _ => (),
        }

        tracing::trace!(fd = self.raw_fd, end = E::display(), "closing pipe fd");
        close(self.raw_fd).ok();
    }
}

impl io::Read for PipeEnd<Read> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        nix_read(self.as_raw_fd(), buf).map_err(|e| match e.as_errno() {
            Some(errno) => errno.into(),
            _ => io::Error::new(io::ErrorKind::Other, "unknown nix error"),
        })
    }
}

impl io::Write for PipeEnd<Write> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        nix_write(self.as_raw_fd(), buf).map_err(|e| match e.as_errno() {
            Some(errno) => errno.into(),
            _ => io::Error::new(io::ErrorKind::Other, "unknown nix error"),
        })
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}

pub struct Pipe {
    read: PipeEnd<Read>,
    write: PipeEnd<Write>,
}

impl Pipe {
    unsafe fn from_raw_fd(read: RawFd, write: RawFd) -> nix::Result<Self> {
        use nix::fcntl::{fcntl, FcntlArg, OFlag};

        fcntl(read, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        fcntl(write, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

        Ok(Self {
            read: PipeEnd::from_raw_fd(read),
            write: PipeEnd::from_raw_fd(write),
        })
    }

    /// Creates a new non-blocking pipe pair.
    ///
    /// Intended to be created before forking, then one end kept in the
    /// parent and the other moved into the child.
    pub fn new() -> nix::Result<Self> {
        let (read, write) = nix_pipe()?;
        unsafe { Self::from_raw_fd(read, write) }
    }

    /// Creates a new pipe pair with ordinary blocking semantics on both
    /// ends. The command runner uses this before forking, then calls
    /// [`PipeEnd::set_nonblocking`] on only the end it keeps in the
    /// parent after the child inherits the other end.
    pub fn new_blocking() -> nix::Result<Self> {
        let (read, write) = nix_pipe()?;
        Ok(Self {
            read: unsafe { PipeEnd::from_raw_fd(read) },
            write: unsafe { PipeEnd::from_raw_fd(write) },
        })
    }

    pub fn take_writer(self) -> PipeEnd<Write> {
        let Pipe { write, .. } = self;
        write
    }

    pub fn take_reader(self) -> PipeEnd<Read> {
        let Pipe { read, .. } = self;
        read
    }

    pub fn split(self) -> (PipeEnd<Read>, PipeEnd<Write>) {
        (self.read, self.write)
    }
}
