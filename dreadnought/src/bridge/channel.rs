//! Pipe-backed frame channels.
//!
//! Workers run without a tokio runtime (they are forked from the coordinator), so
//! the worker side uses blocking reads and writes over raw descriptors. The
//! coordinator side wraps the opposite ends in tokio pipes. Both sides speak
//! through [`JsonCodec`], so a frame written by one is read by the other
//! regardless of whether the pipe is anonymous or a FIFO.

use std::fs::File;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use serde::{Serialize, de::DeserializeOwned};
use tokio::net::unix::pipe;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use super::codec::{FrameTooLarge, JsonCodec};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("peer closed the channel")]
    PeerClosed,

    #[error("malformed frame: {0}")]
    Malformed(#[source] io::Error),

    /// Refused by the encoder; the channel is still in sync.
    #[error(transparent)]
    Oversized(#[from] FrameTooLarge),

    #[error("channel I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// Classify a codec or pipe error.
    pub fn from_io(err: io::Error) -> Self {
        if let Some(too_large) = err.get_ref().and_then(|e| e.downcast_ref::<FrameTooLarge>()) {
            return ChannelError::Oversized(FrameTooLarge {
                len: too_large.len,
                max: too_large.max,
            });
        }
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => ChannelError::PeerClosed,
            io::ErrorKind::InvalidData => ChannelError::Malformed(err),
            _ => ChannelError::Io(err),
        }
    }
}

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
#[derive(Debug)]
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn into_owned_fd(self) -> OwnedFd {
        self.fd
    }

    /// Toggle O_NONBLOCK on the descriptor.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        use nix::fcntl::{FcntlArg, OFlag, fcntl};

        let bits = fcntl(&self.fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let mut flags = OFlag::from_bits_truncate(bits);
        flags.set(OFlag::O_NONBLOCK, nonblocking);
        fcntl(&self.fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
        Ok(())
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Anonymous pipe as `(read end, write end)`.
pub fn pipe_pair() -> io::Result<(PipeFd, PipeFd)> {
    let (read, write) = nix::unistd::pipe().map_err(io::Error::from)?;
    Ok((PipeFd::new(read), PipeFd::new(write)))
}

/// Result of waiting on a read end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    /// Every writer is gone and nothing is left to read.
    Hangup,
    TimedOut,
}

/// Block until `fd` has data, hangs up, or `timeout` passes.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: PollTimeout) -> io::Result<Readiness> {
    loop {
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(Readiness::TimedOut),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.contains(PollFlags::POLLIN) {
                    return Ok(Readiness::Readable);
                }
                if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
                {
                    return Ok(Readiness::Hangup);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Blocking frame reader over the read end of a pipe.
pub struct FrameReader<T> {
    fd: PipeFd,
    buf: BytesMut,
    codec: JsonCodec<T>,
}

impl<T: DeserializeOwned> FrameReader<T> {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            fd,
            buf: BytesMut::with_capacity(READ_CHUNK),
            codec: JsonCodec::new(),
        }
    }

    /// Wait for the next frame, or report that the writer went away.
    ///
    /// Bytes already buffered from an earlier read count as readable, so two
    /// frames delivered by one `read` are both seen without polling again.
    pub fn wait(&self, timeout: PollTimeout) -> io::Result<Readiness> {
        if !self.buf.is_empty() {
            return Ok(Readiness::Readable);
        }
        wait_readable(self.fd.as_fd(), timeout)
    }

    /// Block until a complete frame is available.
    ///
    /// EOF, with or without a partial frame buffered, is `PeerClosed`.
    pub fn recv(&mut self) -> Result<T, ChannelError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(item) = self.codec.decode(&mut self.buf).map_err(ChannelError::from_io)? {
                return Ok(item);
            }
            let n = self.fd.read(&mut chunk).map_err(ChannelError::from_io)?;
            if n == 0 {
                return Err(ChannelError::PeerClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

impl<T> AsFd for FrameReader<T> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Blocking frame writer over the write end of a pipe.
pub struct FrameWriter<T> {
    fd: PipeFd,
    buf: BytesMut,
    codec: JsonCodec<T>,
}

impl<T: Serialize> FrameWriter<T> {
    pub fn new(fd: PipeFd) -> Self {
        Self::with_codec(fd, JsonCodec::new())
    }

    pub fn with_codec(fd: PipeFd, codec: JsonCodec<T>) -> Self {
        Self {
            fd,
            buf: BytesMut::new(),
            codec,
        }
    }

    /// Encode and write one whole frame before returning.
    pub fn send(&mut self, item: T) -> Result<(), ChannelError> {
        self.buf.clear();
        self.codec
            .encode(item, &mut self.buf)
            .map_err(ChannelError::from_io)?;
        self.fd.write_all(&self.buf).map_err(ChannelError::from_io)
    }
}

impl<T> AsFd for FrameWriter<T> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

pub type AsyncFrameReader<T> = FramedRead<pipe::Receiver, JsonCodec<T>>;
pub type AsyncFrameWriter<T> = FramedWrite<pipe::Sender, JsonCodec<T>>;

/// Wrap a write end for the coordinator. Must run inside a tokio runtime.
pub fn async_writer<T>(fd: OwnedFd) -> io::Result<AsyncFrameWriter<T>> {
    let sender = pipe::Sender::from_file(File::from(fd))?;
    Ok(FramedWrite::new(sender, JsonCodec::new()))
}

/// Wrap a read end for the coordinator. Must run inside a tokio runtime.
pub fn async_reader<T>(fd: OwnedFd) -> io::Result<AsyncFrameReader<T>> {
    let receiver = pipe::Receiver::from_file(File::from(fd))?;
    Ok(FramedRead::new(receiver, JsonCodec::new()))
}

/// Raw async read end, used for the log relay.
pub fn async_receiver(fd: OwnedFd) -> io::Result<pipe::Receiver> {
    pipe::Receiver::from_file(File::from(fd))
}
