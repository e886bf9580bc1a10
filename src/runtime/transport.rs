//! Byte transport abstraction under the connection state machine.
//!
//! Connectors talk to the peer exclusively through `Transport`, so the
//! engine core never names a socket type. The production implementation
//! wraps a non-blocking `mio` TCP stream; tests drive the state machine
//! with a scripted in-memory transport.

use std::fs::File;
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Non-blocking byte stream plus the file-transmit fast path.
pub trait Transport: Send {
    /// Read available bytes. `Ok(0)` means the peer closed its half.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as many bytes as the socket accepts.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Scatter-gather write; partial progress is normal.
    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Transmit up to `len` bytes of `file` starting at `offset`.
    /// The default reads into a bounce buffer and writes; socket
    /// transports may override with an in-kernel copy.
    fn send_file(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize> {
        let mut buf = vec![0u8; len.min(64 * 1024)];
        #[cfg(unix)]
        let n = file.read_at(&mut buf, offset)?;
        #[cfg(not(unix))]
        let n = {
            use std::io::{Seek, SeekFrom};
            let mut f = file.try_clone()?;
            f.seek(SeekFrom::Start(offset))?;
            f.read(&mut buf)?
        };
        if n == 0 {
            return Ok(0);
        }
        self.write(&buf[..n])
    }

    /// Switch between blocking and non-blocking modes. Used by the
    /// final drain, which flushes the tail of a response synchronously.
    fn set_blocking(&mut self, blocking: bool) -> io::Result<()>;

    /// True when the transport encrypts; disqualifies in-kernel file
    /// transmission.
    fn is_secure(&self) -> bool {
        false
    }

    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Plain TCP transport over a `mio` stream.
pub struct TcpTransport {
    stream: mio::net::TcpStream,
}

impl TcpTransport {
    pub fn new(stream: mio::net::TcpStream) -> TcpTransport {
        TcpTransport { stream }
    }

    pub fn stream_mut(&mut self) -> &mut mio::net::TcpStream {
        &mut self.stream
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.write_vectored(bufs)
    }

    #[cfg(target_os = "linux")]
    fn send_file(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize> {
        use std::os::fd::AsRawFd;
        let mut off = offset as libc::off_t;
        let sent = unsafe {
            libc::sendfile(
                self.stream.as_raw_fd(),
                file.as_raw_fd(),
                &mut off,
                len,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::fd::{AsRawFd, BorrowedFd};
            let fd = unsafe { BorrowedFd::borrow_raw(self.stream.as_raw_fd()) };
            let sock = socket2::SockRef::from(&fd);
            sock.set_nonblocking(!blocking)
        }
        #[cfg(not(unix))]
        {
            let _ = blocking;
            Ok(())
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }
}
