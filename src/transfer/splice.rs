//! Zero-copy path over `splice(2)`.
//!
//! Each round stages up to [`MAX_SPLICE_SIZE`] bytes from the source socket
//! into a private pipe, paces and counts them, then drains the pipe into the
//! sink socket. The pipe is always empty when a round starts.
//!
//! Both sockets are non-blocking and registered with the tokio reactor, so a
//! splice that would block clears the readiness bit through `try_io` and the
//! round parks until the reactor reports the socket ready again.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::debug;

use super::{Transfer, MAX_SPLICE_SIZE};

/// How a splice transfer ended.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Outcome {
    /// Source reached end of stream
    Finished,
    /// The descriptors cannot be spliced; the pipe has been emptied
    Unsupported,
}

/// Signature of [`splice`], so the transfer can be driven by a stand-in.
pub(super) type SpliceFn = fn(RawFd, RawFd, usize) -> io::Result<usize>;

/// Anonymous non-blocking pipe used as the in-kernel staging buffer.
struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` is a valid two-element array for pipe2 to fill.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded, both descriptors are open and owned by us.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }
}

pub(super) fn splice(fd_in: RawFd, fd_out: RawFd, len: usize) -> io::Result<usize> {
    loop {
        // SAFETY: plain syscall on descriptors that outlive the call; null
        // offsets mean "use and update the file position", as pipes and
        // sockets require.
        let rc = unsafe {
            libc::splice(
                fd_in,
                ptr::null_mut(),
                fd_out,
                ptr::null_mut(),
                len,
                libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
            )
        };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Errors meaning these descriptors will never splice.
fn is_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINVAL) | Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP)
    )
}

/// Splice `src` into `dst`, adding every byte delivered to `written`.
pub(super) async fn copy(
    transfer: &Transfer,
    src: &TcpStream,
    dst: &TcpStream,
    op: SpliceFn,
    written: &mut u64,
) -> io::Result<Outcome> {
    let pipe = match Pipe::new() {
        Ok(pipe) => pipe,
        Err(e) => {
            debug!(error = %e, "Failed to create splice pipe");
            return Ok(Outcome::Unsupported);
        }
    };

    loop {
        let staged = match fill(src, &pipe, op).await {
            Ok(0) => return Ok(Outcome::Finished),
            Ok(n) => n,
            Err(e) if is_unsupported(&e) => return Ok(Outcome::Unsupported),
            Err(e) => return Err(e),
        };

        transfer.account(staged as u64).await;

        let mut pending = staged;
        while pending > 0 {
            match drain(&pipe, dst, pending, op).await {
                Ok(n) => {
                    pending -= n;
                    *written += n as u64;
                }
                Err(e) if is_unsupported(&e) => {
                    let flushed = flush_through_user_space(&pipe, dst, pending).await?;
                    *written += flushed as u64;
                    return Ok(Outcome::Unsupported);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Stage bytes from `src` into the empty pipe. Zero means end of stream.
async fn fill(src: &TcpStream, pipe: &Pipe, op: SpliceFn) -> io::Result<usize> {
    let (src_fd, pipe_fd) = (src.as_raw_fd(), pipe.write.as_raw_fd());
    loop {
        src.readable().await?;
        match src.try_io(Interest::READABLE, || op(src_fd, pipe_fd, MAX_SPLICE_SIZE)) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            res => return res,
        }
    }
}

/// Move up to `pending` staged bytes from the pipe into `dst`.
async fn drain(pipe: &Pipe, dst: &TcpStream, pending: usize, op: SpliceFn) -> io::Result<usize> {
    let (pipe_fd, dst_fd) = (pipe.read.as_raw_fd(), dst.as_raw_fd());
    loop {
        dst.writable().await?;
        match dst.try_io(Interest::WRITABLE, || op(pipe_fd, dst_fd, pending)) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            res => return res,
        }
    }
}

/// Push bytes left in the pipe to `dst` with plain read/write.
///
/// Returns how many bytes were delivered.
async fn flush_through_user_space(
    pipe: &Pipe,
    dst: &TcpStream,
    pending: usize,
) -> io::Result<usize> {
    let mut buf = vec![0u8; pending];
    let mut filled = 0;
    while filled < pending {
        // SAFETY: the destination range lies inside `buf`.
        let rc = unsafe {
            libc::read(
                pipe.read.as_raw_fd(),
                buf[filled..].as_mut_ptr().cast(),
                pending - filled,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            break;
        }
        filled += rc as usize;
    }

    let mut sent = 0;
    while sent < filled {
        dst.writable().await?;
        match dst.try_write(&buf[sent..filled]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(sent)
}
