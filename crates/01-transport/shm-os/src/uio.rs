//! Linux UIO interrupt device.
//!
//! Commands are 32-bit opcode writes to the UIO node; an interrupt makes the
//! node readable with a 32-bit event count. The wait polls the node together
//! with an eventfd so shutdown can close the wait without signals or thread
//! cancellation.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::path::Path;

use crate::notify::{NotifyCmd, NotifyDevice, WaitOutcome};

/// Open UIO node plus the eventfd closing its wait.
#[derive(Debug)]
pub struct UioDevice {
    node: File,
    closer: OwnedFd,
}

impl UioDevice {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let node = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(node)
    }

    /// Wraps an already open UIO node.
    pub fn from_file(node: File) -> io::Result<Self> {
        // SAFETY: eventfd takes no pointers; the result is checked below.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a fresh descriptor owned by nobody else.
        let closer = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { node, closer })
    }

    fn poll(&self) -> io::Result<(bool, bool)> {
        let mut fds = [
            libc::pollfd {
                fd: self.closer.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.node.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        loop {
            // SAFETY: `fds` is a valid array of two pollfd entries.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        let closed = fds[0].revents != 0;
        let node_ready = fds[1].revents != 0;
        if !closed && fds[1].revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "uio node reported an error condition",
            ));
        }
        Ok((closed, node_ready))
    }
}

impl NotifyDevice for UioDevice {
    fn write_command(&self, cmd: NotifyCmd) -> io::Result<usize> {
        (&self.node).write(&cmd.to_bytes())
    }

    fn wait_interrupt(&self) -> io::Result<WaitOutcome> {
        let (closed, node_ready) = self.poll()?;
        if closed {
            return Ok(WaitOutcome::Closed);
        }
        debug_assert!(node_ready);
        // The event count only unblocks the read; its value is unused.
        let mut count = [0u8; 4];
        let read = (&self.node).read(&mut count)?;
        if read != count.len() {
            log::trace!("uio event read returned {read} bytes");
        }
        Ok(WaitOutcome::Interrupt)
    }

    fn close_wait(&self) -> io::Result<()> {
        let one = 1u64.to_ne_bytes();
        // SAFETY: writes eight bytes from a live stack buffer.
        let rc = unsafe {
            libc::write(
                self.closer.as_raw_fd(),
                one.as_ptr().cast::<libc::c_void>(),
                one.len(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn close(self) -> io::Result<()> {
        drop(self.closer);
        let fd = self.node.into_raw_fd();
        // SAFETY: `fd` was just released by the owning `File`.
        if unsafe { libc::close(fd) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
