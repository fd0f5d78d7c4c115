//! Cross-core interrupt line seen as a command/wait handle.
//!
//! The interrupt device understands three opcode writes and one blocking
//! wait. Losing a command only delays signalling, so [`NotifyChannel`] logs
//! short writes instead of propagating them. Shutting the channel down closes
//! the wait primitive: a blocked [`NotifyChannel::wait`] returns
//! [`WaitOutcome::Closed`] instead of waiting for the next interrupt.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{ShmError, ShmResult};

/// Number of attempts made to re-arm the receive interrupt.
pub const ENABLE_RX_ATTEMPTS: usize = 3;

/// Opcodes understood by the interrupt device.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotifyCmd {
    /// Raise the interrupt towards the remote core.
    TriggerTx = 1,
    /// Re-arm the interrupt raised by the remote core.
    EnableRx = 2,
    /// Mask the interrupt raised by the remote core.
    DisableRx = 3,
}

impl NotifyCmd {
    /// Size of one command write.
    pub const WIRE_LEN: usize = std::mem::size_of::<i32>();

    pub fn opcode(self) -> i32 {
        self as i32
    }

    pub fn from_opcode(opcode: i32) -> Option<Self> {
        match opcode {
            1 => Some(NotifyCmd::TriggerTx),
            2 => Some(NotifyCmd::EnableRx),
            3 => Some(NotifyCmd::DisableRx),
            _ => None,
        }
    }

    /// Native-endian encoding written to the device.
    pub fn to_bytes(self) -> [u8; Self::WIRE_LEN] {
        self.opcode().to_ne_bytes()
    }
}

/// Why a blocking wait returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// An interrupt occurred.
    Interrupt,
    /// The wait primitive was closed for shutdown.
    Closed,
}

/// Host handle to the inter-core interrupt.
pub trait NotifyDevice: Send + Sync {
    /// Writes one command, returning the number of bytes accepted.
    fn write_command(&self, cmd: NotifyCmd) -> io::Result<usize>;

    /// Blocks until an interrupt occurs or [`NotifyDevice::close_wait`] is
    /// called.
    fn wait_interrupt(&self) -> io::Result<WaitOutcome>;

    /// Makes the current and every later `wait_interrupt` return
    /// [`WaitOutcome::Closed`].
    fn close_wait(&self) -> io::Result<()>;

    /// Releases the handle.
    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

/// Notification channel of a session.
#[derive(Debug)]
pub struct NotifyChannel<D> {
    device: D,
    shutdown: AtomicBool,
    dropped: AtomicU64,
}

impl<D: NotifyDevice> NotifyChannel<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            shutdown: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Writes `cmd`, reporting a short or failed write as a command error.
    pub fn send(&self, cmd: NotifyCmd) -> ShmResult<()> {
        match self.device.write_command(cmd) {
            Ok(NotifyCmd::WIRE_LEN) => Ok(()),
            Ok(written) => Err(ShmError::Command {
                cmd,
                written,
                expected: NotifyCmd::WIRE_LEN,
            }),
            Err(err) => {
                log::debug!("write of {cmd:?} failed: {err}");
                Err(ShmError::Command {
                    cmd,
                    written: 0,
                    expected: NotifyCmd::WIRE_LEN,
                })
            }
        }
    }

    fn send_logged(&self, cmd: NotifyCmd) -> bool {
        match self.send(cmd) {
            Ok(()) => true,
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("{err}");
                false
            }
        }
    }

    /// Re-arms the receive interrupt, retrying a bounded number of times.
    ///
    /// A lost enable leaves the line masked until the next teardown, so this
    /// is the one command that is retried.
    pub fn enable_rx(&self) -> bool {
        for attempt in 1..=ENABLE_RX_ATTEMPTS {
            if self.send_logged(NotifyCmd::EnableRx) {
                return true;
            }
            log::warn!("rx interrupt re-arm attempt {attempt}/{ENABLE_RX_ATTEMPTS} lost");
        }
        log::error!("rx interrupt left masked after {ENABLE_RX_ATTEMPTS} attempts");
        false
    }

    pub fn disable_rx(&self) -> bool {
        self.send_logged(NotifyCmd::DisableRx)
    }

    /// Signals the remote core that data is available.
    pub fn trigger_tx(&self) -> bool {
        self.send_logged(NotifyCmd::TriggerTx)
    }

    /// Blocks until an interrupt occurs or the channel is shut down.
    pub fn wait(&self) -> io::Result<WaitOutcome> {
        if self.is_shut_down() {
            return Ok(WaitOutcome::Closed);
        }
        let outcome = self.device.wait_interrupt()?;
        if self.is_shut_down() {
            return Ok(WaitOutcome::Closed);
        }
        Ok(outcome)
    }

    /// Sets the shutdown flag and closes the wait primitive.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(err) = self.device.close_wait() {
            log::warn!("failed to close notification wait: {err}");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Commands lost to short or failed writes so far.
    pub fn dropped_commands(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Releases the device handle.
    pub fn close(self) -> io::Result<()> {
        self.device.close()
    }
}
