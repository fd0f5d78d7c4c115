#![deny(missing_docs)]
//! In-process host for running sessions without the target hardware.
//!
//! Physical memory is a regular file mapped through [`DevMem`], so offsets in
//! the file play the role of physical addresses. The inter-core interrupt is
//! an [`IrqLine`]: delivering an interrupt masks the line until the receiver
//! re-arms it, and a raise on a masked line is latched and delivered on the
//! next re-arm. Two lines can be cross-connected so that trigger-tx on one
//! session raises the other session's rx interrupt.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use shm_os::wait;
use shm_os::{
    host_page_size, DevMem, NoModule, NotifyCmd, NotifyDevice, Platform, WaitOutcome,
};

#[derive(Debug)]
struct LineState {
    enabled: bool,
    latched: bool,
    pending: u32,
}

/// Simulated level-latched interrupt line.
#[derive(Debug)]
pub struct IrqLine {
    state: Mutex<LineState>,
    epoch: AtomicU32,
    commands: Mutex<Vec<NotifyCmd>>,
    peer: Mutex<Option<Weak<IrqLine>>>,
    short_writes: AtomicUsize,
    raised: AtomicU64,
    delivered: AtomicU64,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl IrqLine {
    /// Creates an unmasked line with nothing pending.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LineState {
                enabled: true,
                latched: false,
                pending: 0,
            }),
            epoch: AtomicU32::new(0),
            commands: Mutex::new(Vec::new()),
            peer: Mutex::new(None),
            short_writes: AtomicUsize::new(0),
            raised: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    /// Wires trigger-tx of each line to the other line's interrupt.
    pub fn connect(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock() = Some(Arc::downgrade(b));
        *b.peer.lock() = Some(Arc::downgrade(a));
    }

    /// Raises the interrupt, as the remote core would.
    pub fn raise(&self) {
        self.raised.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.enabled {
            state.enabled = false;
            self.deliver(&mut state);
        } else {
            log::trace!("irq raised while masked, latching");
            state.latched = true;
        }
    }

    fn deliver(&self, state: &mut LineState) {
        state.pending += 1;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        wait::bump_and_wake(&self.epoch);
    }

    fn enable(&self) {
        let mut state = self.state.lock();
        if state.latched {
            state.latched = false;
            self.deliver(&mut state);
        } else {
            state.enabled = true;
        }
    }

    fn disable(&self) {
        self.state.lock().enabled = false;
    }

    /// Makes the next `count` command writes come back short.
    pub fn fail_next_writes(&self, count: usize) {
        self.short_writes.store(count, Ordering::Release);
    }

    /// Every command written to the line, in order.
    pub fn commands(&self) -> Vec<NotifyCmd> {
        self.commands.lock().clone()
    }

    /// Whether the line would deliver a raise right now.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Raises seen, including latched ones.
    pub fn raised(&self) -> u64 {
        self.raised.load(Ordering::Relaxed)
    }

    /// Interrupts handed to a waiter.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Handles opened on this line.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }

    /// Handles closed on this line.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    /// Opens a notification handle on the line.
    pub fn open(self: &Arc<Self>) -> Doorbell {
        self.opens.fetch_add(1, Ordering::AcqRel);
        Doorbell {
            line: Arc::clone(self),
            closed: AtomicBool::new(false),
        }
    }

    fn take_short_write(&self) -> bool {
        self.short_writes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn raise_peer(&self) {
        let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
        match peer {
            Some(peer) => peer.raise(),
            None => log::trace!("trigger-tx on an unconnected line"),
        }
    }
}

/// Notification handle on an [`IrqLine`].
#[derive(Debug)]
pub struct Doorbell {
    line: Arc<IrqLine>,
    closed: AtomicBool,
}

impl Doorbell {
    /// Line this handle was opened on.
    pub fn line(&self) -> &Arc<IrqLine> {
        &self.line
    }
}

impl NotifyDevice for Doorbell {
    fn write_command(&self, cmd: NotifyCmd) -> io::Result<usize> {
        self.line.commands.lock().push(cmd);
        if self.line.take_short_write() {
            return Ok(0);
        }
        match cmd {
            NotifyCmd::TriggerTx => self.line.raise_peer(),
            NotifyCmd::EnableRx => self.line.enable(),
            NotifyCmd::DisableRx => self.line.disable(),
        }
        Ok(NotifyCmd::WIRE_LEN)
    }

    fn wait_interrupt(&self) -> io::Result<WaitOutcome> {
        loop {
            let seen = self.line.epoch.load(Ordering::Acquire);
            if self.closed.load(Ordering::Acquire) {
                return Ok(WaitOutcome::Closed);
            }
            {
                let mut state = self.line.state.lock();
                if state.pending > 0 {
                    state.pending -= 1;
                    return Ok(WaitOutcome::Interrupt);
                }
            }
            let _ = wait::wait_u32(&self.line.epoch, seen);
        }
    }

    fn close_wait(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        wait::bump_and_wake(&self.line.epoch);
        Ok(())
    }

    fn close(self) -> io::Result<()> {
        self.line.closes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Creates (or truncates) `path` as `len` bytes of zeroed backing memory.
pub fn provision_backing(path: impl AsRef<Path>, len: u64) -> io::Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(len)
}

/// [`Platform`] backed by a memory file and an [`IrqLine`].
#[derive(Clone, Debug)]
pub struct LoopbackHost {
    memory_path: PathBuf,
    line: Arc<IrqLine>,
    page_size: usize,
}

impl LoopbackHost {
    /// Host mapping `memory_path` and signalling through `line`.
    pub fn new(memory_path: impl Into<PathBuf>, line: Arc<IrqLine>) -> Self {
        Self {
            memory_path: memory_path.into(),
            line,
            page_size: host_page_size(),
        }
    }

    /// Two hosts over one memory file with cross-connected lines.
    pub fn pair(memory_path: impl Into<PathBuf>) -> (Self, Self) {
        let memory_path = memory_path.into();
        let (a, b) = (IrqLine::new(), IrqLine::new());
        IrqLine::connect(&a, &b);
        (Self::new(memory_path.clone(), a), Self::new(memory_path, b))
    }

    /// Overrides the mapping granularity; must be a multiple of the host's.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Interrupt line of this host.
    pub fn line(&self) -> &Arc<IrqLine> {
        &self.line
    }

    /// Backing memory file.
    pub fn memory_path(&self) -> &Path {
        &self.memory_path
    }
}

impl Platform for LoopbackHost {
    type Memory = DevMem;
    type Notify = Doorbell;
    type Loader = NoModule;

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn module_loader(&mut self) -> Option<NoModule> {
        None
    }

    fn open_memory(&mut self) -> io::Result<DevMem> {
        DevMem::open(&self.memory_path)
    }

    fn open_notify(&mut self) -> io::Result<Doorbell> {
        Ok(self.line.open())
    }
}
