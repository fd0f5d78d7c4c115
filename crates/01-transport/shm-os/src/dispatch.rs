//! Budgeted, interrupt-driven receive dispatch.
//!
//! The dispatcher thread sleeps in the notification wait until the remote
//! core raises the rx interrupt, then hands the receive callback a budget.
//! A round that finishes under budget re-arms the interrupt and goes back to
//! sleep. A round that spends the whole budget leaves the interrupt masked,
//! yields the processor and polls again, so bursts are drained by polling
//! instead of one interrupt per message.
//!
//! Shutdown is cooperative: [`Dispatcher::stop`] closes the wait primitive and
//! the thread exits at the next wait or between two polls, never inside a
//! callback. A callback that returns after shutdown began does not re-arm.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::DispatchPriority;
use crate::error::{ShmError, ShmResult};
use crate::notify::{NotifyChannel, NotifyDevice, WaitOutcome};

/// Consecutive failed waits after which the dispatcher gives up.
pub const MAX_WAIT_FAILURES: u32 = 8;

const THREAD_NAME: &str = "shm-rx";

/// Receive side of the message protocol layered on the shared regions.
pub trait ReceiveCallback: Send + 'static {
    /// Processes up to `budget` units of inbound work and returns how many
    /// were consumed.
    fn receive(&mut self, budget: usize) -> usize;
}

impl<F> ReceiveCallback for F
where
    F: FnMut(usize) -> usize + Send + 'static,
{
    fn receive(&mut self, budget: usize) -> usize {
        self(budget)
    }
}

/// Lifecycle state of the dispatcher thread.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    Waiting = 0,
    Dispatching = 1,
    Terminated = 2,
}

impl DispatcherState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => DispatcherState::Waiting,
            1 => DispatcherState::Dispatching,
            _ => DispatcherState::Terminated,
        }
    }
}

/// Counters describing the dispatcher's work so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Interrupt occurrences that woke the dispatcher.
    pub interrupts: u64,
    /// Receive callback invocations.
    pub polls: u64,
    /// Polls issued right after a round that spent its whole budget.
    pub repolls: u64,
    /// Receive interrupt re-arms delivered to the device.
    pub rearms: u64,
    /// Waits that failed and were treated as spurious wake-ups.
    pub wait_errors: u64,
}

#[derive(Debug)]
struct DispatchShared {
    state: AtomicU8,
    interrupts: AtomicU64,
    polls: AtomicU64,
    repolls: AtomicU64,
    rearms: AtomicU64,
    wait_errors: AtomicU64,
}

impl DispatchShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(DispatcherState::Waiting as u8),
            interrupts: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            repolls: AtomicU64::new(0),
            rearms: AtomicU64::new(0),
            wait_errors: AtomicU64::new(0),
        }
    }

    fn set_state(&self, state: DispatcherState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            interrupts: self.interrupts.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            repolls: self.repolls.load(Ordering::Relaxed),
            rearms: self.rearms.load(Ordering::Relaxed),
            wait_errors: self.wait_errors.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the running rx dispatcher thread.
pub struct Dispatcher<D> {
    channel: Arc<NotifyChannel<D>>,
    shared: Arc<DispatchShared>,
    thread: JoinHandle<()>,
}

impl<D: NotifyDevice + 'static> Dispatcher<D> {
    /// Starts the dispatcher thread.
    ///
    /// `promote` runs first on the new thread to apply `priority`; when it
    /// fails the thread exits and a thread error is returned.
    pub fn spawn<C>(
        channel: Arc<NotifyChannel<D>>,
        callback: C,
        budget: usize,
        priority: DispatchPriority,
        promote: fn(DispatchPriority) -> io::Result<()>,
    ) -> ShmResult<Self>
    where
        C: ReceiveCallback,
    {
        let shared = Arc::new(DispatchShared::new());
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<io::Result<()>>(1);

        let thread = {
            let channel = Arc::clone(&channel);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(THREAD_NAME.into())
                .spawn(move || {
                    if let Err(err) = promote(priority) {
                        shared.set_state(DispatcherState::Terminated);
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));
                    drop(ready_tx);
                    run(&channel, callback, budget, &shared);
                })
                .map_err(ShmError::Thread)?
        };

        let started = ready_rx.recv().unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::Other,
                "rx dispatcher exited during start-up",
            ))
        });
        if let Err(err) = started {
            let _ = thread.join();
            return Err(ShmError::Thread(err));
        }

        log::debug!("rx dispatcher started (budget {budget}, {priority:?})");
        Ok(Self {
            channel,
            shared,
            thread,
        })
    }

    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.snapshot()
    }

    /// Closes the wait primitive and joins the thread.
    ///
    /// Returns the final statistics, or `None` when the thread panicked.
    pub fn stop(self) -> Option<DispatchStats> {
        self.channel.shutdown();
        match self.thread.join() {
            Ok(()) => Some(self.shared.snapshot()),
            Err(_) => {
                self.shared.set_state(DispatcherState::Terminated);
                log::error!("rx dispatcher panicked");
                None
            }
        }
    }
}

fn run<D, C>(channel: &NotifyChannel<D>, mut callback: C, budget: usize, shared: &DispatchShared)
where
    D: NotifyDevice,
    C: ReceiveCallback,
{
    let mut wait_failures = 0u32;

    'wait: loop {
        shared.set_state(DispatcherState::Waiting);
        match channel.wait() {
            Ok(WaitOutcome::Closed) => break,
            Ok(WaitOutcome::Interrupt) => {
                wait_failures = 0;
                DispatchShared::bump(&shared.interrupts);
            }
            Err(err) => {
                wait_failures += 1;
                DispatchShared::bump(&shared.wait_errors);
                if wait_failures >= MAX_WAIT_FAILURES {
                    log::error!("rx wait failed {wait_failures} times in a row, stopping: {err}");
                    break;
                }
                log::warn!("rx wait failed, polling anyway: {err}");
            }
        }

        shared.set_state(DispatcherState::Dispatching);
        loop {
            DispatchShared::bump(&shared.polls);
            let consumed = poll_once(&mut callback, budget);
            log::trace!("rx round consumed {consumed}/{budget}");

            if consumed < budget {
                // Teardown masks the line after raising the flag; leave it masked.
                if channel.is_shut_down() {
                    break 'wait;
                }
                if channel.enable_rx() {
                    DispatchShared::bump(&shared.rearms);
                }
                continue 'wait;
            }

            thread::yield_now();
            if channel.is_shut_down() {
                break 'wait;
            }
            DispatchShared::bump(&shared.repolls);
        }
    }

    shared.set_state(DispatcherState::Terminated);
    log::debug!("rx dispatcher stopped");
}

fn poll_once<C: ReceiveCallback>(callback: &mut C, budget: usize) -> usize {
    let consumed = callback.receive(budget);
    if consumed > budget {
        log::warn!("rx callback consumed {consumed} with a budget of {budget}");
        return budget;
    }
    consumed
}
