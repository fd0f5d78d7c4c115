//! Session bootstrap and teardown.
//!
//! `Session::init` acquires the host resources one step at a time. If a step
//! fails, everything acquired before it is released newest first and the
//! step's error is returned, so callers never see a half-built session.
//! Teardown walks the same stack in the same order and keeps going past
//! failures, which are logged and reported but never abort it.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::dispatch::{DispatchStats, Dispatcher, DispatcherState, ReceiveCallback};
use crate::error::{InitStep, ShmError, ShmResult};
use crate::module::{ModuleLoader, ModuleParams};
use crate::notify::NotifyChannel;
use crate::platform::Platform;
use crate::region::{MemoryDevice, SharedMemoryRegion};

/// Shared memory region type produced by platform `P`.
pub type RegionOf<P> = SharedMemoryRegion<<<P as Platform>::Memory as MemoryDevice>::Mapping>;

/// Teardown steps, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TeardownStep {
    DisableRx,
    StopDispatcher,
    CloseNotify,
    UnmapRemote,
    UnmapLocal,
    CloseMemory,
    UnloadModule,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeardownStep::DisableRx => "disable rx interrupt",
            TeardownStep::StopDispatcher => "stop rx dispatcher",
            TeardownStep::CloseNotify => "close notification device",
            TeardownStep::UnmapRemote => "unmap remote shared memory",
            TeardownStep::UnmapLocal => "unmap local shared memory",
            TeardownStep::CloseMemory => "close memory device",
            TeardownStep::UnloadModule => "unload interrupt module",
        };
        f.write_str(name)
    }
}

/// Outcome of releasing a session's resources.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Steps that failed; every later step still ran.
    pub failed: Vec<TeardownStep>,
    /// Final dispatcher statistics, when a dispatcher was running.
    pub stats: Option<DispatchStats>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, step: TeardownStep, err: impl fmt::Display) {
        log::warn!("failed to {step}: {err}");
        self.failed.push(step);
    }
}

struct Resources<P: Platform> {
    loader: Option<P::Loader>,
    memory: Option<P::Memory>,
    local: Option<RegionOf<P>>,
    remote: Option<RegionOf<P>>,
    notify: Option<Arc<NotifyChannel<P::Notify>>>,
    dispatcher: Option<Dispatcher<P::Notify>>,
}

impl<P: Platform> Resources<P> {
    fn empty() -> Self {
        Self {
            loader: None,
            memory: None,
            local: None,
            remote: None,
            notify: None,
            dispatcher: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.loader.is_none()
            && self.memory.is_none()
            && self.local.is_none()
            && self.remote.is_none()
            && self.notify.is_none()
            && self.dispatcher.is_none()
    }

    fn acquire<C>(
        &mut self,
        platform: &mut P,
        config: &SessionConfig,
        callback: C,
    ) -> ShmResult<()>
    where
        C: ReceiveCallback,
    {
        if let Some(mut loader) = platform.module_loader() {
            loader
                .load(&ModuleParams::from_config(config))
                .map_err(|err| ShmError::resource(InitStep::LoadModule, err))?;
            self.loader = Some(loader);
        }

        let memory = platform
            .open_memory()
            .map_err(|err| ShmError::resource(InitStep::OpenMemory, err))?;
        let memory: &P::Memory = self.memory.insert(memory);

        let page_size = platform.page_size();
        self.local = Some(SharedMemoryRegion::map(
            memory,
            config.local_shm_addr,
            config.shm_size,
            page_size,
            InitStep::MapLocal,
        )?);
        self.remote = Some(SharedMemoryRegion::map(
            memory,
            config.remote_shm_addr,
            config.shm_size,
            page_size,
            InitStep::MapRemote,
        )?);

        let device = platform
            .open_notify()
            .map_err(|err| ShmError::resource(InitStep::OpenNotify, err))?;
        let channel = Arc::new(NotifyChannel::new(device));
        self.notify = Some(Arc::clone(&channel));

        self.dispatcher = Some(Dispatcher::spawn(
            channel,
            callback,
            config.rx_budget,
            config.priority,
            platform.thread_priority(),
        )?);
        Ok(())
    }

    /// Releases whatever is held, newest first.
    fn release(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        if let Some(dispatcher) = self.dispatcher.take() {
            let rearms = dispatcher.stats().rearms;
            let mut masked = true;
            if let Some(channel) = &self.notify {
                // The flag goes up before the mask so a callback still running
                // cannot re-arm the line behind it.
                channel.shutdown();
                masked = channel.disable_rx();
            }
            log::debug!("stopping rx dispatcher");
            let stats = dispatcher.stop();
            if let (Some(channel), Some(stats)) = (&self.notify, &stats) {
                if stats.rearms > rearms {
                    log::debug!("rx re-armed during shutdown, masking again");
                    masked = channel.disable_rx();
                }
            }
            if !masked {
                report.failed.push(TeardownStep::DisableRx);
            }
            match stats {
                Some(stats) => report.stats = Some(stats),
                None => report.record(TeardownStep::StopDispatcher, "dispatcher thread panicked"),
            }
        }

        if let Some(channel) = self.notify.take() {
            match Arc::try_unwrap(channel) {
                Ok(channel) => {
                    if let Err(err) = channel.close() {
                        report.record(TeardownStep::CloseNotify, err);
                    }
                }
                Err(_) => report.record(TeardownStep::CloseNotify, "channel is still shared"),
            }
        }

        if let Some(remote) = self.remote.take() {
            if let Err(err) = remote.unmap() {
                report.record(TeardownStep::UnmapRemote, err);
            }
        }
        if let Some(local) = self.local.take() {
            if let Err(err) = local.unmap() {
                report.record(TeardownStep::UnmapLocal, err);
            }
        }

        if let Some(memory) = self.memory.take() {
            if let Err(err) = memory.close() {
                report.record(TeardownStep::CloseMemory, err);
            }
        }

        if let Some(mut loader) = self.loader.take() {
            if let Err(err) = loader.unload() {
                report.record(TeardownStep::UnloadModule, err);
            }
        }

        report
    }
}

/// Established link to the remote core.
pub struct Session<P: Platform> {
    config: SessionConfig,
    res: Resources<P>,
}

impl<P: Platform> Session<P> {
    /// Brings up a session on `platform`.
    ///
    /// `callback` runs on the rx dispatcher thread each time the remote core
    /// signals new data.
    pub fn init<C>(platform: &mut P, config: SessionConfig, callback: C) -> ShmResult<Self>
    where
        C: ReceiveCallback,
    {
        config.validate()?;

        let mut res = Resources::empty();
        if let Err(err) = res.acquire(platform, &config, callback) {
            log::error!("session init failed: {err}");
            let report = res.release();
            if !report.is_clean() {
                log::warn!("rollback left {} step(s) failing", report.failed.len());
            }
            return Err(err);
        }

        log::debug!(
            "session up: local {:#x}, remote {:#x}, {:#x} bytes each",
            config.local_shm_addr,
            config.remote_shm_addr,
            config.shm_size
        );
        Ok(Self { config, res })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn local_region(&self) -> &RegionOf<P> {
        self.res
            .local
            .as_ref()
            .expect("established session maps the local region")
    }

    pub fn remote_region(&self) -> &RegionOf<P> {
        self.res
            .remote
            .as_ref()
            .expect("established session maps the remote region")
    }

    /// Usable address of the region this core writes.
    pub fn local_virtual_address(&self) -> NonNull<u8> {
        self.local_region().as_ptr()
    }

    /// Usable address of the region the remote core writes.
    pub fn remote_virtual_address(&self) -> NonNull<u8> {
        self.remote_region().as_ptr()
    }

    fn channel(&self) -> &NotifyChannel<P::Notify> {
        self.res
            .notify
            .as_deref()
            .expect("established session holds the notification channel")
    }

    /// Raises the tx interrupt towards the remote core.
    ///
    /// A lost command is logged and counted, not returned; the result only
    /// says whether it was delivered.
    pub fn notify_remote(&self) -> bool {
        self.channel().trigger_tx()
    }

    /// Notification device, for platform-specific inspection.
    pub fn notify_device(&self) -> &P::Notify {
        self.channel().device()
    }

    /// Notification commands lost to short writes so far.
    pub fn dropped_commands(&self) -> u64 {
        self.channel().dropped_commands()
    }

    pub fn dispatcher_state(&self) -> DispatcherState {
        self.res
            .dispatcher
            .as_ref()
            .map_or(DispatcherState::Terminated, Dispatcher::state)
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.res
            .dispatcher
            .as_ref()
            .map(Dispatcher::stats)
            .unwrap_or_default()
    }

    /// Tears the session down.
    pub fn free(mut self) -> TeardownReport {
        let report = self.res.release();
        if report.is_clean() {
            log::debug!("session released");
        } else {
            log::warn!("session released with failures: {:?}", report.failed);
        }
        report
    }
}

impl<P: Platform> Drop for Session<P> {
    fn drop(&mut self) {
        if !self.res.is_empty() {
            log::debug!("session dropped without free, releasing");
            let _ = self.res.release();
        }
    }
}

impl<P: Platform> fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher_state())
            .finish_non_exhaustive()
    }
}
