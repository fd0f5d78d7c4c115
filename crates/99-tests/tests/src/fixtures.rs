//! Host fixture that journals every acquire and release.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use runtime_loopback::{Doorbell, IrqLine};
use shm_os::{
    DispatchPriority, InitStep, Mapping, MemoryDevice, ModuleLoader, ModuleParams, NotifyCmd,
    NotifyDevice, Platform, WaitOutcome,
};

pub const PAGE: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    Module,
    Memory,
    LocalMap,
    RemoteMap,
    Notify,
}

impl Resource {
    pub fn acquired_by(step: InitStep) -> Option<Self> {
        match step {
            InitStep::LoadModule => Some(Resource::Module),
            InitStep::OpenMemory => Some(Resource::Memory),
            InitStep::MapLocal => Some(Resource::LocalMap),
            InitStep::MapRemote => Some(Resource::RemoteMap),
            InitStep::OpenNotify => Some(Resource::Notify),
            InitStep::StartDispatcher => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Open(Resource),
    Close(Resource),
    Command(NotifyCmd),
}

#[derive(Default)]
pub struct Journal {
    events: Mutex<Vec<Event>>,
}

impl Journal {
    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    /// Every opened resource has been closed exactly once.
    pub fn balanced(&self) -> bool {
        let events = self.events.lock();
        [
            Resource::Module,
            Resource::Memory,
            Resource::LocalMap,
            Resource::RemoteMap,
            Resource::Notify,
        ]
        .into_iter()
        .all(|res| {
            let opens = events.iter().filter(|e| **e == Event::Open(res)).count();
            let closes = events.iter().filter(|e| **e == Event::Close(res)).count();
            opens == closes && opens <= 1
        })
    }
}

fn injected() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "injected fault")
}

/// Journaling [`Platform`] with per-step fault injection.
pub struct RecordingHost {
    pub journal: Arc<Journal>,
    pub line: Arc<IrqLine>,
    pub with_module: bool,
    pub fail_at: Option<InitStep>,
    pub fail_release: Option<Resource>,
    pub module_params: Arc<Mutex<Option<ModuleParams>>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self {
            journal: Arc::new(Journal::default()),
            line: IrqLine::new(),
            with_module: true,
            fail_at: None,
            fail_release: None,
            module_params: Arc::default(),
        }
    }

    pub fn failing_at(step: InitStep) -> Self {
        Self {
            fail_at: Some(step),
            ..Self::new()
        }
    }

    fn fails(&self, step: InitStep) -> bool {
        self.fail_at == Some(step)
    }

    fn releases_fail(&self, res: Resource) -> bool {
        self.fail_release == Some(res)
    }
}

pub struct RecLoader {
    journal: Arc<Journal>,
    fail_load: bool,
    fail_unload: bool,
    params: Arc<Mutex<Option<ModuleParams>>>,
}

impl ModuleLoader for RecLoader {
    fn load(&mut self, params: &ModuleParams) -> io::Result<()> {
        if self.fail_load {
            return Err(injected());
        }
        *self.params.lock() = Some(*params);
        self.journal.push(Event::Open(Resource::Module));
        Ok(())
    }

    fn unload(&mut self) -> io::Result<()> {
        self.journal.push(Event::Close(Resource::Module));
        if self.fail_unload {
            return Err(injected());
        }
        Ok(())
    }
}

pub struct RecMemory {
    journal: Arc<Journal>,
    fail_map: Option<usize>,
    fail_close: bool,
    fail_unmap: Option<Resource>,
    maps: AtomicUsize,
}

impl MemoryDevice for RecMemory {
    type Mapping = RecMapping;

    fn map(&self, _page_base: u64, len: usize) -> io::Result<RecMapping> {
        let nth = self.maps.fetch_add(1, Ordering::Relaxed);
        if self.fail_map == Some(nth) {
            return Err(injected());
        }
        let resource = if nth == 0 {
            Resource::LocalMap
        } else {
            Resource::RemoteMap
        };
        self.journal.push(Event::Open(resource));
        Ok(RecMapping {
            buf: vec![0u8; len].into_boxed_slice(),
            journal: Arc::clone(&self.journal),
            resource,
            fail: self.fail_unmap == Some(resource),
        })
    }

    fn close(self) -> io::Result<()> {
        self.journal.push(Event::Close(Resource::Memory));
        if self.fail_close {
            return Err(injected());
        }
        Ok(())
    }
}

pub struct RecMapping {
    buf: Box<[u8]>,
    journal: Arc<Journal>,
    resource: Resource,
    fail: bool,
}

impl Mapping for RecMapping {
    fn as_mut_ptr(&self) -> *mut u8 {
        self.buf.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn unmap(self) -> io::Result<()> {
        self.journal.push(Event::Close(self.resource));
        if self.fail {
            return Err(injected());
        }
        Ok(())
    }
}

pub struct RecNotify {
    journal: Arc<Journal>,
    bell: Doorbell,
    fail_close: bool,
}

impl NotifyDevice for RecNotify {
    fn write_command(&self, cmd: NotifyCmd) -> io::Result<usize> {
        self.journal.push(Event::Command(cmd));
        self.bell.write_command(cmd)
    }

    fn wait_interrupt(&self) -> io::Result<WaitOutcome> {
        self.bell.wait_interrupt()
    }

    fn close_wait(&self) -> io::Result<()> {
        self.bell.close_wait()
    }

    fn close(self) -> io::Result<()> {
        self.journal.push(Event::Close(Resource::Notify));
        self.bell.close()?;
        if self.fail_close {
            return Err(injected());
        }
        Ok(())
    }
}

fn refuse_promotion(_: DispatchPriority) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::PermissionDenied,
        "priority change refused",
    ))
}

fn keep_priority(_: DispatchPriority) -> io::Result<()> {
    Ok(())
}

impl Platform for RecordingHost {
    type Memory = RecMemory;
    type Notify = RecNotify;
    type Loader = RecLoader;

    fn page_size(&self) -> usize {
        PAGE
    }

    fn module_loader(&mut self) -> Option<RecLoader> {
        self.with_module.then(|| RecLoader {
            journal: Arc::clone(&self.journal),
            fail_load: self.fails(InitStep::LoadModule),
            fail_unload: self.releases_fail(Resource::Module),
            params: Arc::clone(&self.module_params),
        })
    }

    fn open_memory(&mut self) -> io::Result<RecMemory> {
        if self.fails(InitStep::OpenMemory) {
            return Err(injected());
        }
        self.journal.push(Event::Open(Resource::Memory));
        let fail_map = match self.fail_at {
            Some(InitStep::MapLocal) => Some(0),
            Some(InitStep::MapRemote) => Some(1),
            _ => None,
        };
        let fail_unmap = self
            .fail_release
            .filter(|res| matches!(res, Resource::LocalMap | Resource::RemoteMap));
        Ok(RecMemory {
            journal: Arc::clone(&self.journal),
            fail_map,
            fail_close: self.releases_fail(Resource::Memory),
            fail_unmap,
            maps: AtomicUsize::new(0),
        })
    }

    fn open_notify(&mut self) -> io::Result<RecNotify> {
        if self.fails(InitStep::OpenNotify) {
            return Err(injected());
        }
        self.journal.push(Event::Open(Resource::Notify));
        Ok(RecNotify {
            journal: Arc::clone(&self.journal),
            bell: self.line.open(),
            fail_close: self.releases_fail(Resource::Notify),
        })
    }

    fn thread_priority(&self) -> fn(DispatchPriority) -> io::Result<()> {
        if self.fails(InitStep::StartDispatcher) {
            refuse_promotion
        } else {
            keep_priority
        }
    }
}
