//! Host resources a session is built from.
//!
//! A [`Platform`] opens the privileged handles named by host convention. The
//! session drives it through the bootstrap steps and releases what it
//! returned, so alternative platforms only describe how to acquire things.

use std::io;

use crate::config::DispatchPriority;
use crate::module::ModuleLoader;
use crate::notify::NotifyDevice;
use crate::region::MemoryDevice;
use crate::sched;

/// Source of the privileged handles behind a session.
pub trait Platform {
    type Memory: MemoryDevice;
    type Notify: NotifyDevice + 'static;
    type Loader: ModuleLoader;

    /// Mapping granularity of the host.
    fn page_size(&self) -> usize;

    /// Loader for the interrupt module, or `None` when the interrupt resource
    /// is provisioned externally.
    fn module_loader(&mut self) -> Option<Self::Loader>;

    fn open_memory(&mut self) -> io::Result<Self::Memory>;

    fn open_notify(&mut self) -> io::Result<Self::Notify>;

    /// Applies the dispatcher's scheduling policy; runs on the dispatcher
    /// thread before it starts waiting.
    fn thread_priority(&self) -> fn(DispatchPriority) -> io::Result<()> {
        sched::apply_priority
    }
}

#[cfg(target_os = "linux")]
pub use linux::LinuxHost;

#[cfg(target_os = "linux")]
mod linux {
    use std::io;

    use super::Platform;
    use crate::config::HostConfig;
    use crate::devmem::DevMem;
    use crate::module::KernelModule;
    use crate::region::host_page_size;
    use crate::uio::UioDevice;

    /// Linux host: `/dev/mem` mappings, a UIO interrupt node and optionally
    /// the kernel module providing it.
    #[derive(Clone, Debug, Default)]
    pub struct LinuxHost {
        config: HostConfig,
    }

    impl LinuxHost {
        pub fn new(config: HostConfig) -> Self {
            Self { config }
        }

        pub fn config(&self) -> &HostConfig {
            &self.config
        }
    }

    impl Platform for LinuxHost {
        type Memory = DevMem;
        type Notify = UioDevice;
        type Loader = KernelModule;

        fn page_size(&self) -> usize {
            host_page_size()
        }

        fn module_loader(&mut self) -> Option<KernelModule> {
            self.config.module.clone().map(KernelModule::new)
        }

        fn open_memory(&mut self) -> io::Result<DevMem> {
            DevMem::open(&self.config.mem_device)
        }

        fn open_notify(&mut self) -> io::Result<UioDevice> {
            UioDevice::open(&self.config.uio_device)
        }
    }
}
