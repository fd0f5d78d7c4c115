//! OS integration layer for a shared-memory transport between two cores.
//!
//! The crate brings up everything a transport library needs from the host
//! before any message can move:
//! * [`SharedMemoryRegion`] – page-truncated mappings of the local and remote
//!   physical windows.
//! * [`NotifyChannel`] – the inter-core interrupt, driven by 32-bit commands.
//! * [`ModuleLoader`] – optional loading of the kernel module providing it.
//! * [`Dispatcher`] – a budgeted rx thread that hands interrupts to a
//!   [`ReceiveCallback`].
//! * [`Session`] – transactional bootstrap and best-effort teardown of all of
//!   the above for one [`Platform`].

mod config;
mod devmem;
mod dispatch;
mod error;
mod module;
mod notify;
mod platform;
mod region;
pub mod sched;
mod session;
#[cfg(target_os = "linux")]
mod uio;
#[cfg(not(target_arch = "wasm32"))]
pub mod wait;

pub use config::{
    CoreType, DispatchPriority, HostConfig, ModuleSpec, RemoteCore, SessionConfig,
    DEFAULT_MEM_DEVICE, DEFAULT_RX_BUDGET, DEFAULT_UIO_DEVICE,
};
pub use devmem::{DevMem, DevMemMapping};
pub use dispatch::{
    DispatchStats, Dispatcher, DispatcherState, ReceiveCallback, MAX_WAIT_FAILURES,
};
pub use error::{ErrorKind, InitStep, ShmError, ShmResult};
#[cfg(target_os = "linux")]
pub use module::KernelModule;
pub use module::{ModuleLoader, ModuleParams, NoModule};
pub use notify::{NotifyChannel, NotifyCmd, NotifyDevice, WaitOutcome, ENABLE_RX_ATTEMPTS};
#[cfg(target_os = "linux")]
pub use platform::LinuxHost;
pub use platform::Platform;
pub use region::{host_page_size, Mapping, MemoryDevice, PageSpan, SharedMemoryRegion};
pub use session::{RegionOf, Session, TeardownReport, TeardownStep};
#[cfg(target_os = "linux")]
pub use uio::UioDevice;
