//! Loading of the kernel module that owns the interrupt hardware.
//!
//! The module receives the interrupt routing of the session as load-time
//! parameters. Boards that provision the interrupt device themselves skip
//! this step entirely.

use std::fmt;
use std::io;

use crate::config::{RemoteCore, SessionConfig};

/// Load-time parameters handed to the interrupt module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleParams {
    pub inter_core_tx_irq: u32,
    pub inter_core_rx_irq: u32,
    pub remote_core: RemoteCore,
}

impl ModuleParams {
    pub fn from_config(cfg: &SessionConfig) -> Self {
        Self {
            inter_core_tx_irq: cfg.inter_core_tx_irq,
            inter_core_rx_irq: cfg.inter_core_rx_irq,
            remote_core: cfg.remote_core,
        }
    }
}

/// Renders the parameters in `modprobe` argument syntax.
impl fmt::Display for ModuleParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inter_core_tx_irq={} inter_core_rx_irq={} remote_core_type={} remote_core_index={}",
            self.inter_core_tx_irq,
            self.inter_core_rx_irq,
            self.remote_core.core_type as u32,
            self.remote_core.index
        )
    }
}

/// Loads and unloads the privileged interrupt helper.
pub trait ModuleLoader: Send {
    fn load(&mut self, params: &ModuleParams) -> io::Result<()>;
    fn unload(&mut self) -> io::Result<()>;
}

/// Loader of platforms whose interrupt resource is provisioned externally.
///
/// Uninhabited: a platform returning `Option<NoModule>` always returns `None`.
#[derive(Debug)]
pub enum NoModule {}

impl ModuleLoader for NoModule {
    fn load(&mut self, _params: &ModuleParams) -> io::Result<()> {
        match *self {}
    }

    fn unload(&mut self) -> io::Result<()> {
        match *self {}
    }
}

#[cfg(target_os = "linux")]
pub use linux::KernelModule;

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CString;
    use std::fs::File;
    use std::io;
    use std::os::fd::AsRawFd;

    use super::{ModuleLoader, ModuleParams};
    use crate::config::ModuleSpec;

    /// Kernel object loaded with `finit_module` and removed with
    /// `delete_module`.
    #[derive(Debug)]
    pub struct KernelModule {
        spec: ModuleSpec,
        loaded: bool,
    }

    impl KernelModule {
        pub fn new(spec: ModuleSpec) -> Self {
            Self {
                spec,
                loaded: false,
            }
        }

        pub fn spec(&self) -> &ModuleSpec {
            &self.spec
        }
    }

    fn c_string(value: String) -> io::Result<CString> {
        CString::new(value).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
    }

    impl ModuleLoader for KernelModule {
        fn load(&mut self, params: &ModuleParams) -> io::Result<()> {
            let object = File::open(&self.spec.path)?;
            let args = c_string(params.to_string())?;
            log::debug!("loading {} with `{args:?}`", self.spec.path.display());
            // SAFETY: the descriptor and the NUL-terminated argument string
            // outlive the call.
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_finit_module,
                    object.as_raw_fd(),
                    args.as_ptr(),
                    0 as libc::c_int,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            self.loaded = true;
            Ok(())
        }

        fn unload(&mut self) -> io::Result<()> {
            if !self.loaded {
                return Ok(());
            }
            let name = c_string(self.spec.name.clone())?;
            // SAFETY: `name` is NUL-terminated and outlives the call.
            let rc = unsafe {
                libc::syscall(libc::SYS_delete_module, name.as_ptr(), libc::O_NONBLOCK)
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            self.loaded = false;
            Ok(())
        }
    }

}
