//! Session and host configuration.
//!
//! [`SessionConfig`] describes the shared memory layout and interrupt routing
//! agreed with the remote core. [`HostConfig`] names the privileged host
//! resources used to reach them on Linux.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ShmError, ShmResult};

/// Receive budget handed to the rx callback per dispatch round.
pub const DEFAULT_RX_BUDGET: usize = 128;

/// Default memory device used to map physical shared memory.
pub const DEFAULT_MEM_DEVICE: &str = "/dev/mem";

/// Default UIO device exposing the inter-core interrupt.
pub const DEFAULT_UIO_DEVICE: &str = "/dev/uio0";

/// Family of the remote core receiving our notifications.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreType {
    /// Platform default remote core.
    #[default]
    Default = 0,
    CortexA53 = 1,
    CortexM7 = 2,
    CortexM4 = 3,
}

/// Selects the remote core targeted by trigger-tx interrupts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCore {
    pub core_type: CoreType,
    #[serde(default)]
    pub index: u32,
}

/// Scheduling policy applied to the rx dispatcher thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPriority {
    /// Highest priority of the FIFO real-time class.
    #[default]
    Realtime,
    /// Keep whatever the spawning thread has.
    Inherit,
}

/// Shared memory layout and interrupt routing of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Physical address of the region this core writes.
    pub local_shm_addr: u64,
    /// Physical address of the region the remote core writes.
    pub remote_shm_addr: u64,
    /// Size in bytes of each of the two regions.
    pub shm_size: usize,
    /// Interrupt raised towards the remote core.
    pub inter_core_tx_irq: u32,
    /// Interrupt raised by the remote core towards us.
    pub inter_core_rx_irq: u32,
    #[serde(default)]
    pub remote_core: RemoteCore,
    #[serde(default = "default_rx_budget")]
    pub rx_budget: usize,
    #[serde(default)]
    pub priority: DispatchPriority,
}

fn default_rx_budget() -> usize {
    DEFAULT_RX_BUDGET
}

impl SessionConfig {
    /// Layout where the remote region directly follows the local one.
    pub fn adjacent(local_shm_addr: u64, shm_size: usize, tx_irq: u32, rx_irq: u32) -> Self {
        Self {
            local_shm_addr,
            remote_shm_addr: local_shm_addr.wrapping_add(shm_size as u64),
            shm_size,
            inter_core_tx_irq: tx_irq,
            inter_core_rx_irq: rx_irq,
            remote_core: RemoteCore::default(),
            rx_budget: DEFAULT_RX_BUDGET,
            priority: DispatchPriority::default(),
        }
    }

    pub fn with_remote_core(mut self, remote_core: RemoteCore) -> Self {
        self.remote_core = remote_core;
        self
    }

    pub fn with_rx_budget(mut self, rx_budget: usize) -> Self {
        self.rx_budget = rx_budget;
        self
    }

    pub fn with_priority(mut self, priority: DispatchPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Configuration seen from the remote core: local and remote swapped.
    pub fn mirrored(&self) -> Self {
        Self {
            local_shm_addr: self.remote_shm_addr,
            remote_shm_addr: self.local_shm_addr,
            inter_core_tx_irq: self.inter_core_rx_irq,
            inter_core_rx_irq: self.inter_core_tx_irq,
            ..*self
        }
    }

    /// Rejects layouts no session could be built on.
    pub fn validate(&self) -> ShmResult<()> {
        if self.shm_size == 0 {
            return Err(ShmError::config("shm_size", "must be non-zero"));
        }
        if self.rx_budget == 0 {
            return Err(ShmError::config("rx_budget", "must be non-zero"));
        }
        let size = self.shm_size as u64;
        let local_end = self
            .local_shm_addr
            .checked_add(size)
            .ok_or_else(|| ShmError::config("local_shm_addr", "overflows the address space"))?;
        let remote_end = self
            .remote_shm_addr
            .checked_add(size)
            .ok_or_else(|| ShmError::config("remote_shm_addr", "overflows the address space"))?;
        if self.local_shm_addr < remote_end && self.remote_shm_addr < local_end {
            return Err(ShmError::config(
                "remote_shm_addr",
                "overlaps the local region",
            ));
        }
        Ok(())
    }
}

/// Kernel module owning the interrupt hardware.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Path of the `.ko` object.
    pub path: PathBuf,
    /// Name the kernel registers the module under, used for unloading.
    pub name: String,
}

/// Privileged host resources consumed by a Linux session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_mem_device")]
    pub mem_device: PathBuf,
    #[serde(default = "default_uio_device")]
    pub uio_device: PathBuf,
    /// Module to load before opening the UIO device. `None` when the
    /// interrupt resource is provisioned outside this process.
    #[serde(default)]
    pub module: Option<ModuleSpec>,
}

fn default_mem_device() -> PathBuf {
    PathBuf::from(DEFAULT_MEM_DEVICE)
}

fn default_uio_device() -> PathBuf {
    PathBuf::from(DEFAULT_UIO_DEVICE)
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            mem_device: default_mem_device(),
            uio_device: default_uio_device(),
            module: None,
        }
    }
}
