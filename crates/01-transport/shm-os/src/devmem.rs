//! Physical memory reached through a memory device node.
//!
//! On the target this is `/dev/mem`, where file offsets are physical
//! addresses. Any regular file works the same way, which is how host-side
//! harnesses stand in for physical RAM.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::region::{Mapping, MemoryDevice};

/// Open memory device node.
#[derive(Debug)]
pub struct DevMem {
    path: PathBuf,
    file: File,
}

impl DevMem {
    /// Opens `path` for shared read/write mappings.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MemoryDevice for DevMem {
    type Mapping = DevMemMapping;

    fn map(&self, page_base: u64, len: usize) -> io::Result<DevMemMapping> {
        // SAFETY: the mapping aliases memory shared with another core by
        // contract; it is only ever exposed through raw pointers.
        let map = unsafe {
            MmapOptions::new()
                .offset(page_base)
                .len(len)
                .map_mut(&self.file)?
        };
        Ok(DevMemMapping { map })
    }

    #[cfg(unix)]
    fn close(self) -> io::Result<()> {
        use std::os::fd::IntoRawFd;

        let fd = self.file.into_raw_fd();
        // SAFETY: `fd` was just released by the owning `File`.
        if unsafe { libc::close(fd) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn close(self) -> io::Result<()> {
        drop(self.file);
        Ok(())
    }
}

/// Shared read/write mapping of a [`DevMem`] window.
#[derive(Debug)]
pub struct DevMemMapping {
    map: MmapMut,
}

impl Mapping for DevMemMapping {
    fn as_mut_ptr(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn unmap(self) -> io::Result<()> {
        drop(self.map);
        Ok(())
    }
}
