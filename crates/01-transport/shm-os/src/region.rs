//! Page-aligned mapping of physical shared memory.
//!
//! Host mappings are page granular while the regions agreed with the remote
//! core are not. A [`PageSpan`] records how a physical range is widened to
//! whole pages, and a [`SharedMemoryRegion`] pairs that span with the live
//! mapping so the usable address is always derived from checked values.

use std::io;
use std::ops::Range;
use std::ptr::NonNull;

use crate::error::{InitStep, ShmError, ShmResult};

/// Page-aligned window covering a requested physical range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageSpan {
    /// Requested physical address.
    pub phys_addr: u64,
    /// Requested length in bytes.
    pub len: usize,
    /// `phys_addr` truncated down to a page boundary.
    pub page_base: u64,
    /// Distance from `page_base` to `phys_addr`.
    pub offset: usize,
}

impl PageSpan {
    /// Computes the span for `len` bytes at `phys_addr`, or `None` when the
    /// page size is not a power of two or the mapping length overflows.
    pub fn new(phys_addr: u64, len: usize, page_size: usize) -> Option<Self> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return None;
        }
        let page_base = phys_addr & !(page_size as u64 - 1);
        let offset = usize::try_from(phys_addr - page_base).ok()?;
        offset.checked_add(len)?;
        Some(Self {
            phys_addr,
            len,
            page_base,
            offset,
        })
    }

    /// Number of bytes that must be mapped at `page_base`.
    pub fn map_len(&self) -> usize {
        self.offset + self.len
    }

    /// Physical range actually requested.
    pub fn phys_range(&self) -> Range<u64> {
        self.phys_addr..self.phys_addr + self.len as u64
    }
}

/// Live mapping of a page-aligned physical window.
///
/// Dropping a mapping must release it; [`Mapping::unmap`] does the same while
/// reporting failures.
pub trait Mapping: Send {
    /// Start of the mapped window (the page-aligned base).
    fn as_mut_ptr(&self) -> *mut u8;
    /// Length of the mapped window.
    fn len(&self) -> usize;
    fn unmap(self) -> io::Result<()>
    where
        Self: Sized;
}

/// Privileged handle through which physical memory is mapped.
pub trait MemoryDevice: Send {
    type Mapping: Mapping;

    /// Maps `len` bytes of physical memory starting at the page-aligned
    /// `page_base`.
    fn map(&self, page_base: u64, len: usize) -> io::Result<Self::Mapping>;

    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

/// One of the two shared memory regions of a session.
#[derive(Debug)]
pub struct SharedMemoryRegion<M> {
    span: PageSpan,
    mapping: M,
}

impl<M: Mapping> SharedMemoryRegion<M> {
    /// Maps `len` bytes at `phys_addr` through `device`.
    ///
    /// `step` names the bootstrap step in errors. Nothing is left mapped when
    /// this fails.
    pub fn map<D>(
        device: &D,
        phys_addr: u64,
        len: usize,
        page_size: usize,
        step: InitStep,
    ) -> ShmResult<Self>
    where
        D: MemoryDevice<Mapping = M>,
    {
        let span = PageSpan::new(phys_addr, len, page_size).ok_or_else(|| {
            ShmError::resource(
                step,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cannot page-align {len:#x} bytes at {phys_addr:#x}"),
                ),
            )
        })?;
        let mapping = device
            .map(span.page_base, span.map_len())
            .map_err(|err| ShmError::resource(step, err))?;

        if mapping.as_mut_ptr().is_null() || mapping.len() < span.map_len() {
            let err = io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "mapping of {:#x} returned {} bytes, expected {}",
                    span.page_base,
                    mapping.len(),
                    span.map_len()
                ),
            );
            if let Err(unmap_err) = mapping.unmap() {
                log::warn!("failed to release short mapping: {unmap_err}");
            }
            return Err(ShmError::resource(step, err));
        }

        log::debug!(
            "mapped {:#x}+{:#x} (page {:#x}, offset {:#x})",
            span.phys_addr,
            span.len,
            span.page_base,
            span.offset
        );
        Ok(Self { span, mapping })
    }

    pub fn span(&self) -> &PageSpan {
        &self.span
    }

    pub fn phys_addr(&self) -> u64 {
        self.span.phys_addr
    }

    /// Usable length of the region.
    pub fn len(&self) -> usize {
        self.span.len
    }

    pub fn is_empty(&self) -> bool {
        self.span.len == 0
    }

    /// Usable virtual address: the mapped base advanced by the in-page offset.
    pub fn as_ptr(&self) -> NonNull<u8> {
        // SAFETY: `map` verified the mapping is non-null and covers
        // `offset + len` bytes.
        unsafe { NonNull::new_unchecked(self.mapping.as_mut_ptr().add(self.span.offset)) }
    }

    pub fn virt_addr(&self) -> usize {
        self.as_ptr().as_ptr() as usize
    }

    /// Virtual address range of the usable window.
    pub fn window(&self) -> Range<usize> {
        let start = self.virt_addr();
        start..start + self.span.len
    }

    /// Whether `offset..offset + len` lies inside the region.
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .map_or(false, |end| end <= self.span.len)
    }

    /// Pointer to `offset` inside the region when `len` bytes fit from there.
    pub fn ptr_at(&self, offset: usize, len: usize) -> Option<NonNull<u8>> {
        if !self.contains(offset, len) {
            return None;
        }
        // SAFETY: bounds checked against the usable length above.
        Some(unsafe { NonNull::new_unchecked(self.as_ptr().as_ptr().add(offset)) })
    }

    /// Views the region as a byte slice.
    ///
    /// # Safety
    /// The remote core writes these bytes concurrently. The caller must make
    /// sure the range it reads is not being modified for the slice lifetime.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: upheld by the caller, bounds guaranteed by `map`.
        unsafe { std::slice::from_raw_parts(self.as_ptr().as_ptr(), self.span.len) }
    }

    /// Views the region as a mutable byte slice.
    ///
    /// # Safety
    /// As for [`SharedMemoryRegion::as_slice`], and no other reference into
    /// the region may be alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: upheld by the caller, bounds guaranteed by `map`.
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr().as_ptr(), self.span.len) }
    }

    /// Releases the mapping.
    pub fn unmap(self) -> io::Result<()> {
        self.mapping.unmap()
    }
}

/// Page size of the host.
#[cfg(unix)]
pub fn host_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(not(unix))]
pub fn host_page_size() -> usize {
    4096
}
