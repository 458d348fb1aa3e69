use std::{
    alloc::{self, Layout},
    io,
    ptr::NonNull,
    sync::OnceLock,
};

use foldhash::{HashMap, HashMapExt};

use crate::{Error, Result};

/// Smallest page size the manager accepts from a [`PageSource`].
pub const MIN_PAGE_SIZE: usize = 1024;

/// Used if the operating system refuses to tell us its page size.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// Virtual memory page size of the computer, discovered once per process.
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Returns the virtual memory page size of the computer in bytes. This is usually 4096.
///
/// The value can't be known at compile time, so the first call asks the operating
/// system and every later call reuses the answer.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(OsPages::system_page_size)
}

/// Where the manager gets its pages from.
///
/// The manager never touches a general purpose heap for its own bookkeeping pages or
/// for the pages it carves into blocks; everything comes from a page source.
///
/// # Safety
///
/// A region returned by [`acquire`][PageSource::acquire] must be valid for reads and
/// writes of `units * page_size()` bytes, zero filled, aligned to `page_size()`, and
/// must not be used by anyone else until it is handed back to
/// [`release`][PageSource::release]. `page_size()` must always return the same value.
pub unsafe trait PageSource {
    /// Size in bytes of one page. Every region is a whole number of pages.
    fn page_size(&self) -> usize;

    /// Requests a zero filled region of `units` pages. Failures are reported, never
    /// retried.
    fn acquire(&self, units: usize) -> Result<NonNull<u8>>;

    /// Returns a region of `units` pages.
    ///
    /// # Safety
    ///
    /// `region` must have been returned by `acquire(units)` on this source and must not
    /// have been released already.
    unsafe fn release(&self, region: NonNull<u8>, units: usize) -> Result<()>;
}

/// Pages mapped straight from the operating system (`mmap` on unix, `VirtualAlloc`
/// on Windows).
///
/// Creating an `OsPages` reads the system page size, which is all the process-wide
/// initialization the manager needs.
#[derive(Clone, Copy, Debug)]
pub struct OsPages {
    page_size: usize,
}

impl OsPages {
    /// Creates a page source using the system page size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            page_size: page_size(),
        }
    }
}

impl Default for OsPages {
    fn default() -> Self {
        Self::new()
    }
}

/// This trait provides an abstraction to handle low level memory operations and
/// syscalls. Our top level view of the manager has nothing to do with the concrete
/// APIs offered by each kernel.
trait PlatformMemory {
    /// Request a memory region of size `len`.
    unsafe fn request_memory(len: usize) -> io::Result<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Returns the virtual memory page size of the computer in bytes.
    fn system_page_size() -> usize;
}

#[cfg(unix)]
mod unix {
    use std::{io, ptr::NonNull};

    use libc::{c_int, c_void, off_t};

    use super::{FALLBACK_PAGE_SIZE, OsPages, PlatformMemory};

    impl PlatformMemory for OsPages {
        unsafe fn request_memory(len: usize) -> io::Result<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            // SAFETY: a private anonymous mapping does not alias any existing memory.
            let addr = unsafe { libc::mmap(ADDR, len, PROT, FLAGS, FD, OFFSET) };

            if addr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            // Anonymous mappings are zero filled by the kernel.
            NonNull::new(addr.cast::<u8>())
                .ok_or_else(|| io::Error::other("mmap returned a null mapping"))
        }

        unsafe fn return_memory(addr: NonNull<u8>, len: usize) -> io::Result<()> {
            // SAFETY: the caller hands back a mapping of exactly `len` bytes.
            match unsafe { libc::munmap(addr.as_ptr().cast::<c_void>(), len) } {
                0 => Ok(()),
                _ => Err(io::Error::last_os_error()),
            }
        }

        fn system_page_size() -> usize {
            // SAFETY: sysconf has no preconditions.
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

            usize::try_from(size).unwrap_or(FALLBACK_PAGE_SIZE)
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{ffi::c_void, io, mem::MaybeUninit, ptr::NonNull};

    use ::windows::Win32::System::{Memory, SystemInformation};

    use super::{FALLBACK_PAGE_SIZE, OsPages, PlatformMemory};

    impl PlatformMemory for OsPages {
        unsafe fn request_memory(len: usize) -> io::Result<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            // SAFETY: a fresh reservation does not alias any existing memory. Committed
            // pages are zero filled.
            let addr = unsafe { Memory::VirtualAlloc(None, len, flags, protection) };

            NonNull::new(addr.cast::<u8>()).ok_or_else(io::Error::last_os_error)
        }

        unsafe fn return_memory(addr: NonNull<u8>, _len: usize) -> io::Result<()> {
            // SAFETY: the caller hands back a region returned by VirtualAlloc.
            unsafe { Memory::VirtualFree(addr.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE) }
                .map_err(io::Error::other)
        }

        fn system_page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();

            // SAFETY: GetSystemInfo always fills the whole structure.
            let system_info = unsafe {
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());
                system_info.assume_init()
            };

            match usize::try_from(system_info.dwPageSize) {
                Ok(0) | Err(_) => FALLBACK_PAGE_SIZE,
                Ok(size) => size,
            }
        }
    }
}

fn region_len(units: usize, page_size: usize) -> io::Result<usize> {
    units
        .checked_mul(page_size)
        .filter(|len| *len > 0)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{units} page(s) of {page_size} bytes is not a valid region"),
            )
        })
}

// SAFETY: anonymous mappings are zero filled, page aligned and private to us.
unsafe impl PageSource for OsPages {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn acquire(&self, units: usize) -> Result<NonNull<u8>> {
        let len = region_len(units, self.page_size)
            .map_err(|source| Error::MapFailed { units, source })?;

        // SAFETY: requesting fresh memory has no preconditions beyond a valid length.
        unsafe { Self::request_memory(len) }.map_err(|source| Error::MapFailed { units, source })
    }

    unsafe fn release(&self, region: NonNull<u8>, units: usize) -> Result<()> {
        let addr = region.as_ptr() as usize;
        let len = region_len(units, self.page_size).map_err(|source| Error::UnmapFailed {
            addr,
            units,
            source,
        })?;

        // SAFETY: the caller guarantees `region` came from `acquire(units)`.
        unsafe { Self::return_memory(region, len) }.map_err(|source| Error::UnmapFailed {
            addr,
            units,
            source,
        })
    }
}

/// Pages carved from the global allocator, aligned to a page size of our choosing.
///
/// Useful where page geometry must not depend on the machine (tests, diagnostics) or
/// where no mapping syscall is available.
#[derive(Clone, Copy, Debug)]
pub struct HeapPages {
    page_size: usize,
}

impl HeapPages {
    /// Creates a page source with pages of `page_size` bytes. The page size is
    /// validated when the manager is built.
    #[must_use]
    pub const fn new(page_size: usize) -> Self {
        Self { page_size }
    }

    fn layout(&self, units: usize) -> io::Result<Layout> {
        let len = region_len(units, self.page_size)?;

        Layout::from_size_align(len, self.page_size).map_err(io::Error::other)
    }
}

// SAFETY: `alloc_zeroed` with an alignment of one page hands out zeroed, page aligned
// memory owned by us until `dealloc`.
unsafe impl PageSource for HeapPages {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn acquire(&self, units: usize) -> Result<NonNull<u8>> {
        let layout = self.layout(units).map_err(|source| Error::MapFailed { units, source })?;

        // SAFETY: the layout has a non-zero size.
        let region = unsafe { alloc::alloc_zeroed(layout) };

        NonNull::new(region).ok_or_else(|| Error::MapFailed {
            units,
            source: io::ErrorKind::OutOfMemory.into(),
        })
    }

    unsafe fn release(&self, region: NonNull<u8>, units: usize) -> Result<()> {
        let layout = self.layout(units).map_err(|source| Error::UnmapFailed {
            addr: region.as_ptr() as usize,
            units,
            source,
        })?;

        // SAFETY: the caller guarantees `region` came from `acquire(units)`, which used
        // the same layout.
        unsafe { alloc::dealloc(region.as_ptr(), layout) };

        Ok(())
    }
}

/// The lowest layer of the manager. Here is where we talk to the page source and
/// remember which pages currently hold blocks.
///
/// Knowing the live VM pages lets `free` check a pointer before it reads anything
/// through it: a pointer is only trusted if it falls inside one of them.
#[derive(Debug)]
pub(crate) struct Kernel<S> {
    source: S,
    page_size: usize,
    /// Live VM pages keyed by address. Descriptor pages are not in here.
    vm_pages: HashMap<usize, NonNull<u8>>,
}

impl<S: PageSource> Kernel<S> {
    pub(crate) fn new(source: S) -> Result<Self> {
        let page_size = source.page_size();

        if !page_size.is_power_of_two() || page_size < MIN_PAGE_SIZE {
            return Err(Error::InvalidPageSize {
                page_size,
                min: MIN_PAGE_SIZE,
            });
        }

        Ok(Self {
            source,
            page_size,
            vm_pages: HashMap::new(),
        })
    }

    #[inline]
    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of VM pages currently mapped.
    pub(crate) fn vm_page_count(&self) -> usize {
        self.vm_pages.len()
    }

    /// Requests `units` zeroed pages from the page source.
    pub(crate) fn request_memory(&self, units: usize) -> Result<NonNull<u8>> {
        match self.source.acquire(units) {
            Ok(region) => {
                debug_assert_eq!(region.as_ptr() as usize % self.page_size, 0);
                log::debug!("mapped {units} page(s) at {region:p}");
                Ok(region)
            }
            Err(error) => {
                log::warn!("{error}");
                Err(error)
            }
        }
    }

    /// Returns `units` pages to the page source. A failure is logged and otherwise
    /// ignored: there is nothing sensible left to do with the region.
    ///
    /// # Safety
    ///
    /// `region` must come from [`Kernel::request_memory`] with the same `units` and must
    /// not be used afterwards.
    pub(crate) unsafe fn return_memory(&self, region: NonNull<u8>, units: usize) {
        // SAFETY: forwarded from the caller.
        match unsafe { self.source.release(region, units) } {
            Ok(()) => log::debug!("unmapped {units} page(s) at {region:p}"),
            Err(error) => log::error!("{error}"),
        }
    }

    /// Maps one page that is going to be carved into blocks.
    pub(crate) fn map_vm_page(&mut self) -> Result<NonNull<u8>> {
        let page = self.request_memory(1)?;
        self.vm_pages.insert(page.as_ptr() as usize, page);
        Ok(page)
    }

    /// Unmaps a page obtained from [`Kernel::map_vm_page`].
    ///
    /// # Safety
    ///
    /// Nothing may point into the page any more.
    pub(crate) unsafe fn unmap_vm_page(&mut self, page: NonNull<u8>) {
        self.vm_pages.remove(&(page.as_ptr() as usize));

        // SAFETY: VM pages are always single page regions.
        unsafe { self.return_memory(page, 1) };
    }

    /// Returns the live VM page containing `addr`, if any.
    pub(crate) fn vm_page_containing(&self, addr: usize) -> Option<NonNull<u8>> {
        let base = addr & !(self.page_size - 1);
        self.vm_pages.get(&base).copied()
    }
}
