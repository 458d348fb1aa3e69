use std::{fmt, ptr::NonNull, thread};

use crate::{
    DropPolicy, Error, MemoryManagerBuilder, OsPages, PageSource, Result,
    block::BLOCK_HEADER_SIZE,
    family::{FamilyName, PageFamily},
    kernel::Kernel,
    list::Node,
    page::{PAGE_HEADER_SIZE, VmPage},
    registry::Registry,
    report::{FamilyInfo, FamilyUsage, RegistryReport, UsageReport},
};

/// A slab memory manager: memory is handed out per registered family, from pages that
/// only ever hold blocks of that family.
///
/// Every allocation must fit in one page, so the largest request a family can make is
/// [`max_allocation`](Self::max_allocation) bytes. Allocated memory is zeroed and stays
/// valid until it is passed to [`free`](Self::free) or the manager is dropped.
///
/// # Examples
///
/// ```
/// use slabmm::MemoryManager;
///
/// let mut manager = MemoryManager::new().unwrap();
/// manager.register_family("emp_t", 36).unwrap();
///
/// let employees = manager.allocate("emp_t", 2).unwrap();
/// manager.free(employees).unwrap();
/// ```
///
/// # Thread safety
///
/// The manager can be moved to another thread if its page source can, but it cannot be
/// shared between threads.
pub struct MemoryManager<S: PageSource = OsPages> {
    kernel: Kernel<S>,
    registry: Registry,
    drop_policy: DropPolicy,
}

impl MemoryManager {
    /// Creates a manager that maps its pages from the operating system.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPageSize`] if the system page size is below
    /// [`MIN_PAGE_SIZE`][crate::MIN_PAGE_SIZE].
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Starts building a manager with a custom page source or drop policy.
    #[inline]
    pub fn builder() -> MemoryManagerBuilder {
        MemoryManagerBuilder::new()
    }
}

impl<S: PageSource> MemoryManager<S> {
    pub(crate) fn new_inner(source: S, drop_policy: DropPolicy) -> Result<Self> {
        let kernel = Kernel::new(source)?;
        let registry = Registry::new(kernel.page_size());

        log::debug!(
            "memory manager with {} byte pages, {} families per descriptor page",
            kernel.page_size(),
            registry.families_per_page()
        );

        Ok(Self {
            kernel,
            registry,
            drop_policy,
        })
    }

    /// Size of the pages the manager works with.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.kernel.page_size()
    }

    /// Largest number of bytes a single allocation can have: the page minus its own
    /// header and the header of the block.
    #[inline]
    pub fn max_allocation(&self) -> usize {
        self.page_size() - PAGE_HEADER_SIZE - BLOCK_HEADER_SIZE
    }

    /// Registers a family of elements of `element_size` bytes under `name`.
    ///
    /// # Errors
    ///
    /// The name must be unique, non-empty and at most
    /// [`MAX_FAMILY_NAME_LEN`][crate::MAX_FAMILY_NAME_LEN] bytes long. The element size
    /// must be non-zero and fit in one page. [`Error::MapFailed`] if a new descriptor
    /// page is needed and cannot be mapped.
    pub fn register_family(&mut self, name: &str, element_size: usize) -> Result<FamilyInfo> {
        let family_name = FamilyName::new(name).or_else(rejected)?;

        if element_size == 0 {
            return rejected(Error::ZeroSizedElement {
                name: name.to_string(),
            });
        }

        let max = self.max_allocation();
        if element_size > max {
            return rejected(Error::OversizedElement {
                name: name.to_string(),
                element_size,
                max,
            });
        }

        let family = self
            .registry
            .register(&self.kernel, family_name, element_size)
            .or_else(rejected)?;

        log::debug!("registered family '{name}' of {element_size} byte elements");

        // SAFETY: the family was just written into its descriptor page.
        Ok(FamilyInfo::of(unsafe { family.as_ref() }))
    }

    /// Looks up a registered family.
    pub fn lookup(&self, name: &str) -> Option<FamilyInfo> {
        self.registry
            .lookup(name)
            // SAFETY: registered families live as long as the manager.
            .map(|family| FamilyInfo::of(unsafe { family.as_ref() }))
    }

    /// All registered families.
    pub fn families(&self) -> impl Iterator<Item = FamilyInfo> + '_ {
        self.registry
            .iter()
            // SAFETY: registered families live as long as the manager.
            .map(|family| FamilyInfo::of(unsafe { family.as_ref() }))
    }

    /// Allocates zeroed memory for `units` elements of the family called `name`.
    ///
    /// The returned pointer is aligned to the machine word.
    ///
    /// # Errors
    ///
    /// [`Error::ZeroUnits`], [`Error::UnknownFamily`] and [`Error::RequestTooLarge`]
    /// reject the request without side effects. [`Error::MapFailed`] if a new page is
    /// needed and cannot be mapped.
    pub fn allocate(&mut self, name: &str, units: usize) -> Result<NonNull<u8>> {
        if units == 0 {
            return rejected(Error::ZeroUnits {
                name: name.to_string(),
            });
        }

        let Some(family) = self.registry.lookup(name) else {
            return rejected(Error::UnknownFamily {
                name: name.to_string(),
            });
        };

        let max = self.max_allocation();
        // SAFETY: registered families live as long as the manager.
        let element_size = unsafe { family.as_ref().element_size };
        let size = match units.checked_mul(element_size) {
            Some(size) if size <= max => size,
            _ => {
                return rejected(Error::RequestTooLarge {
                    name: name.to_string(),
                    units,
                    element_size,
                    max,
                });
            }
        };

        // SAFETY: `family` is the descriptor slot in the registry, which never moves, and
        // no reference to it outlives this call while we hold `&mut self`.
        unsafe { PageFamily::allocate(family, &mut self.kernel, size) }
    }

    /// Returns memory obtained from [`allocate`](Self::allocate).
    ///
    /// The pointer is checked before anything is read through it, so passing a pointer
    /// this manager did not hand out, or one that was already freed, is reported rather
    /// than corrupting the manager.
    ///
    /// # Errors
    ///
    /// [`Error::ForeignPointer`] if `ptr` is not the start of a block of a live page,
    /// [`Error::DoubleFree`] if the block is already free. No state changes in either
    /// case.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;

        let Some(base) = self.kernel.vm_page_containing(addr) else {
            return rejected(Error::ForeignPointer { addr });
        };
        let page = base.cast::<Node<VmPage>>();

        // SAFETY: `base` is a live VM page, so it starts with a page header.
        let vm_page = unsafe { &page.as_ref().data };

        let Some(block) = vm_page.find_block(addr - base.as_ptr() as usize) else {
            return rejected(Error::ForeignPointer { addr });
        };

        // SAFETY: `block` is part of the page's chain.
        if unsafe { block.as_ref().data.is_free } {
            return rejected(Error::DoubleFree { addr });
        }

        let mut family = vm_page.family;

        // SAFETY: the page belongs to `family` and `block` is one of its allocated blocks.
        unsafe { family.as_mut().free(&mut self.kernel, page, block) };

        log::trace!("freed {ptr:p}");

        Ok(())
    }

    /// Describes the registry: page geometry and the families per descriptor page.
    pub fn list_families(&self) -> RegistryReport {
        RegistryReport {
            page_size: self.page_size(),
            families_per_page: self.registry.families_per_page(),
            descriptor_pages: self
                .registry
                .pages()
                .map(|families| {
                    families
                        // SAFETY: registered families live as long as the manager.
                        .map(|family| FamilyInfo::of(unsafe { family.as_ref() }))
                        .collect()
                })
                .collect(),
        }
    }

    /// Describes the pages and blocks of the family called `name`, or of every family.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownFamily`] if `name` is not registered.
    pub fn dump_usage(&self, name: Option<&str>) -> Result<UsageReport> {
        let families = match name {
            Some(name) => match self.registry.lookup(name) {
                // SAFETY: registered families live as long as the manager.
                Some(family) => vec![FamilyUsage::of(unsafe { family.as_ref() })],
                None => {
                    return rejected(Error::UnknownFamily {
                        name: name.to_string(),
                    });
                }
            },
            None => self
                .registry
                .iter()
                // SAFETY: registered families live as long as the manager.
                .map(|family| FamilyUsage::of(unsafe { family.as_ref() }))
                .collect(),
        };

        Ok(UsageReport { families })
    }

    /// Number of live allocations over all families.
    fn allocated_blocks(&self) -> usize {
        self.registry
            .iter()
            // SAFETY: registered families live as long as the manager.
            .map(|family| unsafe { family.as_ref() }.allocated_blocks())
            .sum()
    }
}

/// Logs a rejected request and hands the error back.
fn rejected<T>(error: Error) -> Result<T> {
    log::warn!("{error}");
    Err(error)
}

impl<S: PageSource> fmt::Debug for MemoryManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("page_size", &self.page_size())
            .field("families", &self.registry.iter().count())
            .field("descriptor_pages", &self.registry.descriptor_pages())
            .field("vm_pages", &self.kernel.vm_page_count())
            .field("drop_policy", &self.drop_policy)
            .finish()
    }
}

impl<S: PageSource> Drop for MemoryManager<S> {
    fn drop(&mut self) {
        let live = self.allocated_blocks();

        for mut family in self.registry.iter() {
            // SAFETY: the manager is going away, so are the pointers it handed out.
            unsafe { family.as_mut().release_pages(&mut self.kernel) };
        }

        // SAFETY: nothing refers to the families any more.
        unsafe { self.registry.release(&self.kernel) };

        debug_assert_eq!(self.kernel.vm_page_count(), 0);

        if live > 0 {
            log::debug!("memory manager dropped with {live} live allocation(s)");

            if !thread::panicking()
                && matches!(self.drop_policy, DropPolicy::MustNotDropAllocations)
            {
                panic!(
                    "dropped a MemoryManager with {live} live allocation(s), \
                     which DropPolicy::MustNotDropAllocations forbids"
                );
            }
        }
    }
}

// SAFETY: the manager exclusively owns every page it points into; moving it to another
// thread moves all of that memory along. The page source goes with it, hence the bound.
unsafe impl<S: PageSource + Send> Send for MemoryManager<S> {}
