use std::{fmt, ptr::NonNull, str};

use crate::{
    Error, Result,
    block::{BLOCK_ALIGN, BlockRef, payload},
    freelist::FreeList,
    kernel::{Kernel, PageSource},
    list::List,
    page::{PageRef, VmPage},
    utils::align,
};

/// Longest family name, in bytes, the registry accepts.
pub const MAX_FAMILY_NAME_LEN: usize = 32;

/// A family name stored inline in its descriptor, so the registry needs no heap.
#[derive(Clone, Copy)]
pub(crate) struct FamilyName {
    bytes: [u8; MAX_FAMILY_NAME_LEN],
    len: usize,
}

impl FamilyName {
    pub(crate) fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::EmptyName);
        }

        if name.len() > MAX_FAMILY_NAME_LEN {
            return Err(Error::NameTooLong {
                name: name.to_string(),
                max: MAX_FAMILY_NAME_LEN,
            });
        }

        let mut bytes = [0; MAX_FAMILY_NAME_LEN];
        bytes[..name.len()].copy_from_slice(name.as_bytes());

        Ok(Self {
            bytes,
            len: name.len(),
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        // Always a whole `&str` copied in `new`.
        str::from_utf8(&self.bytes[..self.len]).unwrap_or_default()
    }

    pub(crate) fn matches(&self, name: &str) -> bool {
        &self.bytes[..self.len] == name.as_bytes()
    }
}

impl fmt::Debug for FamilyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

/// A registered type: every allocation of the family is a whole number of elements
/// served from pages that belong to this family alone.
///
/// ```text
///  PageFamily "emp_t"
///  +-----------+      +--------------------------+      +--------------------------+
///  | pages ----|----> | VmPage | Block | Free    | ---> | VmPage | Free  | Block   |
///  | free_list |      +--------------------------+      +--------------------------+
///  +-----------+                    ^                              ^
///        |                          |                              |
///        +--------------------------+------------------------------+
/// ```
///
/// Families live in descriptor pages owned by the registry and never move, so pages
/// can point back at their family.
#[derive(Debug)]
pub(crate) struct PageFamily {
    pub name: FamilyName,
    pub element_size: usize,
    /// Pages of the family, most recently created first.
    pub pages: List<VmPage>,
    /// Free blocks of all pages, largest first.
    pub free_list: FreeList,
}

impl PageFamily {
    pub(crate) const fn new(name: FamilyName, element_size: usize) -> Self {
        Self {
            name,
            element_size,
            pages: List::new(),
            free_list: FreeList::new(),
        }
    }

    /// Allocates `size` zeroed bytes from the family at `this`. The caller has already
    /// checked that `size` fits in one page.
    ///
    /// If the largest free block is too small a new page is mapped, even if that
    /// leaves smaller free blocks of the family untouched.
    ///
    /// # Safety
    ///
    /// `this` must be the address the family lives at for as long as it has pages, and
    /// no reference to the family may be alive during the call. New pages store `this`
    /// to find their way back.
    pub(crate) unsafe fn allocate<S: PageSource>(
        this: NonNull<Self>,
        kernel: &mut Kernel<S>,
        size: usize,
    ) -> Result<NonNull<u8>> {
        let size = align(size, BLOCK_ALIGN);

        // SAFETY: the family is live and not borrowed elsewhere, per the caller.
        let found = unsafe { this.as_ref().free_list.find_free_block(size) };

        let block = match found {
            Some(block) => block,
            // SAFETY: forwarded from the caller.
            None => unsafe { Self::add_page(this, kernel)? },
        };

        // SAFETY: `block` is a free block of one of our pages, with room for `size`.
        unsafe {
            let family = &mut *this.as_ptr();

            let mut page = VmPage::of(block);
            page.as_mut()
                .data
                .split_for_allocation(block, size, &mut family.free_list);

            let ptr = payload(block);
            ptr.as_ptr().write_bytes(0, size);

            log::trace!("{:?}: allocated {size} byte(s) at {ptr:p}", family.name);

            Ok(ptr)
        }
    }

    /// Maps a new page for the family at `this` and returns its single free block,
    /// which is already in the free list.
    ///
    /// # Safety
    ///
    /// Same as [`PageFamily::allocate`].
    unsafe fn add_page<S: PageSource>(
        this: NonNull<Self>,
        kernel: &mut Kernel<S>,
    ) -> Result<BlockRef> {
        let base = kernel.map_vm_page()?;

        // SAFETY: `base` is a fresh, page aligned page of `page_size` bytes. The page
        // keeps `this` itself, never a pointer derived from the reference below.
        unsafe {
            let family = &mut *this.as_ptr();

            let block = VmPage::create(&mut family.pages, this, base, kernel.page_size());
            family.free_list.insert(block);

            log::debug!(
                "{:?}: new page at {base:p}, {} page(s) in use",
                family.name,
                family.pages.len()
            );

            Ok(block)
        }
    }

    /// Frees the allocated `block` of `page`. If that leaves the page empty, the page
    /// goes back to the page source.
    ///
    /// # Safety
    ///
    /// `page` must be a page of this family and `block` an allocated block of it.
    pub(crate) unsafe fn free<S: PageSource>(
        &mut self,
        kernel: &mut Kernel<S>,
        mut page: PageRef,
        block: BlockRef,
    ) {
        // SAFETY: forwarded from the caller.
        let (survivor, empty) = unsafe {
            let vm_page = &mut page.as_mut().data;
            let survivor = vm_page.reclaim(block, &mut self.free_list);
            (survivor, vm_page.is_empty())
        };

        if empty {
            // The survivor spans the whole page and disappears with it.
            // SAFETY: the page is empty, nothing points into it any more.
            unsafe { self.delete_page(kernel, page) };
        } else {
            // SAFETY: the survivor is a free block of a live page.
            unsafe { self.free_list.insert(survivor) };
        }
    }

    /// Unlinks `page` from the family and unmaps it.
    ///
    /// # Safety
    ///
    /// `page` must be a page of this family whose blocks are not in the free list.
    unsafe fn delete_page<S: PageSource>(&mut self, kernel: &mut Kernel<S>, page: PageRef) {
        // SAFETY: forwarded from the caller.
        unsafe {
            self.pages.remove(page);
            kernel.unmap_vm_page(page.cast());
        }

        log::debug!(
            "{:?}: released page at {page:p}, {} page(s) in use",
            self.name,
            self.pages.len()
        );
    }

    /// Number of allocated blocks over all pages.
    pub(crate) fn allocated_blocks(&self) -> usize {
        self.pages
            .iter()
            // SAFETY: pages of the family are live.
            .map(|page| unsafe { page.as_ref().data.allocated_blocks() })
            .sum()
    }

    /// Unmaps every page of the family, allocated blocks included.
    ///
    /// # Safety
    ///
    /// Pointers into the family's pages must not be used afterwards.
    pub(crate) unsafe fn release_pages<S: PageSource>(&mut self, kernel: &mut Kernel<S>) {
        self.free_list = FreeList::new();

        while let Some(page) = self.pages.first() {
            // SAFETY: the free list no longer refers to any block, the caller gives up
            // the pointers.
            unsafe { self.delete_page(kernel, page) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::BLOCK_HEADER_SIZE,
        kernel::HeapPages,
        list::Node,
        page::PAGE_HEADER_SIZE,
    };

    const PAGE_SIZE: usize = 4096;
    const MAX: usize = PAGE_SIZE - PAGE_HEADER_SIZE - BLOCK_HEADER_SIZE;

    /// A family outside any registry, parked on the heap so its address is stable.
    struct TestFamily<S: PageSource> {
        kernel: Kernel<S>,
        family: NonNull<PageFamily>,
    }

    impl<S: PageSource> TestFamily<S> {
        fn new(source: S, element_size: usize) -> Self {
            let family = Box::new(PageFamily::new(
                FamilyName::new("test_t").unwrap(),
                element_size,
            ));

            Self {
                kernel: Kernel::new(source).unwrap(),
                family: NonNull::new(Box::into_raw(family)).unwrap(),
            }
        }

        fn family(&self) -> &PageFamily {
            unsafe { self.family.as_ref() }
        }

        fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
            unsafe { PageFamily::allocate(self.family, &mut self.kernel, size) }
        }

        /// Frees the allocation at `ptr` the way the manager does it, going through the
        /// family pointer stored in the page.
        fn free(&mut self, ptr: NonNull<u8>) {
            let page = self
                .kernel
                .vm_page_containing(ptr.as_ptr() as usize)
                .unwrap()
                .cast::<Node<VmPage>>();
            let offset = ptr.as_ptr() as usize - page.as_ptr() as usize;

            let (mut family, block) = unsafe {
                let vm_page = &page.as_ref().data;
                (vm_page.family, vm_page.find_block(offset).unwrap())
            };
            assert_eq!(family, self.family);

            unsafe { family.as_mut().free(&mut self.kernel, page, block) };
        }
    }

    impl<S: PageSource> Drop for TestFamily<S> {
        fn drop(&mut self) {
            unsafe {
                self.family.as_mut().release_pages(&mut self.kernel);
                drop(Box::from_raw(self.family.as_ptr()));
            }
        }
    }

    fn setup(element_size: usize) -> TestFamily<HeapPages> {
        TestFamily::new(HeapPages::new(PAGE_SIZE), element_size)
    }

    #[test]
    fn names_are_bounded() {
        assert!(matches!(FamilyName::new(""), Err(Error::EmptyName)));
        assert!(matches!(
            FamilyName::new(&"x".repeat(MAX_FAMILY_NAME_LEN + 1)),
            Err(Error::NameTooLong { max: MAX_FAMILY_NAME_LEN, .. })
        ));

        let longest = "y".repeat(MAX_FAMILY_NAME_LEN);
        let name = FamilyName::new(&longest).unwrap();
        assert_eq!(name.as_str(), longest);
        assert!(name.matches(&longest));
        assert!(!name.matches(&longest[1..]));
        assert_eq!(format!("{name:?}"), format!("{longest:?}"));
    }

    #[test]
    fn first_allocation_maps_a_page() {
        let mut test = setup(64);

        let ptr = test.allocate(64).unwrap();

        assert_eq!(test.kernel.vm_page_count(), 1);
        assert_eq!(test.family().pages.len(), 1);
        assert_eq!(test.family().allocated_blocks(), 1);
        assert_eq!(
            test.family().free_list.sizes().collect::<Vec<_>>(),
            vec![MAX - 64 - BLOCK_HEADER_SIZE]
        );
        assert_eq!(ptr.as_ptr() as usize % BLOCK_ALIGN, 0);

        test.free(ptr);

        assert_eq!(test.kernel.vm_page_count(), 0);
        assert_eq!(test.family().pages.len(), 0);
        assert_eq!(test.family().free_list.len(), 0);
    }

    #[test]
    fn pages_point_back_to_their_family() {
        let mut test = setup(16);

        // Several pages, each touched again after the family changed in between.
        let whole = test.allocate(MAX).unwrap();
        let small = test.allocate(16).unwrap();
        let other = test.allocate(MAX).unwrap();
        assert_eq!(test.family().pages.len(), 3);

        for page in &test.family().pages {
            assert_eq!(unsafe { page.as_ref().data.family }, test.family);
        }

        test.free(small);
        test.free(whole);
        test.free(other);
        assert_eq!(test.kernel.vm_page_count(), 0);
    }

    #[test]
    fn sizes_are_rounded_to_header_alignment() {
        let mut test = setup(3);

        let first = test.allocate(3).unwrap();
        let second = test.allocate(3).unwrap();

        let distance = second.as_ptr() as usize - first.as_ptr() as usize;
        assert_eq!(distance, align(3, BLOCK_ALIGN) + BLOCK_HEADER_SIZE);
    }

    #[test]
    fn full_page_forces_a_new_page() {
        let mut test = setup(8);

        let whole = test.allocate(MAX).unwrap();
        assert_eq!(test.family().free_list.len(), 0);

        let next = test.allocate(8).unwrap();
        assert_eq!(test.family().pages.len(), 2);
        assert_ne!(
            test.kernel.vm_page_containing(whole.as_ptr() as usize),
            test.kernel.vm_page_containing(next.as_ptr() as usize)
        );

        test.free(whole);
        assert_eq!(test.family().pages.len(), 1);
        assert_eq!(test.family().allocated_blocks(), 1);
    }

    #[test]
    fn reused_memory_is_zeroed() {
        let mut test = setup(16);

        let keep = test.allocate(16).unwrap();
        let ptr = test.allocate(64).unwrap();
        unsafe { ptr.as_ptr().write_bytes(0xAB, 64) };
        test.free(ptr);

        let again = test.allocate(64).unwrap();
        assert_eq!(again, ptr);
        let bytes = unsafe { std::slice::from_raw_parts(again.as_ptr(), 64) };
        assert!(bytes.iter().all(|byte| *byte == 0));

        test.free(again);
        test.free(keep);
        assert_eq!(test.kernel.vm_page_count(), 0);
    }

    #[test]
    fn failed_page_mapping_fails_the_allocation() {
        struct NoPages;

        // SAFETY: never hands out memory.
        unsafe impl PageSource for NoPages {
            fn page_size(&self) -> usize {
                PAGE_SIZE
            }

            fn acquire(&self, units: usize) -> Result<NonNull<u8>> {
                Err(Error::MapFailed {
                    units,
                    source: std::io::ErrorKind::OutOfMemory.into(),
                })
            }

            unsafe fn release(&self, _region: NonNull<u8>, _units: usize) -> Result<()> {
                unreachable!("nothing was acquired")
            }
        }

        let mut test = TestFamily::new(NoPages, 8);

        assert!(matches!(
            test.allocate(8),
            Err(Error::MapFailed { units: 1, .. })
        ));
        assert_eq!(test.family().pages.len(), 0);
        assert_eq!(test.family().free_list.len(), 0);
    }
}
