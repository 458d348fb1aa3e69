use std::{mem, ptr::NonNull};

use crate::{
    Error, Result,
    family::{FamilyName, PageFamily},
    kernel::{Kernel, PageSource},
    list::{List, Node},
};

/// Header of a page holding family descriptors. The descriptors follow it as a plain
/// array, of which the first `len` slots are in use.
///
/// ```text
/// +----------------------+-------------+-------------+-----+-------------+
/// | Node<DescriptorPage> | PageFamily  | PageFamily  | ... |  (unused)   |
/// +----------------------+-------------+-------------+-----+-------------+
/// ```
#[derive(Debug)]
pub(crate) struct DescriptorPage {
    len: usize,
}

const DESCRIPTOR_HEADER_SIZE: usize = mem::size_of::<Node<DescriptorPage>>();

const _: () = assert!(DESCRIPTOR_HEADER_SIZE % mem::align_of::<PageFamily>() == 0);

/// All registered families. The registry keeps its descriptors in whole pages from the
/// page source; a new descriptor page is put in front once the current one is full.
#[derive(Debug)]
pub(crate) struct Registry {
    pages: List<DescriptorPage>,
    families_per_page: usize,
}

impl Registry {
    pub(crate) const fn new(page_size: usize) -> Self {
        Self {
            pages: List::new(),
            families_per_page: (page_size - DESCRIPTOR_HEADER_SIZE) / mem::size_of::<PageFamily>(),
        }
    }

    #[inline]
    pub(crate) fn families_per_page(&self) -> usize {
        self.families_per_page
    }

    /// First descriptor slot of `page`.
    fn slots(page: NonNull<Node<DescriptorPage>>) -> NonNull<PageFamily> {
        // SAFETY: the slots start right after the header, inside the same page.
        unsafe { page.cast::<u8>().add(DESCRIPTOR_HEADER_SIZE).cast() }
    }

    /// Populated descriptors of `page`, in registration order.
    fn families_in(
        page: NonNull<Node<DescriptorPage>>,
    ) -> impl Iterator<Item = NonNull<PageFamily>> {
        // SAFETY: descriptor pages in the list are live.
        let len = unsafe { page.as_ref().data.len };
        let first = Self::slots(page);

        // SAFETY: the first `len` slots are initialized.
        (0..len).map(move |index| unsafe { first.add(index) })
    }

    /// Every registered family, grouped by descriptor page, newest page first.
    pub(crate) fn pages(
        &self,
    ) -> impl Iterator<Item = impl Iterator<Item = NonNull<PageFamily>>> + '_ {
        self.pages.iter().map(Self::families_in)
    }

    /// Every registered family.
    pub(crate) fn iter(&self) -> impl Iterator<Item = NonNull<PageFamily>> + '_ {
        self.pages.iter().flat_map(Self::families_in)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<NonNull<PageFamily>> {
        self.iter()
            // SAFETY: registered families are live.
            .find(|family| unsafe { family.as_ref().name.matches(name) })
    }

    /// Adds a family. Size checks are up to the caller; the registry only guarantees
    /// that names are unique.
    pub(crate) fn register<S: PageSource>(
        &mut self,
        kernel: &Kernel<S>,
        name: FamilyName,
        element_size: usize,
    ) -> Result<NonNull<PageFamily>> {
        if self.lookup(name.as_str()).is_some() {
            return Err(Error::DuplicateFamily {
                name: name.as_str().to_string(),
            });
        }

        let mut page = match self.pages.first() {
            // SAFETY: descriptor pages in the list are live.
            Some(page) if unsafe { page.as_ref().data.len } < self.families_per_page => page,
            _ => {
                let addr = kernel.request_memory(1)?;

                // SAFETY: a fresh page has room for the header.
                let page = unsafe { self.pages.push_front(DescriptorPage { len: 0 }, addr) };

                log::debug!(
                    "descriptor page {} at {addr:p}, room for {} families",
                    self.pages.len(),
                    self.families_per_page
                );

                page
            }
        };

        // SAFETY: slot `len` is below `families_per_page`, so it lies inside the page.
        let family = unsafe {
            let len = page.as_ref().data.len;
            let family = Self::slots(page).add(len);
            family.write(PageFamily::new(name, element_size));
            page.as_mut().data.len = len + 1;
            family
        };

        Ok(family)
    }

    /// Number of descriptor pages in use.
    pub(crate) fn descriptor_pages(&self) -> usize {
        self.pages.len()
    }

    /// Drops every family and returns the descriptor pages. Family pages must have been
    /// released already.
    ///
    /// # Safety
    ///
    /// No pointer to a family may be used afterwards.
    pub(crate) unsafe fn release<S: PageSource>(&mut self, kernel: &Kernel<S>) {
        while let Some(page) = self.pages.first() {
            // SAFETY: the descriptors are initialized and not referenced any more.
            unsafe {
                for family in Self::families_in(page) {
                    family.drop_in_place();
                }

                self.pages.remove(page);
                kernel.return_memory(page.cast(), 1);
            }
        }
    }
}
