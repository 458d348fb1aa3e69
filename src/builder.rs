use crate::{DropPolicy, MemoryManager, OsPages, PageSource, Result};

/// Builder for creating an instance of [`MemoryManager`].
///
/// All settings are optional: by default the manager maps its pages from the operating
/// system and may be dropped with live allocations.
///
/// # Examples
///
/// Deterministic page geometry, independent of the platform:
///
/// ```
/// use slabmm::{HeapPages, MemoryManager};
///
/// let manager = MemoryManager::builder()
///     .page_source(HeapPages::new(4096))
///     .build()
///     .unwrap();
///
/// assert_eq!(manager.page_size(), 4096);
/// ```
#[derive(Debug)]
#[must_use]
pub struct MemoryManagerBuilder<S = OsPages> {
    source: S,
    drop_policy: DropPolicy,
}

impl MemoryManagerBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            source: OsPages::new(),
            drop_policy: DropPolicy::default(),
        }
    }
}

impl<S: PageSource> MemoryManagerBuilder<S> {
    /// Sets where the manager gets its pages from.
    #[inline]
    pub fn page_source<T: PageSource>(self, source: T) -> MemoryManagerBuilder<T> {
        MemoryManagerBuilder {
            source,
            drop_policy: self.drop_policy,
        }
    }

    /// Sets the [drop policy][DropPolicy] for the manager. This governs how to treat
    /// live allocations when the manager is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use slabmm::{DropPolicy, MemoryManager};
    ///
    /// let manager = MemoryManager::builder()
    ///     .drop_policy(DropPolicy::MayDropAllocations)
    ///     .build()
    ///     .unwrap();
    /// ```
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the memory manager with the specified configuration.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPageSize`][crate::Error::InvalidPageSize] if the page source
    /// reports a page size that is not a power of two of at least
    /// [`MIN_PAGE_SIZE`][crate::MIN_PAGE_SIZE] bytes.
    pub fn build(self) -> Result<MemoryManager<S>> {
        MemoryManager::new_inner(self.source, self.drop_policy)
    }
}
