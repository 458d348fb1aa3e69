/// Determines what happens to live allocations when the memory manager is dropped.
///
/// Either way every page goes back to the page source; the policy only decides whether
/// that is allowed to happen while allocations are still in use.
///
/// # Examples
///
/// ```
/// use slabmm::{DropPolicy, MemoryManager};
///
/// let manager = MemoryManager::builder()
///     .drop_policy(DropPolicy::MustNotDropAllocations)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// Live allocations are silently invalidated when the manager is dropped. This is
    /// the default.
    #[default]
    MayDropAllocations,

    /// The manager panics on drop if allocations are still live, after returning its
    /// memory.
    ///
    /// Useful when pointers handed out by the manager are kept in places the compiler
    /// cannot see, so that forgetting to free them is caught early.
    MustNotDropAllocations,
}
