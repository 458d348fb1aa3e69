use std::{marker::PhantomData, ptr::NonNull};

/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

/// A list node. The `data` is the actual header (page, block, descriptor page)
/// and the links chain it to its neighbours.
#[derive(Debug)]
pub(crate) struct Node<T> {
    /// Pointer to the next node of the list
    pub next: Link<Self>,
    /// Pointer to the previous node of the list
    pub prev: Link<Self>,
    /// Element of the node
    pub data: T,
}

/// Intrusive doubly linked list.
///
/// Because we are the memory manager, the list can not make allocations itself.
/// Every node is written at an address handed in by the caller, which is always
/// somewhere inside a page we mapped:
///
/// ```text
/// +------------------------------------------------------------+
/// | Node<VmPage> | Node<Block> | payload | Node<Block> | payload |
/// +------------------------------------------------------------+
///                      |                      ^
///                      +------- next ---------+
/// ```
///
/// The list never reads or frees the memory of a removed node; whoever owns the
/// page decides what happens to those bytes.
#[derive(Debug)]
pub(crate) struct List<T> {
    head: Link<Node<T>>,
    tail: Link<Node<T>>,
    len: usize,
    marker: PhantomData<T>,
}

/// Iterator over the nodes of a [`List`], front to back.
pub(crate) struct Iter<'a, T> {
    current: Link<Node<T>>,
    remaining: usize,
    marker: PhantomData<&'a T>,
}

impl<T> List<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<Node<T>> {
        self.head
    }

    /// Writes a new node holding `data` at `addr` and makes it the head of the list.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for writes of a `Node<T>`, properly aligned, and must not
    /// overlap any other live node.
    pub unsafe fn push_front(&mut self, data: T, addr: NonNull<u8>) -> NonNull<Node<T>> {
        let node = addr.cast::<Node<T>>();

        // SAFETY: the caller guarantees `addr` is valid for a `Node<T>` and every linked
        // node is valid by the list invariant.
        unsafe {
            node.as_ptr().write(Node {
                next: self.head,
                prev: None,
                data,
            });

            match self.head {
                Some(mut head) => head.as_mut().prev = Some(node),
                None => self.tail = Some(node),
            }
        }

        self.head = Some(node);
        self.len += 1;

        node
    }

    /// Writes a new node holding `data` at `addr` and links it right after `anchor`.
    ///
    /// # Safety
    ///
    /// `anchor` must be a node of this list. `addr` must satisfy the same requirements
    /// as in [`List::push_front`].
    pub unsafe fn insert_after(
        &mut self,
        mut anchor: NonNull<Node<T>>,
        data: T,
        addr: NonNull<u8>,
    ) -> NonNull<Node<T>> {
        let node = addr.cast::<Node<T>>();

        // SAFETY: `anchor` belongs to this list, `addr` is valid per the caller.
        unsafe {
            let next = anchor.as_ref().next;

            node.as_ptr().write(Node {
                next,
                prev: Some(anchor),
                data,
            });

            anchor.as_mut().next = Some(node);

            match next {
                Some(mut next) => next.as_mut().prev = Some(node),
                None => self.tail = Some(node),
            }
        }

        self.len += 1;

        node
    }

    /// Unlinks `node`, fixing up its neighbours and the head/tail of the list.
    ///
    /// # Safety
    ///
    /// `node` must be a node of this list.
    pub unsafe fn remove(&mut self, node: NonNull<Node<T>>) {
        // SAFETY: `node` and its neighbours are live nodes of this list.
        unsafe {
            let next = node.as_ref().next;
            let prev = node.as_ref().prev;

            match prev {
                Some(mut prev) => prev.as_mut().next = next,
                None => self.head = next,
            }

            match next {
                Some(mut next) => next.as_mut().prev = prev,
                None => self.tail = prev,
            }
        }

        self.len -= 1;
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl<T> Iterator for Iter<'_, T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        // SAFETY: every node reachable from the head is live by the list invariant.
        self.current = unsafe { node.as_ref().next };
        self.remaining -= 1;

        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> IntoIterator for &'a List<T> {
    type Item = NonNull<Node<T>>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::mem::MaybeUninit;

    use super::*;

    fn slots<const N: usize>(storage: &mut [MaybeUninit<Node<u32>>; N]) -> [NonNull<u8>; N] {
        let base = storage.as_mut_ptr();
        std::array::from_fn(|index| {
            NonNull::new(unsafe { base.add(index) }.cast()).expect("array slots are non-null")
        })
    }

    fn values(list: &List<u32>) -> Vec<u32> {
        list.iter()
            .map(|node| unsafe { node.as_ref().data })
            .collect()
    }

    fn backwards(list: &List<u32>) -> Vec<u32> {
        let mut values = Vec::new();
        let mut current = list.tail;
        while let Some(node) = current {
            unsafe {
                values.push(node.as_ref().data);
                current = node.as_ref().prev;
            }
        }
        values
    }

    #[test]
    fn new_list_is_empty() {
        let list: List<u8> = List::new();

        assert_eq!(list.len(), 0);
        assert!(list.first().is_none());
        assert!(list.iter().next().is_none());
    }

    #[test]
    fn push_front_prepends() {
        let mut storage = [const { MaybeUninit::<Node<u32>>::uninit() }; 3];
        let slots = slots(&mut storage);
        let mut list = List::new();

        unsafe {
            list.push_front(1, slots[0]);
            list.push_front(2, slots[1]);
            list.push_front(3, slots[2]);
        }

        assert_eq!(list.len(), 3);
        assert_eq!(values(&list), vec![3, 2, 1]);
        assert_eq!(backwards(&list), vec![1, 2, 3]);
    }

    #[test]
    fn insert_after_links_both_directions() {
        let mut storage = [const { MaybeUninit::<Node<u32>>::uninit() }; 4];
        let slots = slots(&mut storage);
        let mut list = List::new();

        unsafe {
            let first = list.push_front(1, slots[0]);
            let last = list.insert_after(first, 3, slots[1]);
            list.insert_after(first, 2, slots[2]);
            list.insert_after(last, 4, slots[3]);
        }

        assert_eq!(values(&list), vec![1, 2, 3, 4]);
        assert_eq!(backwards(&list), vec![4, 3, 2, 1]);
        assert_eq!(list.iter().size_hint(), (4, Some(4)));
    }

    #[test]
    fn remove_head_middle_and_tail() {
        let mut storage = [const { MaybeUninit::<Node<u32>>::uninit() }; 4];
        let slots = slots(&mut storage);
        let mut list = List::new();

        let nodes = unsafe {
            let a = list.push_front(1, slots[0]);
            let b = list.insert_after(a, 2, slots[1]);
            let c = list.insert_after(b, 3, slots[2]);
            let d = list.insert_after(c, 4, slots[3]);
            [a, b, c, d]
        };

        unsafe { list.remove(nodes[0]) };
        assert_eq!(values(&list), vec![2, 3, 4]);
        assert_eq!(backwards(&list), vec![4, 3, 2]);

        unsafe { list.remove(nodes[2]) };
        assert_eq!(values(&list), vec![2, 4]);
        assert_eq!(backwards(&list), vec![4, 2]);

        unsafe { list.remove(nodes[3]) };
        assert_eq!(values(&list), vec![2]);
        assert_eq!(backwards(&list), vec![2]);

        unsafe { list.remove(nodes[1]) };
        assert_eq!(list.len(), 0);
        assert!(list.first().is_none());
        assert!(list.tail.is_none());
    }
}
