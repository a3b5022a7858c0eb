use core::ptr::NonNull;

/// An intrusive doubly linked list node.
///
/// The list head is an `Option<NonNull<Node>>` held by the owner, and no node
/// points back at it, so the owner can be moved freely while the list is populated.
///
/// # Safety:
/// Nodes live inside heap-managed memory and must not be moved while linked.
/// This data structure is not thread-safe, use mutexes/locks to mutually exclude data access.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct Node {
    pub next: Option<NonNull<Node>>,
    pub prev: Option<NonNull<Node>>,
}

impl Node {
    /// Link `node` into the list headed by `head` directly after `after`,
    /// or at the front of the list if `after` is `None`.
    #[inline]
    #[track_caller]
    pub unsafe fn link_after(
        head: &mut Option<NonNull<Node>>,
        after: Option<NonNull<Node>>,
        node: NonNull<Node>,
    ) {
        let next = match after {
            Some(after) => (*after.as_ptr()).next,
            None => *head,
        };

        node.as_ptr().write(Node { next, prev: after });

        match after {
            Some(after) => (*after.as_ptr()).next = Some(node),
            None => *head = Some(node),
        }

        if let Some(next) = next {
            (*next.as_ptr()).prev = Some(node);
        }
    }

    /// Link `node` in at the front of the list headed by `head`.
    #[inline]
    pub unsafe fn push_front(head: &mut Option<NonNull<Node>>, node: NonNull<Node>) {
        Self::link_after(head, None, node);
    }

    /// Remove `node` from the list headed by `head`.
    #[inline]
    #[track_caller]
    pub unsafe fn unlink(head: &mut Option<NonNull<Node>>, node: NonNull<Node>) {
        let Node { next, prev } = node.as_ptr().read();

        match prev {
            Some(prev) => (*prev.as_ptr()).next = next,
            None => {
                debug_assert!(*head == Some(node));
                *head = next;
            }
        }

        if let Some(next) = next {
            (*next.as_ptr()).prev = prev;
        }
    }

    /// Creates an iterator over the linked list from the specified node.
    ///
    /// The current node may be unlinked while iterating, as the successor
    /// is read before the node is yielded.
    #[inline]
    pub unsafe fn iter(first: Option<NonNull<Self>>) -> Iter {
        Iter(first)
    }
}

/// An iterator over a linked list of [`Node`]s.
///
/// This `struct` is created by `Node::iter`. See its documentation for more.
#[derive(Debug)]
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub(crate) struct Iter(Option<NonNull<Node>>);

impl Iterator for Iter {
    type Item = NonNull<Node>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let current = self.0?;
        self.0 = unsafe { (*current.as_ptr()).next };
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use core::mem::MaybeUninit;

    use super::*;

    fn new_node() -> NonNull<Node> {
        NonNull::new(Box::into_raw(Box::new(MaybeUninit::<Node>::uninit())).cast::<Node>()).unwrap()
    }

    fn collect(head: Option<NonNull<Node>>) -> Vec<NonNull<Node>> {
        unsafe { Node::iter(head).collect() }
    }

    #[test]
    fn test_node() {
        unsafe {
            let x = new_node();
            let y = new_node();
            let z = new_node();

            let mut head = None;
            Node::push_front(&mut head, y);
            Node::push_front(&mut head, x);
            Node::link_after(&mut head, Some(y), z);
            assert_eq!(collect(head), [x, y, z]);
            assert_eq!((*z.as_ptr()).prev, Some(y));

            Node::unlink(&mut head, y);
            assert_eq!(collect(head), [x, z]);
            assert_eq!((*z.as_ptr()).prev, Some(x));

            Node::unlink(&mut head, x);
            assert_eq!(head, Some(z));
            assert_eq!((*z.as_ptr()).prev, None);

            Node::link_after(&mut head, None, y);
            assert_eq!(collect(head), [y, z]);

            Node::unlink(&mut head, z);
            Node::unlink(&mut head, y);
            assert!(head.is_none());

            for n in [x, y, z] {
                drop(Box::from_raw(n.as_ptr().cast::<MaybeUninit<Node>>()));
            }
        }
    }
}
