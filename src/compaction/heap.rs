//! Binary min-heap with stable handles and position tracking.
//!
//! Items live in slots that never move; the heap array holds slot numbers.
//! Every item records its current heap position, so an item whose ordering key
//! changed can be fixed in place, and any item can be removed, in O(log n).

/// Ordering and position bookkeeping required from heap items.
pub(crate) trait HeapItem {
    /// Strict ordering; the heap root is the item no other item is less than.
    fn less(&self, other: &Self) -> bool;
    /// Record the item's position in the heap array.
    fn set_index(&mut self, index: usize);
    /// Position last recorded by [`HeapItem::set_index`].
    fn index(&self) -> usize;
}

/// Stable reference to an item for as long as it stays in the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Handle(usize);

#[derive(Debug)]
pub(crate) struct IndexedHeap<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    order: Vec<usize>,
}

impl<T> Default for IndexedHeap<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
        }
    }
}

impl<T: HeapItem> IndexedHeap<T> {
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<&T> {
        self.slots.get(handle.0).and_then(Option::as_ref)
    }

    /// Mutable access to an item. Callers changing ordering fields must call
    /// [`IndexedHeap::fix`] afterwards.
    pub(crate) fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots.get_mut(handle.0).and_then(Option::as_mut)
    }

    pub(crate) fn peek(&self) -> Option<&T> {
        self.order.first().and_then(|slot| self.slots[*slot].as_ref())
    }

    pub(crate) fn peek_handle(&self) -> Option<Handle> {
        self.order.first().map(|slot| Handle(*slot))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.order.iter().filter_map(|slot| self.slots[*slot].as_ref())
    }

    /// Insert an item, restoring heap order.
    pub(crate) fn push(&mut self, item: T) -> Handle {
        let handle = self.push_unordered(item);
        self.up(self.order.len() - 1);
        handle
    }

    /// Append an item without restoring heap order. Call
    /// [`IndexedHeap::rebuild`] once the bulk load is complete.
    pub(crate) fn push_unordered(&mut self, mut item: T) -> Handle {
        let position = self.order.len();
        item.set_index(position);
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(item);
                slot
            }
            None => {
                self.slots.push(Some(item));
                self.slots.len() - 1
            }
        };
        self.order.push(slot);
        Handle(slot)
    }

    /// Remove and return the minimum item.
    #[cfg(test)]
    pub(crate) fn pop(&mut self) -> Option<T> {
        let handle = self.peek_handle()?;
        self.remove(handle)
    }

    /// Remove an arbitrary item.
    pub(crate) fn remove(&mut self, handle: Handle) -> Option<T> {
        let position = self.get(handle)?.index();
        let last = self.order.len() - 1;
        if position != last {
            self.swap(position, last);
        }
        self.order.pop();
        if position != last && !self.down(position, last) {
            self.up(position);
        }
        self.free.push(handle.0);
        self.slots[handle.0].take()
    }

    /// Restore heap order after the item's ordering key changed.
    pub(crate) fn fix(&mut self, handle: Handle) {
        let Some(position) = self.get(handle).map(HeapItem::index) else {
            return;
        };
        if !self.down(position, self.order.len()) {
            self.up(position);
        }
    }

    /// Establish heap order over all items.
    pub(crate) fn rebuild(&mut self) {
        let n = self.order.len();
        for position in 0..n {
            self.set_position(position);
        }
        for position in (0..n / 2).rev() {
            self.down(position, n);
        }
    }

    fn set_position(&mut self, position: usize) {
        let slot = self.order[position];
        if let Some(item) = self.slots[slot].as_mut() {
            item.set_index(position);
        }
    }

    fn less_at(&self, i: usize, j: usize) -> bool {
        match (
            self.slots[self.order[i]].as_ref(),
            self.slots[self.order[j]].as_ref(),
        ) {
            (Some(a), Some(b)) => a.less(b),
            _ => false,
        }
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.order.swap(i, j);
        self.set_position(i);
        self.set_position(j);
    }

    fn up(&mut self, mut j: usize) {
        while j > 0 {
            let parent = (j - 1) / 2;
            if !self.less_at(j, parent) {
                break;
            }
            self.swap(parent, j);
            j = parent;
        }
    }

    /// Sift down within `order[..n]`. Returns `true` if the item moved.
    fn down(&mut self, start: usize, n: usize) -> bool {
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < n && self.less_at(right, left) {
                child = right;
            }
            if !self.less_at(child, i) {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > start
    }
}
