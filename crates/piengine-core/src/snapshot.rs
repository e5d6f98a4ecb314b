use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

/// Copy-on-write list for collections that are iterated while they change.
///
/// Every structural change swaps in a complete new `Vec`; readers take an
/// `Arc` to whichever version was current and iterate it undisturbed. Neither
/// side ever blocks the other.
pub struct SnapshotList<T> {
    items: ArcSwap<Vec<T>>,
}

impl<T> Default for SnapshotList<T> {
    fn default() -> Self {
        Self {
            items: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SnapshotList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.load().iter()).finish()
    }
}

impl<T> From<Vec<T>> for SnapshotList<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            items: ArcSwap::from_pointee(items),
        }
    }
}

impl<T: Clone> SnapshotList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.items.load_full()
    }

    pub fn len(&self) -> usize {
        self.items.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.load().is_empty()
    }

    pub fn push(&self, item: T) {
        self.items.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(item.clone());
            next
        });
    }

    /// Push unless an element matching `is_same` is already present.
    /// Returns whether the item was added.
    pub fn push_unique(&self, item: T, is_same: impl Fn(&T, &T) -> bool) -> bool {
        let mut added = false;
        self.items.rcu(|current| {
            added = !current.iter().any(|existing| is_same(existing, &item));
            let mut next = Vec::clone(current);
            if added {
                next.push(item.clone());
            }
            next
        });
        added
    }

    /// Remove every element matching `pred`, returning how many were removed.
    pub fn remove_where(&self, pred: impl Fn(&T) -> bool) -> usize {
        let mut removed = 0;
        self.items.rcu(|current| {
            let next: Vec<T> = current.iter().filter(|item| !pred(*item)).cloned().collect();
            removed = current.len() - next.len();
            next
        });
        removed
    }

    pub fn contains_where(&self, pred: impl Fn(&T) -> bool) -> bool {
        self.items.load().iter().any(pred)
    }

    /// Swap in an empty list, returning the last snapshot.
    pub fn clear(&self) -> Arc<Vec<T>> {
        self.items.swap(Arc::new(Vec::new()))
    }
}
