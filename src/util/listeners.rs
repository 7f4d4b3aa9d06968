use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::warn;

/// An ordered list of listeners that is modified rarely and iterated often. Notification works
///  on a snapshot, so listeners may (de)register listeners while being notified.
pub struct Listeners<L: ?Sized> {
    list: ArcSwap<Vec<Arc<L>>>,
}

impl <L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Listeners {
            list: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl <L: ?Sized> Listeners<L> {
    pub fn add(&self, listener: Arc<L>) {
        self.list.rcu(|current| {
            let mut new_list = Vec::clone(current);
            new_list.push(listener.clone());
            new_list
        });
    }

    /// Removes a listener by identity, returning `false` if it was not registered
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut removed = false;
        self.list.rcu(|current| {
            let mut new_list = Vec::clone(current);
            let len_before = new_list.len();
            new_list.retain(|l| !Arc::ptr_eq(l, listener));
            removed = new_list.len() != len_before;
            new_list
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.list.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.load().is_empty()
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        self.list.load_full()
    }

    /// Calls `f` for every listener in registration order. A panicking listener is logged and
    ///  does not affect the others.
    pub fn notify(&self, f: impl Fn(&L)) {
        for listener in self.snapshot().iter() {
            if catch_unwind(AssertUnwindSafe(|| f(listener))).is_err() {
                warn!("listener panicked - continuing with the remaining listeners");
            }
        }
    }
}
