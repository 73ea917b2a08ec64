//! Scoped release pool: a stack-discipline arena for transient objects
//! produced while callbacks run.
//!
//! `retain` transfers ownership of a handle into the pool; the handle is
//! destroyed when the pool is pumped or when its owning scope closes,
//! always in reverse-acquisition (LIFO) order. Scopes nest: release always
//! goes to the innermost open scope, and the borrow checker prevents a
//! handle from being pushed past a closed scope.

use std::any::Any;
use std::ops::{Deref, DerefMut};

/// A stack-discipline arena of pending-release handles.
#[derive(Default)]
pub struct ScopedPool {
    pending: Vec<Box<dyn Any>>,
    marks: Vec<usize>,
}

impl ScopedPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `value` until the next pump or scope exit.
    pub fn retain<T: Any>(&mut self, value: T) {
        self.pending.push(Box::new(value));
    }

    /// Number of handles currently awaiting release.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Releases every handle acquired in the innermost open scope, newest
    /// first.
    pub fn pump_pools(&mut self) {
        let floor = self.marks.last().copied().unwrap_or(0);
        let released = self.pending.len().saturating_sub(floor);
        while self.pending.len() > floor {
            drop(self.pending.pop());
        }
        if released > 0 {
            tracing::trace!(released, "released pooled handles");
        }
    }

    /// Opens a nested scope. Handles retained through the guard are
    /// released when the guard drops, before anything acquired earlier.
    pub fn scope(&mut self) -> PoolScope<'_> {
        let mark = self.pending.len();
        self.marks.push(mark);
        PoolScope { pool: self, mark }
    }

    fn release_to(&mut self, floor: usize) {
        while self.pending.len() > floor {
            drop(self.pending.pop());
        }
    }
}

impl Drop for ScopedPool {
    fn drop(&mut self) {
        // Release whatever remains, preserving LIFO order.
        self.release_to(0);
    }
}

/// Guard for a nested pool scope.
pub struct PoolScope<'a> {
    pool: &'a mut ScopedPool,
    mark: usize,
}

impl Deref for PoolScope<'_> {
    type Target = ScopedPool;

    fn deref(&self) -> &ScopedPool {
        self.pool
    }
}

impl DerefMut for PoolScope<'_> {
    fn deref_mut(&mut self) -> &mut ScopedPool {
        self.pool
    }
}

impl Drop for PoolScope<'_> {
    fn drop(&mut self) {
        self.pool.release_to(self.mark);
        let closed = self.pool.marks.pop();
        debug_assert_eq!(closed, Some(self.mark));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records its label into the shared log when dropped.
    struct Tracked(Rc<RefCell<Vec<&'static str>>>, &'static str);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.borrow_mut().push(self.1);
        }
    }

    #[test]
    fn test_pump_releases_lifo() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut pool = ScopedPool::new();
        pool.retain(Tracked(log.clone(), "first"));
        pool.retain(Tracked(log.clone(), "second"));
        pool.retain(Tracked(log.clone(), "third"));

        pool.pump_pools();
        assert_eq!(*log.borrow(), vec!["third", "second", "first"]);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_drop_releases_remainder() {
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let mut pool = ScopedPool::new();
            pool.retain(Tracked(log.clone(), "a"));
            pool.retain(Tracked(log.clone(), "b"));
        }
        assert_eq!(*log.borrow(), vec!["b", "a"]);
    }

    #[test]
    fn test_nested_scope_releases_before_outer() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut pool = ScopedPool::new();
        pool.retain(Tracked(log.clone(), "outer"));
        {
            let mut scope = pool.scope();
            scope.retain(Tracked(log.clone(), "inner"));
            // Pumping inside the scope only drains the scope's handles.
            scope.pump_pools();
            assert_eq!(*log.borrow(), vec!["inner"]);
            scope.retain(Tracked(log.clone(), "inner2"));
        }
        assert_eq!(*log.borrow(), vec!["inner", "inner2"]);
        assert_eq!(pool.pending(), 1);

        pool.pump_pools();
        assert_eq!(*log.borrow(), vec!["inner", "inner2", "outer"]);
    }
}
