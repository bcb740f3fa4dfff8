use std::{cell::Cell, marker::PhantomData};

thread_local! {
    static IN_PROFILER: Cell<bool> = const { Cell::new(false) };
}

/// Reentrancy guard.
///
/// Only the outermost guard alive on a thread reports [`is_top_level`]; any guard
/// created while it lives is nested. Allocations made by the profiler itself
/// (hash table growth, trace capture, snapshot vectors) therefore reach the
/// allocator hook as nested calls and are passed through unrecorded.
///
/// The guard is bound to the thread that created it.
///
/// [`is_top_level`]: ReentrancyGuard::is_top_level
#[derive(Debug)]
pub struct ReentrancyGuard {
    top_level: bool,
    _not_send: PhantomData<*const ()>,
}

impl ReentrancyGuard {
    /// Enter the scope.
    ///
    /// If thread-local storage is already destroyed the guard is treated as nested.
    #[inline]
    pub fn enter() -> Self {
        let top_level = IN_PROFILER
            .try_with(|active| !active.replace(true))
            .unwrap_or(false);

        Self {
            top_level,
            _not_send: PhantomData,
        }
    }

    /// Return true if this guard is the first to enter the scope on this thread.
    #[inline]
    pub fn is_top_level(&self) -> bool {
        self.top_level
    }
}

impl Drop for ReentrancyGuard {
    #[inline]
    fn drop(&mut self) {
        if self.top_level {
            _ = IN_PROFILER.try_with(|active| active.set(false));
        }
    }
}
