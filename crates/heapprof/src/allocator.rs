use std::alloc::{GlobalAlloc, Layout, System};

use crate::{reentrancy::ReentrancyGuard, Profiler};

/// An implementation of [`GlobalAlloc`] that reports every allocation event to a [`Profiler`].
///
/// Memory is served by the wrapped allocator `A`. Events reach the profiler
/// only while it is attached, so installing the allocator costs little until
/// [`Profiler::start`] is called.
#[derive(Debug)]
pub struct ProfiledAlloc<A = System> {
    profiler: &'static Profiler,
    inner: A,
}

impl ProfiledAlloc<System> {
    pub const fn new(profiler: &'static Profiler) -> Self {
        Self::with_allocator(profiler, System)
    }
}

impl<A> ProfiledAlloc<A> {
    pub const fn with_allocator(profiler: &'static Profiler, inner: A) -> Self {
        Self { profiler, inner }
    }

    pub fn profiler(&self) -> &'static Profiler {
        self.profiler
    }
}

// Rust hosts hold no ambient execution lock, so every event asks the stack
// provider for its exclusive context.
unsafe impl<A: GlobalAlloc> GlobalAlloc for ProfiledAlloc<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);

        self.profiler
            .handle_allocate(ptr as usize, layout.size(), true);

        ptr
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc_zeroed(layout);

        self.profiler
            .handle_allocate(ptr as usize, layout.size(), true);

        ptr
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(ptr, layout, new_size);

        // On failure the old block is still live.
        if !new_ptr.is_null() {
            self.profiler
                .handle_reallocate(ptr as usize, new_ptr as usize, new_size, true);
        }

        new_ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Untrack before releasing, the address may be handed out again right away.
        {
            let guard = ReentrancyGuard::enter();

            if guard.is_top_level() {
                self.profiler.handle_free(ptr as usize);
            }
        }

        self.inner.dealloc(ptr, layout);
    }
}
