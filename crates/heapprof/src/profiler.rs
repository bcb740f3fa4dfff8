use std::{
    mem::take,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    reentrancy::ReentrancyGuard, sampler::sample_current_thread, CallTraceInterner, Frame,
    HeapSnapshot, LiveAllocationTable, NoStackProvider, ProfilerConfig, ProfilerError, Result,
    StackTraceProvider,
};

/// An attached heap profiling engine.
///
/// Holds the live allocation table and the interned traces of one profiling
/// session. All methods are safe to call concurrently from any thread,
/// including from inside a global allocator.
pub struct HeapProfiler {
    config: ProfilerConfig,
    provider: Arc<dyn StackTraceProvider>,
    live: LiveAllocationTable,
    // Lock order: `traces` before the table's own lock.
    traces: Mutex<CallTraceInterner>,
}

impl std::fmt::Debug for HeapProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapProfiler")
            .field("config", &self.config)
            .field("live", &self.live)
            .finish_non_exhaustive()
    }
}

impl HeapProfiler {
    /// Create a new `HeapProfiler` whose traces are always empty.
    pub fn new(config: ProfilerConfig) -> Self {
        Self::with_provider(config, Arc::new(NoStackProvider))
    }

    /// Create a new `HeapProfiler` capturing traces from `provider`.
    pub fn with_provider(config: ProfilerConfig, provider: Arc<dyn StackTraceProvider>) -> Self {
        Self {
            config,
            provider,
            live: LiveAllocationTable::new(),
            traces: Mutex::new(CallTraceInterner::new()),
        }
    }

    /// Handle a new allocation of `size` bytes at `address`.
    ///
    /// Nested calls on the same thread, unsampled allocations and failed
    /// allocations (`address == 0`) are ignored. Set
    /// `requires_exclusive_context` when the caller does not already hold the
    /// provider's exclusive execution context.
    pub fn handle_allocate(&self, address: usize, size: usize, requires_exclusive_context: bool) {
        let guard = ReentrancyGuard::enter();

        if !guard.is_top_level() {
            return;
        }

        self.sample_and_record(address, size, requires_exclusive_context);
    }

    /// Handle a reallocation, modelled as a free of `old_address` followed by
    /// an allocation of `size` bytes at `new_address`.
    pub fn handle_reallocate(
        &self,
        old_address: usize,
        new_address: usize,
        size: usize,
        requires_exclusive_context: bool,
    ) {
        let guard = ReentrancyGuard::enter();

        if !guard.is_top_level() {
            return;
        }

        if old_address != 0 {
            self.handle_free(old_address);
        }

        self.sample_and_record(new_address, size, requires_exclusive_context);
    }

    /// Forget `address` if it is tracked.
    ///
    /// Not gated by sampling or the reentrancy guard, and never takes the
    /// exclusive execution context.
    #[inline]
    pub fn handle_free(&self, address: usize) {
        self.live.remove(address);
    }

    #[inline]
    fn sample_and_record(&self, address: usize, size: usize, requires_exclusive_context: bool) {
        if !sample_current_thread(self.config.sample_rate, size) {
            return;
        }

        if address == 0 {
            return;
        }

        self.record(address, size, requires_exclusive_context);
    }

    /// Records the given address and size in the live set, associated with the
    /// current stack trace.
    fn record(&self, address: usize, size: usize, requires_exclusive_context: bool) {
        let max_frames = self.config.max_frames;
        let mut frames = vec![];

        if max_frames > 0 {
            if requires_exclusive_context {
                self.provider.with_exclusive_context(&mut || {
                    frames = self.provider.capture_current_trace(max_frames);
                });
            } else {
                frames = self.provider.capture_current_trace(max_frames);
            }

            frames.truncate(max_frames);
        }

        let mut traces = self.lock_traces();

        let trace = traces.intern(&frames);

        self.live.insert(address, trace, size);

        drop(traces);
    }

    /// Addresses of every live sampled allocation.
    pub fn snapshot(&self) -> Vec<usize> {
        let _guard = ReentrancyGuard::enter();

        self.live.snapshot()
    }

    /// Trace recorded for `address`, innermost frame first.
    ///
    /// Empty if the address is not tracked or no frames were available when it
    /// was recorded.
    pub fn trace(&self, address: usize) -> Vec<Frame> {
        let _guard = ReentrancyGuard::enter();

        let traces = self.lock_traces();

        match self.live.find(address) {
            Some(pointer) => traces.trace(pointer.trace),
            None => vec![],
        }
    }

    /// Size recorded for `address`, 0 if untracked.
    pub fn size_of(&self, address: usize) -> usize {
        self.live
            .find(address)
            .map(|pointer| pointer.size)
            .unwrap_or_default()
    }

    /// Sum of the sizes of every live sampled allocation.
    pub fn total_memory_traced(&self) -> usize {
        self.live.total_bytes()
    }

    /// Largest value [`total_memory_traced`](Self::total_memory_traced) reached since the last reset.
    pub fn peak_memory_traced(&self) -> usize {
        self.live.peak_bytes()
    }

    pub fn max_frames(&self) -> usize {
        self.config.max_frames
    }

    pub fn sample_rate(&self) -> u64 {
        self.config.sample_rate
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Number of distinct trie nodes currently interned.
    pub fn interned_frames(&self) -> usize {
        let _guard = ReentrancyGuard::enter();

        self.lock_traces().len()
    }

    /// Estimated heap bytes held by the profiler itself.
    pub fn memory_usage(&self) -> usize {
        let _guard = ReentrancyGuard::enter();

        let traces = self.lock_traces();

        traces.memory_usage() + self.live.memory_usage()
    }

    /// Resolve every live allocation together with its trace.
    pub fn take_snapshot(&self) -> HeapSnapshot {
        let _guard = ReentrancyGuard::enter();

        let traces = self.lock_traces();

        HeapSnapshot::collect(&self.live, &traces, self.config.max_frames)
    }

    /// Clear live allocations, totals and interned traces. Configuration is kept.
    pub fn reset(&self) {
        let _guard = ReentrancyGuard::enter();

        let released = {
            let mut traces = self.lock_traces();
            self.live.reset();
            take(&mut *traces)
        };

        drop(released);
    }

    fn lock_traces(&self) -> MutexGuard<'_, CallTraceInterner> {
        match self.traces.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        }
    }
}

/// Process-wide profiler slot with start/stop semantics.
///
/// A `Profiler` is either detached (the initial state) or attached to one
/// [`HeapProfiler`]. Allocation events reaching a detached profiler are
/// dropped. Administrative calls fail with [`ProfilerError`] when misused,
/// while passive queries return empty or zero results.
///
/// Every event holds the read side of the slot, stack capture included, and
/// the spin lock gives writers no priority. While `start` or `stop` waits for
/// the write side, new events are dropped instead of queuing ahead of it, so
/// the switch only waits for the events already in flight.
///
/// `Profiler::new` is `const`, so a profiler can back a
/// [`ProfiledAlloc`](crate::ProfiledAlloc) from a `static`.
#[derive(Debug, Default)]
pub struct Profiler {
    engine: RwLock<Option<HeapProfiler>>,
    pending_writers: AtomicUsize,
}

impl Profiler {
    pub const fn new() -> Self {
        Self {
            engine: RwLock::new(None),
            pending_writers: AtomicUsize::new(0),
        }
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Option<HeapProfiler>> {
        self.pending_writers.fetch_add(1, Ordering::AcqRel);

        let slot = self.engine.write();

        self.pending_writers.fetch_sub(1, Ordering::AcqRel);

        slot
    }

    /// Read side for allocation events, `None` while a writer is waiting.
    #[inline]
    fn event_slot(&self) -> Option<RwLockReadGuard<'_, Option<HeapProfiler>>> {
        if self.pending_writers.load(Ordering::Acquire) != 0 {
            return None;
        }

        Some(self.engine.read())
    }

    /// Attach a new engine with traces from `provider`.
    pub fn start(
        &self,
        config: ProfilerConfig,
        provider: Arc<dyn StackTraceProvider>,
    ) -> Result<()> {
        let _guard = ReentrancyGuard::enter();

        if self.is_attached() {
            log::warn!("heap profiler start rejected, already running");
            return Err(ProfilerError::AlreadyRunning);
        }

        if let Err(err) = config.validate() {
            log::warn!("heap profiler start rejected, {}", err);
            return Err(err);
        }

        let engine = HeapProfiler::with_provider(config, provider);

        {
            let mut slot = self.write_slot();

            if slot.is_some() {
                drop(slot);
                log::warn!("heap profiler start rejected, already running");
                return Err(ProfilerError::AlreadyRunning);
            }

            *slot = Some(engine);
        }

        log::info!(
            "heap profiler started, max_frames={}, sample_rate={}",
            config.max_frames,
            config.sample_rate
        );

        Ok(())
    }

    /// Detach and destroy the engine. Does nothing while detached.
    pub fn stop(&self) {
        let _guard = ReentrancyGuard::enter();

        let detached = self.write_slot().take();

        if let Some(engine) = detached {
            log::info!(
                "heap profiler stopped, traced={}B, peak={}B",
                engine.total_memory_traced(),
                engine.peak_memory_traced()
            );

            drop(engine);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.engine.read().is_some()
    }

    /// Run `f` with the attached engine, or return `None` while detached.
    pub fn with_engine<R>(&self, f: impl FnOnce(&HeapProfiler) -> R) -> Option<R> {
        self.engine.read().as_ref().map(f)
    }

    /// Clear every trace collected so far while staying attached.
    pub fn reset(&self) -> Result<()> {
        let _guard = ReentrancyGuard::enter();

        self.with_engine(HeapProfiler::reset)
            .ok_or(ProfilerError::NotAttached)?;

        log::info!("heap profiler reset");

        Ok(())
    }

    #[inline]
    pub fn handle_allocate(&self, address: usize, size: usize, requires_exclusive_context: bool) {
        let Some(slot) = self.event_slot() else {
            return;
        };

        if let Some(engine) = slot.as_ref() {
            engine.handle_allocate(address, size, requires_exclusive_context);
        }
    }

    #[inline]
    pub fn handle_reallocate(
        &self,
        old_address: usize,
        new_address: usize,
        size: usize,
        requires_exclusive_context: bool,
    ) {
        let Some(slot) = self.event_slot() else {
            return;
        };

        if let Some(engine) = slot.as_ref() {
            engine.handle_reallocate(old_address, new_address, size, requires_exclusive_context);
        }
    }

    #[inline]
    pub fn handle_free(&self, address: usize) {
        let Some(slot) = self.event_slot() else {
            return;
        };

        if let Some(engine) = slot.as_ref() {
            engine.handle_free(address);
        }
    }

    /// Live sampled addresses, empty while detached.
    pub fn snapshot(&self) -> Vec<usize> {
        self.with_engine(HeapProfiler::snapshot)
            .unwrap_or_default()
    }

    /// Resolved snapshot of live allocations, empty while detached.
    pub fn take_snapshot(&self) -> HeapSnapshot {
        self.with_engine(HeapProfiler::take_snapshot)
            .unwrap_or_default()
    }

    /// Trace where `address` was allocated.
    pub fn trace(&self, address: usize) -> Result<Vec<Frame>> {
        self.with_engine(|engine| engine.trace(address))
            .ok_or(ProfilerError::NotAttached)
    }

    /// Recorded size of `address`, 0 while detached or if untracked.
    pub fn size_of(&self, address: usize) -> usize {
        self.with_engine(|engine| engine.size_of(address))
            .unwrap_or_default()
    }

    pub fn total_memory_traced(&self) -> usize {
        self.with_engine(HeapProfiler::total_memory_traced)
            .unwrap_or_default()
    }

    pub fn peak_memory_traced(&self) -> usize {
        self.with_engine(HeapProfiler::peak_memory_traced)
            .unwrap_or_default()
    }

    /// The `(current, peak)` traced bytes, `(0, 0)` while detached.
    pub fn traced_memory(&self) -> (usize, usize) {
        self.with_engine(|engine| (engine.total_memory_traced(), engine.peak_memory_traced()))
            .unwrap_or_default()
    }

    pub fn sample_rate(&self) -> Result<u64> {
        self.with_engine(HeapProfiler::sample_rate)
            .ok_or(ProfilerError::NotAttached)
    }

    /// Traceback limit of the attached engine; 1 while detached.
    pub fn max_frames(&self) -> usize {
        self.with_engine(HeapProfiler::max_frames).unwrap_or(1)
    }

    /// Estimated bytes used by the profiler itself, 0 while detached.
    pub fn memory_usage(&self) -> usize {
        self.with_engine(HeapProfiler::memory_usage)
            .unwrap_or_default()
    }
}
