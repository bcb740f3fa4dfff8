use std::{
    cell::Cell,
    ffi::{c_void, OsStr},
    fmt,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};

/// One captured call frame. Innermost frames come first in a trace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Frame {
    /// Name of the executing function.
    pub function: Arc<str>,
    /// File in which the function is defined.
    pub filename: Arc<str>,
    /// Line on which the function definition starts.
    pub first_line: u32,
    /// Line executing when the trace was captured.
    pub line: u32,
}

impl Frame {
    pub fn new(
        function: impl Into<Arc<str>>,
        filename: impl Into<Arc<str>>,
        first_line: u32,
        line: u32,
    ) -> Self {
        Self {
            function: function.into(),
            filename: filename.into(),
            first_line,
            line,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} in {}", self.filename, self.line, self.function)
    }
}

/// Host facility that walks the current thread's stack.
pub trait StackTraceProvider: Send + Sync {
    /// Capture at most `max_frames` frames of the calling thread, innermost first.
    ///
    /// Returns an empty trace when the thread has no stack the provider can read.
    fn capture_current_trace(&self, max_frames: usize) -> Vec<Frame>;

    /// Run `f` while holding the host's exclusive execution context.
    ///
    /// Hosts that need no such lock keep the default, which just calls `f`.
    fn with_exclusive_context(&self, f: &mut dyn FnMut()) {
        f()
    }
}

/// Provider for threads without any readable stack: every capture is empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStackProvider;

impl StackTraceProvider for NoStackProvider {
    fn capture_current_trace(&self, _max_frames: usize) -> Vec<Frame> {
        vec![]
    }
}

/// Frames belonging to the capture machinery itself.
const DEFAULT_SKIP_FRAMES: usize = 4;

/// Native stack provider built on [`backtrace`].
///
/// The unsynchronized `backtrace` api is used because the synchronized one is
/// not safe to call from inside a [`GlobalAlloc`](std::alloc::GlobalAlloc). The
/// exclusive execution context is a process-wide backtrace lock instead.
#[derive(Debug, Clone, Copy)]
pub struct BacktraceProvider {
    skip_frames: usize,
}

impl Default for BacktraceProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl BacktraceProvider {
    pub const fn new() -> Self {
        Self {
            skip_frames: DEFAULT_SKIP_FRAMES,
        }
    }

    /// Override the number of innermost frames dropped from every capture.
    pub const fn with_skip_frames(skip_frames: usize) -> Self {
        Self { skip_frames }
    }
}

impl StackTraceProvider for BacktraceProvider {
    fn capture_current_trace(&self, max_frames: usize) -> Vec<Frame> {
        if max_frames == 0 {
            return vec![];
        }

        if HOLDS_BACKTRACE_LOCK.with(Cell::get) {
            return capture_native_frames(self.skip_frames, max_frames);
        }

        let mut frames = vec![];

        self.with_exclusive_context(&mut || {
            frames = capture_native_frames(self.skip_frames, max_frames);
        });

        frames
    }

    fn with_exclusive_context(&self, f: &mut dyn FnMut()) {
        let _locker = backtrace_lock();

        f()
    }
}

thread_local! {
    static HOLDS_BACKTRACE_LOCK: Cell<bool> = const { Cell::new(false) };
}

/// Backtrace mod mutex guard.
struct BacktraceGuard {
    _locker: MutexGuard<'static, ()>,
}

/// Synchronize backtrace api calls and returns `locker` guard.
fn backtrace_lock() -> BacktraceGuard {
    static BACKTRACE_MUTEX: Mutex<()> = Mutex::new(());

    let locker = BACKTRACE_MUTEX
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    HOLDS_BACKTRACE_LOCK.with(|held| held.set(true));

    BacktraceGuard { _locker: locker }
}

impl Drop for BacktraceGuard {
    fn drop(&mut self) {
        HOLDS_BACKTRACE_LOCK.with(|held| held.set(false));
    }
}

/// Walk and resolve the native stack. The caller must hold the backtrace lock.
fn capture_native_frames(skip_frames: usize, max_frames: usize) -> Vec<Frame> {
    let mut addresses = Vec::with_capacity(max_frames);
    let mut skips = 0;

    unsafe {
        // Safety: serialized by `backtrace_lock`.
        backtrace::trace_unsynchronized(|frame| {
            if skips < skip_frames {
                skips += 1;
                return true;
            }

            addresses.push((frame.ip(), frame.symbol_address()));

            addresses.len() < max_frames
        });
    }

    addresses
        .into_iter()
        .map(|(ip, symbol_address)| resolve_frame(ip, symbol_address))
        .collect()
}

fn resolve_frame(ip: *mut c_void, symbol_address: *mut c_void) -> Frame {
    let mut function = None;
    let mut filename = None;
    let mut line = None;
    let mut first_line = None;

    unsafe {
        // Safety: serialized by `backtrace_lock`.
        backtrace::resolve_unsynchronized(ip, |symbol| {
            if function.is_none() {
                function = symbol.name().map(|name| name.to_string());
            }

            if filename.is_none() {
                filename = symbol.filename().and_then(path_to_string).map(str::to_string);
            }

            if line.is_none() {
                line = symbol.lineno();
            }
        });

        // The symbol start resolves to the line the function is defined on.
        backtrace::resolve_unsynchronized(symbol_address, |symbol| {
            if first_line.is_none() {
                first_line = symbol.lineno();
            }
        });
    }

    Frame::new(
        function.unwrap_or_else(|| "<unknown>".to_string()),
        filename.unwrap_or_else(|| "<native>".to_string()),
        first_line.unwrap_or_default(),
        line.unwrap_or_default(),
    )
}

fn path_to_string(path: &Path) -> Option<&str> {
    path.to_str()
        .or_else(|| path.file_name().and_then(OsStr::to_str))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_display_names_location() {
        let frame = Frame::new("main", "src/main.rs", 3, 7);

        assert_eq!(frame.to_string(), "src/main.rs:7 in main");
    }

    #[test]
    fn no_stack_provider_yields_nothing() {
        assert!(NoStackProvider.capture_current_trace(128).is_empty());
    }

    #[test]
    fn backtrace_provider_honors_max_frames() {
        let provider = BacktraceProvider::with_skip_frames(0);

        let frames = provider.capture_current_trace(3);
        assert!(!frames.is_empty());
        assert!(frames.len() <= 3);

        assert!(provider.capture_current_trace(0).is_empty());
    }

    #[test]
    fn backtrace_provider_captures_inside_exclusive_context() {
        let provider = BacktraceProvider::new();
        let mut frames = vec![];

        provider.with_exclusive_context(&mut || {
            frames = provider.capture_current_trace(8);
        });

        assert!(!frames.is_empty());
        assert!(!HOLDS_BACKTRACE_LOCK.with(Cell::get));
    }
}
