//! A sampling heap profiler core.
//!
//! Allocation events are sampled on a per-thread byte countdown, tagged with
//! the call stack captured at record time and kept in a live allocation table
//! until the matching free. Call stacks are interned in a prefix-sharing trie,
//! so the many traces sharing their callers cost one node per distinct frame.
//!
//! The below code enables heap profiling in rust programs.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hala_heapprof::{BacktraceProvider, ProfiledAlloc, Profiler, ProfilerConfig, StatisticKey};
//!
//! static PROFILER: Profiler = Profiler::new();
//!
//! #[global_allocator]
//! static ALLOC: ProfiledAlloc = ProfiledAlloc::new(&PROFILER);
//!
//! fn main() {
//!     let config = ProfilerConfig::default()
//!         .with_max_frames(32)
//!         .with_sample_rate(512 * 1024);
//!
//!     PROFILER
//!         .start(config, Arc::new(BacktraceProvider::new()))
//!         .unwrap();
//!
//!     // working...
//!
//!     let statistics = PROFILER
//!         .take_snapshot()
//!         .statistics(StatisticKey::Lineno, false)
//!         .unwrap();
//!
//!     for statistic in statistics.iter().take(10) {
//!         println!("{}", statistic);
//!     }
//!
//!     PROFILER.stop();
//! }
//! ```
//!
//! Hosts with their own allocator hooks and stack walkers drive a
//! [`Profiler`] directly through `handle_allocate`, `handle_reallocate` and
//! `handle_free`, and plug their stack walker in as a [`StackTraceProvider`].

#![cfg_attr(docsrs, feature(doc_cfg))]

mod allocator;
mod config;
mod error;
mod interner;
mod live;
mod profiler;
mod reentrancy;
mod report;
mod sampler;
mod stacktrace;

pub use allocator::*;
pub use config::*;
pub use error::*;
pub use interner::*;
pub use live::*;
pub use profiler::*;
pub use reentrancy::*;
pub use report::*;
pub use sampler::*;
pub use stacktrace::*;
