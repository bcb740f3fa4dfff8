use std::{fmt, sync::Arc};

use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{CallTraceInterner, Frame, LiveAllocationTable, ProfilerError, Result, TraceHandle};

/// Filename matched by filters for blocks recorded without any frame.
pub const UNKNOWN_FILENAME: &str = "<unknown>";

/// A live sampled allocation with its resolved trace.
#[derive(Debug, Clone, Serialize)]
pub struct TracedBlock {
    pub address: usize,
    pub size: usize,
    /// Innermost frame first; empty when no stack was available.
    pub trace: Arc<[Frame]>,
}

/// How [`HeapSnapshot::statistics`] groups blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatisticKey {
    /// The whole trace.
    Traceback,
    /// File of the innermost frame.
    Filename,
    /// Innermost frame, file and line.
    Lineno,
}

impl StatisticKey {
    fn frame_key(self, frame: &Frame) -> Arc<[Frame]> {
        match self {
            StatisticKey::Filename => vec![Frame::new("", frame.filename.clone(), 0, 0)].into(),
            StatisticKey::Traceback | StatisticKey::Lineno => vec![frame.clone()].into(),
        }
    }
}

/// Live allocations grouped under one [`StatisticKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceStatistic {
    pub trace: Arc<[Frame]>,
    pub count: usize,
    pub size: usize,
}

impl fmt::Display for TraceStatistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: size={} B, count={}",
            Location(&self.trace),
            self.size,
            self.count
        )?;

        if self.count > 0 {
            write!(f, ", average={} B", self.size / self.count)?;
        }

        Ok(())
    }
}

/// Difference of one group between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceStatisticDiff {
    pub trace: Arc<[Frame]>,
    pub size: usize,
    pub size_diff: isize,
    pub count: usize,
    pub count_diff: isize,
}

impl fmt::Display for TraceStatisticDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: size={} B ({:+} B), count={} ({:+})",
            Location(&self.trace),
            self.size,
            self.size_diff,
            self.count,
            self.count_diff
        )?;

        if self.count > 0 {
            write!(f, ", average={} B", self.size / self.count)?;
        }

        Ok(())
    }
}

/// `file:line` of the innermost frame.
struct Location<'a>(&'a [Frame]);

impl fmt::Display for Location<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.first() {
            Some(frame) => write!(f, "{}:{}", frame.filename, frame.line),
            None => write!(f, "{}", UNKNOWN_FILENAME),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Group {
    count: usize,
    size: usize,
}

/// Selects blocks by the filename and line of their frames.
///
/// `filename_pattern` is matched against the whole filename, `*` matches any
/// run of characters and `?` any single character.
#[derive(Debug, Clone)]
pub struct Filter {
    inclusive: bool,
    filename_pattern: String,
    lineno: Option<u32>,
    all_frames: bool,
    matcher: Regex,
}

impl Filter {
    /// Create a filter on the innermost frame, for any line.
    ///
    /// An inclusive filter keeps only the matching blocks, an exclusive one
    /// drops them.
    pub fn new(inclusive: bool, filename_pattern: impl Into<String>) -> Result<Self> {
        let filename_pattern = filename_pattern.into();

        let matcher = compile_pattern(&filename_pattern)?;

        Ok(Self {
            inclusive,
            filename_pattern,
            lineno: None,
            all_frames: false,
            matcher,
        })
    }

    /// Only match frames executing `lineno`.
    #[must_use]
    pub fn with_lineno(mut self, lineno: u32) -> Self {
        self.lineno = Some(lineno);
        self
    }

    /// Check every frame of a trace instead of the innermost one.
    #[must_use]
    pub fn with_all_frames(mut self, all_frames: bool) -> Self {
        self.all_frames = all_frames;
        self
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    pub fn filename_pattern(&self) -> &str {
        &self.filename_pattern
    }

    pub fn lineno(&self) -> Option<u32> {
        self.lineno
    }

    pub fn all_frames(&self) -> bool {
        self.all_frames
    }

    /// Whether a frame at `filename:lineno` passes this filter.
    pub fn matches_frame(&self, filename: &str, lineno: u32) -> bool {
        self.selects(filename, lineno) == self.inclusive
    }

    /// Whether a block allocated from `trace` passes this filter.
    ///
    /// A trace without frames is matched as `<unknown>` at line 0.
    pub fn matches_trace(&self, trace: &[Frame]) -> bool {
        let selected = match trace.first() {
            None => self.selects(UNKNOWN_FILENAME, 0),
            Some(_) if self.all_frames => trace
                .iter()
                .any(|frame| self.selects(&frame.filename, frame.line)),
            Some(frame) => self.selects(&frame.filename, frame.line),
        };

        selected == self.inclusive
    }

    fn selects(&self, filename: &str, lineno: u32) -> bool {
        if !self.matcher.is_match(filename) {
            return false;
        }

        match self.lineno {
            Some(expected) => expected == lineno,
            None => true,
        }
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);

    source.push_str("^(?s:");

    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            c => source.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }

    source.push_str(")$");

    Regex::new(&source).map_err(|_| ProfilerError::InvalidFilterPattern)
}

/// Self-contained view of the live heap at one point in time.
///
/// Blocks allocated from the same trace share one resolved frame slice and
/// are ordered by address. `total_memory_traced` is always the sum of the
/// block sizes. The snapshot owns its data and stays usable after the
/// profiler is stopped.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HeapSnapshot {
    blocks: Vec<TracedBlock>,
    total_memory_traced: usize,
    peak_memory_traced: usize,
    max_frames: usize,
}

impl HeapSnapshot {
    pub(crate) fn collect(
        live: &LiveAllocationTable,
        traces: &CallTraceInterner,
        max_frames: usize,
    ) -> Self {
        let (entries, total_memory_traced, peak_memory_traced) = live.entries_with_totals();

        let mut resolved: FxHashMap<TraceHandle, Arc<[Frame]>> = FxHashMap::default();

        let mut blocks: Vec<_> = entries
            .into_iter()
            .map(|(address, pointer)| {
                let trace = resolved
                    .entry(pointer.trace)
                    .or_insert_with(|| traces.trace(pointer.trace).into())
                    .clone();

                TracedBlock {
                    address,
                    size: pointer.size,
                    trace,
                }
            })
            .collect();

        blocks.sort_unstable_by_key(|block| block.address);

        Self {
            blocks,
            total_memory_traced,
            peak_memory_traced,
            max_frames,
        }
    }

    pub fn blocks(&self) -> &[TracedBlock] {
        &self.blocks
    }

    pub fn total_memory_traced(&self) -> usize {
        self.total_memory_traced
    }

    pub fn peak_memory_traced(&self) -> usize {
        self.peak_memory_traced
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Group blocks by `key`, largest total size first.
    ///
    /// With `cumulative` set every frame of a trace counts the block, not just
    /// the innermost one. Cumulative grouping by whole traceback is rejected.
    pub fn statistics(&self, key: StatisticKey, cumulative: bool) -> Result<Vec<TraceStatistic>> {
        let mut statistics: Vec<_> = self
            .group_by(key, cumulative)?
            .into_iter()
            .map(|(trace, group)| TraceStatistic {
                trace,
                count: group.count,
                size: group.size,
            })
            .collect();

        statistics.sort_by(|a, b| {
            b.size
                .cmp(&a.size)
                .then(b.count.cmp(&a.count))
                .then_with(|| b.trace.cmp(&a.trace))
        });

        Ok(statistics)
    }

    /// Group both snapshots by `key` and compute per-group deltas from `older`.
    ///
    /// Groups that vanished are reported with a zero size. The largest
    /// absolute size change comes first.
    pub fn compare_to(
        &self,
        older: &HeapSnapshot,
        key: StatisticKey,
        cumulative: bool,
    ) -> Result<Vec<TraceStatisticDiff>> {
        let mut previous = older.group_by(key, cumulative)?;

        let mut diffs: Vec<_> = self
            .group_by(key, cumulative)?
            .into_iter()
            .map(|(trace, group)| {
                let before = previous.remove(&trace).unwrap_or_default();

                TraceStatisticDiff {
                    trace,
                    size: group.size,
                    size_diff: group.size as isize - before.size as isize,
                    count: group.count,
                    count_diff: group.count as isize - before.count as isize,
                }
            })
            .collect();

        diffs.extend(previous.into_iter().map(|(trace, before)| TraceStatisticDiff {
            trace,
            size: 0,
            size_diff: -(before.size as isize),
            count: 0,
            count_diff: -(before.count as isize),
        }));

        diffs.sort_by(|a, b| {
            b.size_diff
                .unsigned_abs()
                .cmp(&a.size_diff.unsigned_abs())
                .then(b.size.cmp(&a.size))
                .then(b.count_diff.unsigned_abs().cmp(&a.count_diff.unsigned_abs()))
                .then(b.count.cmp(&a.count))
                .then_with(|| b.trace.cmp(&a.trace))
        });

        Ok(diffs)
    }

    /// New snapshot with the blocks passing `filters`.
    ///
    /// A block is kept when it matches at least one inclusive filter (or there
    /// are none) and none of the exclusive filters excludes it. The peak is
    /// carried over, the total is recomputed from the kept blocks.
    pub fn filter_traces(&self, filters: &[Filter]) -> HeapSnapshot {
        let (include, exclude): (Vec<&Filter>, Vec<&Filter>) =
            filters.iter().partition(|filter| filter.inclusive);

        let blocks: Vec<_> = self
            .blocks
            .iter()
            .filter(|block| {
                (include.is_empty() || include.iter().any(|f| f.matches_trace(&block.trace)))
                    && exclude.iter().all(|f| f.matches_trace(&block.trace))
            })
            .cloned()
            .collect();

        Self {
            total_memory_traced: blocks.iter().map(|block| block.size).sum(),
            blocks,
            peak_memory_traced: self.peak_memory_traced,
            max_frames: self.max_frames,
        }
    }

    fn group_by(
        &self,
        key: StatisticKey,
        cumulative: bool,
    ) -> Result<FxHashMap<Arc<[Frame]>, Group>> {
        if cumulative && key == StatisticKey::Traceback {
            return Err(ProfilerError::CumulativeTraceback);
        }

        let mut keys: FxHashMap<&Frame, Arc<[Frame]>> = FxHashMap::default();
        let mut groups: FxHashMap<Arc<[Frame]>, Group> = FxHashMap::default();

        let mut add = |trace: Arc<[Frame]>, size: usize| {
            let group = groups.entry(trace).or_default();
            group.count += 1;
            group.size += size;
        };

        for block in &self.blocks {
            if key == StatisticKey::Traceback {
                add(block.trace.clone(), block.size);
                continue;
            }

            // a trace without frames only forms its own group.
            if block.trace.is_empty() {
                if !cumulative {
                    add(block.trace.clone(), block.size);
                }

                continue;
            }

            let frames = if cumulative {
                &block.trace[..]
            } else {
                &block.trace[..1]
            };

            for frame in frames {
                let trace = keys
                    .entry(frame)
                    .or_insert_with(|| key.frame_key(frame))
                    .clone();

                add(trace, block.size);
            }
        }

        Ok(groups)
    }
}
