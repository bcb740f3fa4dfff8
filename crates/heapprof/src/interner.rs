//! Prefix-sharing storage for call traces.
//!
//! A trace is stored as a chain of trie nodes from its root (outermost) frame
//! down to its leaf (innermost) frame. A node is identified by its `(parent,
//! frame)` pair, so traces that share callers share the nodes for those callers.
//! Nodes live in an append-only arena and are addressed by index: a
//! [`TraceHandle`] stays valid until [`CallTraceInterner::reset`], no matter how
//! much the arena or its index grow in the meantime.

use std::{mem::size_of, num::NonZeroU32, sync::Arc};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::Frame;

/// Stable reference to the leaf node of an interned trace.
///
/// [`TraceHandle::EMPTY`] stands for the trace without frames.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceHandle(Option<NonZeroU32>);

impl TraceHandle {
    pub const EMPTY: Self = Self(None);

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    #[inline]
    fn index(&self) -> Option<usize> {
        self.0.map(|id| id.get() as usize - 1)
    }
}

/// Deduplicates the strings referenced by interned frames.
#[derive(Debug, Default)]
pub struct StringInternTable {
    strings: FxHashSet<Arc<str>>,
}

impl StringInternTable {
    /// Returns the canonical copy of `value`, storing it on first sight.
    pub fn intern(&mut self, value: &Arc<str>) -> Arc<str> {
        if let Some(interned) = self.strings.get(value.as_ref()) {
            return interned.clone();
        }

        self.strings.insert(value.clone());

        value.clone()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn clear(&mut self) {
        self.strings.clear();
    }

    fn memory_usage(&self) -> usize {
        self.strings.capacity() * size_of::<Arc<str>>()
            + self.strings.iter().map(|s| s.len()).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NodeKey {
    parent: TraceHandle,
    frame: Frame,
}

#[derive(Debug)]
struct TrieNode {
    /// [`TraceHandle::EMPTY`] marks a root frame.
    parent: TraceHandle,
    frame: Frame,
}

/// Interned set of call traces.
///
/// Not synchronized: the owner serializes access.
#[derive(Debug, Default)]
pub struct CallTraceInterner {
    nodes: Vec<TrieNode>,
    index: FxHashMap<NodeKey, TraceHandle>,
    strings: StringInternTable,
}

impl CallTraceInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `trace` (innermost frame first) and return the handle of its leaf.
    ///
    /// Should the arena run out of ids, the trace is cut short at the last
    /// interned caller.
    pub fn intern(&mut self, trace: &[Frame]) -> TraceHandle {
        let mut parent = TraceHandle::EMPTY;
        let mut num_to_intern = trace.len();

        // Most of a trace is usually interned already: look frames up from the
        // root without touching the string table until the first miss.
        for frame in trace.iter().rev() {
            let key = NodeKey {
                parent,
                frame: frame.clone(),
            };

            match self.index.get(&key) {
                Some(handle) => {
                    parent = *handle;
                    num_to_intern -= 1;
                }
                None => break,
            }
        }

        for frame in trace[..num_to_intern].iter().rev() {
            let frame = Frame {
                function: self.strings.intern(&frame.function),
                filename: self.strings.intern(&frame.filename),
                first_line: frame.first_line,
                line: frame.line,
            };

            match self.push_node(parent, frame) {
                Some(handle) => parent = handle,
                None => break,
            }
        }

        parent
    }

    fn push_node(&mut self, parent: TraceHandle, frame: Frame) -> Option<TraceHandle> {
        let id = u32::try_from(self.nodes.len() + 1)
            .ok()
            .and_then(NonZeroU32::new)?;

        let handle = TraceHandle(Some(id));

        self.index.insert(
            NodeKey {
                parent,
                frame: frame.clone(),
            },
            handle,
        );

        self.nodes.push(TrieNode { parent, frame });

        Some(handle)
    }

    /// Rebuild the trace behind `handle`, innermost frame first.
    ///
    /// Handles minted before the last reset yield an empty trace.
    pub fn trace(&self, handle: TraceHandle) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(self.depth(handle));
        let mut current = handle;

        while let Some(node) = self.node(current) {
            frames.push(node.frame.clone());
            current = node.parent;
        }

        frames
    }

    fn depth(&self, handle: TraceHandle) -> usize {
        let mut depth = 0;
        let mut current = handle;

        while let Some(node) = self.node(current) {
            depth += 1;
            current = node.parent;
        }

        depth
    }

    #[inline]
    fn node(&self, handle: TraceHandle) -> Option<&TrieNode> {
        handle.index().and_then(|index| self.nodes.get(index))
    }

    /// Number of distinct trie nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of distinct interned strings.
    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    /// Drop every node and interned string, invalidating all handles.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Estimated heap bytes held by the interner.
    pub fn memory_usage(&self) -> usize {
        self.nodes.capacity() * size_of::<TrieNode>()
            + self.index.capacity() * size_of::<(NodeKey, TraceHandle)>()
            + self.strings.memory_usage()
    }
}
