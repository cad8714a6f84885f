mod batcher;
mod chunk;
mod order;

use std::collections::HashSet;
use std::ops::{Deref, Range};
use std::sync::Arc;

use crate::core::{Blake3Hasher, Context, Hash32};
use crate::frames::FrameList;
use crate::task::{NodeId, TaskSpec};

pub use crate::engine::batcher::BatchGraphBuilder;

/// Index of a batch inside its [`DispatchGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(usize);

impl BatchId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Identity of a batch while the graph is being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum BatchKey {
    Hashed(NodeId, Hash32),
    Sequence(NodeId),
}

/// Batch ids in insertion order, each at most once.
#[derive(Debug, Clone, Default)]
pub(crate) struct BatchSet {
    ids: Vec<BatchId>,
    seen: HashSet<BatchId>,
}

impl BatchSet {
    pub(crate) fn insert(&mut self, id: BatchId) -> bool {
        let added = self.seen.insert(id);
        if added {
            self.ids.push(id);
        }
        added
    }

    pub(crate) fn into_vec(self) -> Vec<BatchId> {
        self.ids
    }
}

impl Deref for BatchSet {
    type Target = [BatchId];

    fn deref(&self) -> &[BatchId] {
        &self.ids
    }
}

/// Frames of one node that are the same work, executed together.
pub struct TaskBatch {
    pub(crate) key: BatchKey,
    pub(crate) node: Arc<dyn TaskSpec>,
    pub(crate) hash: Hash32,
    pub(crate) contexts: Vec<Context>,
    pub(crate) context_hashes: HashSet<Hash32>,
    pub(crate) pre: BatchSet,
    pub(crate) post: BatchSet,
    pub(crate) post_of: BatchSet,
    pub(crate) immediate: bool,
    pub(crate) chunks: Vec<Range<usize>>,
    pub(crate) executed: bool,
}

impl TaskBatch {
    pub(crate) fn new(key: BatchKey, node: Arc<dyn TaskSpec>, hash: Hash32) -> Self {
        Self {
            key,
            node,
            hash,
            contexts: Vec::new(),
            context_hashes: HashSet::new(),
            pre: BatchSet::default(),
            post: BatchSet::default(),
            post_of: BatchSet::default(),
            immediate: false,
            chunks: Vec::new(),
            executed: false,
        }
    }

    pub fn node(&self) -> &Arc<dyn TaskSpec> {
        &self.node
    }

    pub fn name(&self) -> String {
        self.node.name()
    }

    pub fn hash(&self) -> Hash32 {
        self.hash
    }

    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    pub fn frames(&self) -> FrameList {
        self.contexts.iter().map(Context::frame).collect()
    }

    /// Batches that must complete before this one.
    pub fn pre_tasks(&self) -> &[BatchId] {
        &self.pre
    }

    /// Batches that run right after this one.
    pub fn post_tasks(&self) -> &[BatchId] {
        &self.post
    }

    /// Batches this one is a post task of.
    pub fn owners(&self) -> &[BatchId] {
        &self.post_of
    }

    /// Every batch that has to finish before this one starts.
    pub(crate) fn dependencies(&self) -> impl Iterator<Item = BatchId> + '_ {
        self.post_of.iter().chain(self.pre.iter()).copied()
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self.key, BatchKey::Sequence(_))
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    /// Contexts grouped the way they are handed to `execute`.
    pub fn chunks(&self) -> impl Iterator<Item = &[Context]> {
        self.chunks.iter().map(|range| &self.contexts[range.clone()])
    }
}

impl std::fmt::Debug for TaskBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskBatch")
            .field("node", &self.node.name())
            .field("frames", &self.frames())
            .field("pre", &&*self.pre)
            .field("post", &&*self.post)
            .field("immediate", &self.immediate)
            .field("executed", &self.executed)
            .finish()
    }
}

/// The batches of one dispatch, in the order they execute.
#[derive(Debug, Default)]
pub struct DispatchGraph {
    pub(crate) batches: Vec<TaskBatch>,
    pub(crate) roots: Vec<BatchId>,
    pub(crate) order: Vec<BatchId>,
}

impl DispatchGraph {
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn batch(&self, id: BatchId) -> &TaskBatch {
        &self.batches[id.0]
    }

    pub(crate) fn batch_mut(&mut self, id: BatchId) -> &mut TaskBatch {
        &mut self.batches[id.0]
    }

    /// Batches covering the requested tasks.
    pub fn roots(&self) -> &[BatchId] {
        &self.roots
    }

    /// Every batch in execution order.
    pub fn order(&self) -> &[BatchId] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (BatchId, &TaskBatch)> {
        self.order.iter().map(|&id| (id, &self.batches[id.0]))
    }

    /// Batches still waiting to execute, in execution order.
    pub fn pending(&self) -> impl Iterator<Item = BatchId> + '_ {
        self.order
            .iter()
            .copied()
            .filter(|id| !self.batches[id.0].executed)
    }

    /// Digest of all the work in the graph, independent of how it is connected.
    pub fn hash(&self) -> Hash32 {
        let mut acc = Hash32::NULL;
        for batch in &self.batches {
            let name = batch.node.name();
            for context in &batch.contexts {
                let mut hasher = Blake3Hasher::new();
                hasher
                    .update(name.as_bytes())
                    .update(batch.node.hash(context).as_bytes())
                    .update(context.hash().as_bytes());
                acc = acc.wrapping_add(hasher.into());
            }
        }
        acc
    }
}
