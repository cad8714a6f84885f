use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::{Context, Hash32};

static NEXT_NODE: AtomicU64 = AtomicU64::new(0);
static NEXT_DOCUMENT: AtomicU64 = AtomicU64::new(0);

/// Opaque identity of a task-producing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Allocates an identity no other node in this process has.
    pub fn next() -> Self {
        Self(NEXT_NODE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque identity of the document a node lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentId(u64);

impl DocumentId {
    pub fn next() -> Self {
        Self(NEXT_DOCUMENT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Scheduling preferences of a node, evaluated per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum number of frames delivered to a single `execute` call.
    pub batch_size: usize,
    /// Execute synchronously during dispatch instead of spooling.
    pub immediate: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            immediate: false,
        }
    }
}

/// The capability a node exposes to the dispatcher.
///
/// Every method except [`TaskSpec::execute`] must be free of side effects, the
/// dispatcher calls them as often as it needs while building its batch graph.
pub trait TaskSpec: Send + Sync {
    fn id(&self) -> NodeId;

    fn name(&self) -> String;

    /// The document this node belongs to, all tasks of one dispatch must agree.
    fn document(&self) -> Option<DocumentId> {
        None
    }

    /// Identity of the work done in `context`. [`Hash32::NULL`] marks a no-op.
    fn hash(&self, context: &Context) -> Hash32;

    /// Tasks that must complete before this one.
    fn pre_tasks(&self, context: &Context) -> Vec<Task>;

    /// Tasks that run right after this one.
    fn post_tasks(&self, _context: &Context) -> Vec<Task> {
        Vec::new()
    }

    fn execute(&self, contexts: &[Context]) -> anyhow::Result<()>;

    fn requires_sequence_execution(&self) -> bool {
        false
    }

    fn dispatcher_config(&self, _context: &Context) -> DispatcherConfig {
        DispatcherConfig::default()
    }
}

/// A node paired with the context it should be evaluated in.
#[derive(Clone)]
pub struct Task {
    node: Arc<dyn TaskSpec>,
    context: Context,
}

impl Task {
    pub fn new(node: Arc<dyn TaskSpec>, context: Context) -> Self {
        Self { node, context }
    }

    pub fn node(&self) -> &Arc<dyn TaskSpec> {
        &self.node
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn hash(&self) -> Hash32 {
        self.node.hash(&self.context)
    }

    pub fn pre_tasks(&self) -> Vec<Task> {
        self.node.pre_tasks(&self.context)
    }

    pub fn post_tasks(&self) -> Vec<Task> {
        self.node.post_tasks(&self.context)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        self.node.dispatcher_config(&self.context)
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("node", &self.node.name())
            .field("context", &self.context)
            .finish()
    }
}
