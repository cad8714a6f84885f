//! Task nodes that record their executions, shared by the unit tests.

use std::sync::{Arc, Mutex, RwLock};

use anyhow::bail;

use crate::core::{Context, FRAME, Hash32};
use crate::task::{DispatcherConfig, DocumentId, NodeId, Task, TaskSpec};

/// Executions in the order they happened, as `(node, frames)`.
#[derive(Clone, Default)]
pub(crate) struct Log(Arc<Mutex<Vec<(String, Vec<i64>)>>>);

impl Log {
    fn push(&self, node: &str, frames: Vec<i64>) {
        self.0.lock().unwrap().push((node.to_string(), frames));
    }

    pub(crate) fn entries(&self) -> Vec<(String, Vec<i64>)> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.entries().into_iter().map(|(name, _)| name).collect()
    }

    /// `node@frame` for every frame executed, flattened.
    pub(crate) fn frames(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .flat_map(|(name, frames)| frames.into_iter().map(move |f| format!("{name}@{f}")))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

pub(crate) struct LoggingTask {
    id: NodeId,
    name: String,
    log: Log,
    document: Option<DocumentId>,
    frame_sensitive: bool,
    noop: bool,
    sequence: bool,
    failing: bool,
    config: DispatcherConfig,
    pre: RwLock<Vec<(Arc<dyn TaskSpec>, Option<Context>)>>,
    post: RwLock<Vec<Arc<dyn TaskSpec>>>,
}

impl LoggingTask {
    pub(crate) fn new(name: &str, log: &Log) -> Self {
        Self {
            id: NodeId::next(),
            name: name.to_string(),
            log: log.clone(),
            document: None,
            frame_sensitive: true,
            noop: false,
            sequence: false,
            failing: false,
            config: DispatcherConfig::default(),
            pre: RwLock::new(Vec::new()),
            post: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn frame_independent(mut self) -> Self {
        self.frame_sensitive = false;
        self
    }

    pub(crate) fn noop(mut self) -> Self {
        self.noop = true;
        self
    }

    pub(crate) fn sequence(mut self) -> Self {
        self.sequence = true;
        self
    }

    pub(crate) fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub(crate) fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub(crate) fn immediate(mut self) -> Self {
        self.config.immediate = true;
        self
    }

    pub(crate) fn document(mut self, document: DocumentId) -> Self {
        self.document = Some(document);
        self
    }

    pub(crate) fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub(crate) fn add_pre(&self, task: Arc<dyn TaskSpec>) {
        self.pre.write().unwrap().push((task, None));
    }

    /// Requests `task` in a fixed context instead of the current one.
    pub(crate) fn add_pre_in(&self, task: Arc<dyn TaskSpec>, context: Context) {
        self.pre.write().unwrap().push((task, Some(context)));
    }

    pub(crate) fn add_post(&self, task: Arc<dyn TaskSpec>) {
        self.post.write().unwrap().push(task);
    }
}

impl TaskSpec for LoggingTask {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn document(&self) -> Option<DocumentId> {
        self.document
    }

    fn hash(&self, context: &Context) -> Hash32 {
        if self.noop {
            return Hash32::NULL;
        }
        if self.frame_sensitive {
            context.hash_vars([FRAME])
        } else {
            context.hash_vars([])
        }
    }

    fn pre_tasks(&self, context: &Context) -> Vec<Task> {
        self.pre
            .read()
            .unwrap()
            .iter()
            .map(|(node, fixed)| {
                Task::new(node.clone(), fixed.clone().unwrap_or_else(|| context.clone()))
            })
            .collect()
    }

    fn post_tasks(&self, context: &Context) -> Vec<Task> {
        self.post
            .read()
            .unwrap()
            .iter()
            .map(|node| Task::new(node.clone(), context.clone()))
            .collect()
    }

    fn execute(&self, contexts: &[Context]) -> anyhow::Result<()> {
        if self.failing {
            bail!("{} refused to run", self.name);
        }
        self.log
            .push(&self.name, contexts.iter().map(Context::frame).collect());
        Ok(())
    }

    fn requires_sequence_execution(&self) -> bool {
        self.sequence
    }

    fn dispatcher_config(&self, _: &Context) -> DispatcherConfig {
        self.config
    }
}
