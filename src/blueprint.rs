use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::Graph;
use petgraph::algo::has_path_connecting;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::core::{Context, FRAME, FRAME_RANGE_END, FRAME_RANGE_START, Hash32};
use crate::error::{ConfigurationError, CycleError};
use crate::frames::{DEFAULT_END, DEFAULT_START};
use crate::task::{DispatcherConfig, DocumentId, NodeId, Task, TaskSpec};

type ConfigFn = Arc<dyn Fn(&Context) -> DispatcherConfig + Send + Sync>;
type Callback = Arc<dyn Fn(&[Context]) -> anyhow::Result<()> + Send + Sync>;

/// The behaviour of a node in a [`Blueprint`].
///
/// Connections and scheduling preferences are owned by the blueprint, a `Work`
/// only decides what its node hashes to and what it does when executed.
pub trait Work: Send + Sync {
    fn hash(&self, context: &Context) -> Hash32;

    fn execute(&self, _contexts: &[Context]) -> anyhow::Result<()> {
        Ok(())
    }

    /// The context upstream tasks are requested in, `None` skips them entirely.
    fn pre_context(&self, context: &Context) -> Option<Context> {
        Some(context.clone())
    }
}

/// A node backed by a closure, hashing the context variables it reads.
pub struct FnWork {
    vars: Vec<String>,
    callback: Callback,
}

impl Work for FnWork {
    fn hash(&self, context: &Context) -> Hash32 {
        context.hash_vars(self.vars.iter().map(String::as_str))
    }

    fn execute(&self, contexts: &[Context]) -> anyhow::Result<()> {
        (self.callback)(contexts)
    }
}

/// Handle to a node added to a [`Blueprint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(NodeIndex);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dependency {
    /// Source runs before target.
    Pre,
    /// Target runs right after source.
    Post,
}

#[derive(Clone)]
pub(crate) struct NodeSlot {
    id: NodeId,
    name: String,
    work: Arc<dyn Work>,
    sequence: bool,
    batch_size: usize,
    immediate: bool,
    config: Option<ConfigFn>,
}

#[derive(Clone)]
pub(crate) struct Document {
    id: DocumentId,
    graph: Graph<NodeSlot, Dependency>,
    names: HashMap<String, NodeIndex>,
    start: i64,
    end: i64,
    frame: i64,
}

/// An in-memory task document.
///
/// Nodes are added through [`Blueprint::task`] or [`Blueprint::add_node`] and
/// wired with [`Blueprint::connect_pre`] and [`Blueprint::connect_post`]. Specs
/// handed out by [`Blueprint::spec`] see the document as it was when they were
/// created, later edits leave them untouched.
///
/// # Example
///
/// ```rust
/// use taskspool::Blueprint;
///
/// let mut blueprint = Blueprint::new();
/// let render = blueprint.task().name("render").run(|_| Ok(()));
/// let publish = blueprint.task().name("publish").vars([]).run(|_| Ok(()));
/// blueprint.connect_pre(publish, render).unwrap();
/// ```
pub struct Blueprint {
    document: Arc<Document>,
}

impl Blueprint {
    pub fn new() -> Self {
        Self {
            document: Arc::new(Document {
                id: DocumentId::next(),
                graph: Graph::new(),
                names: HashMap::new(),
                start: DEFAULT_START,
                end: DEFAULT_END,
                frame: 1,
            }),
        }
    }

    pub fn id(&self) -> DocumentId {
        self.document.id
    }

    pub fn frame_range(&mut self, start: i64, end: i64) -> &mut Self {
        let document = Arc::make_mut(&mut self.document);
        document.start = start;
        document.end = end;
        self
    }

    pub fn set_frame(&mut self, frame: i64) -> &mut Self {
        Arc::make_mut(&mut self.document).frame = frame;
        self
    }

    /// The context a dispatch of this document starts from.
    pub fn context(&self) -> Context {
        Context::new()
            .with(FRAME_RANGE_START, self.document.start)
            .with(FRAME_RANGE_END, self.document.end)
            .with(FRAME, self.document.frame)
    }

    pub fn task(&mut self) -> TaskDef<'_> {
        TaskDef {
            blueprint: self,
            name: None,
            vars: vec![FRAME.to_string()],
            sequence: false,
            batch_size: 1,
            immediate: false,
            config: None,
        }
    }

    /// Adds a node with the default scheduling preferences.
    pub fn add_node(&mut self, name: impl Into<Cow<'static, str>>, work: impl Work + 'static) -> NodeHandle {
        self.insert(name.into(), Arc::new(work), false, 1, false, None)
    }

    fn insert(
        &mut self,
        name: Cow<'static, str>,
        work: Arc<dyn Work>,
        sequence: bool,
        batch_size: usize,
        immediate: bool,
        config: Option<ConfigFn>,
    ) -> NodeHandle {
        let document = Arc::make_mut(&mut self.document);

        let mut unique = name.to_string();
        let mut suffix = 1;
        while document.names.contains_key(&unique) {
            unique = format!("{name}{suffix}");
            suffix += 1;
        }

        let index = document.graph.add_node(NodeSlot {
            id: NodeId::next(),
            name: unique.clone(),
            work,
            sequence,
            batch_size,
            immediate,
            config,
        });
        document.names.insert(unique, index);

        NodeHandle(index)
    }

    pub fn name(&self, node: NodeHandle) -> &str {
        &self.document.graph[node.0].name
    }

    /// Makes `upstream` a pre task of `node`.
    pub fn connect_pre(&mut self, node: NodeHandle, upstream: NodeHandle) -> Result<(), CycleError> {
        self.connect(upstream, node, Dependency::Pre)
    }

    /// Makes `post` a post task of `node`.
    pub fn connect_post(&mut self, node: NodeHandle, post: NodeHandle) -> Result<(), CycleError> {
        self.connect(node, post, Dependency::Post)
    }

    fn connect(&mut self, before: NodeHandle, after: NodeHandle, kind: Dependency) -> Result<(), CycleError> {
        let graph = &self.document.graph;

        if before == after || has_path_connecting(graph, after.0, before.0, None) {
            let error = CycleError::Connection {
                node: graph[after.0].name.clone(),
                upstream: graph[before.0].name.clone(),
            };
            tracing::warn!("{error}, connection rejected");
            return Err(error);
        }

        let exists = graph
            .edges_connecting(before.0, after.0)
            .any(|edge| *edge.weight() == kind);

        if !exists {
            Arc::make_mut(&mut self.document)
                .graph
                .add_edge(before.0, after.0, kind);
        }

        Ok(())
    }

    /// Removes every connection between the two nodes, in either direction.
    pub fn disconnect(&mut self, node: NodeHandle, other: NodeHandle) {
        let document = Arc::make_mut(&mut self.document);
        while let Some(edge) = document
            .graph
            .find_edge(node.0, other.0)
            .or_else(|| document.graph.find_edge(other.0, node.0))
        {
            document.graph.remove_edge(edge);
        }
    }

    pub fn set_batch_size(&mut self, node: NodeHandle, batch_size: usize) {
        Arc::make_mut(&mut self.document).graph[node.0].batch_size = batch_size;
    }

    pub fn set_immediate(&mut self, node: NodeHandle, immediate: bool) {
        Arc::make_mut(&mut self.document).graph[node.0].immediate = immediate;
    }

    pub fn spec(&self, node: NodeHandle) -> Arc<dyn TaskSpec> {
        Arc::new(GraphTask {
            document: self.document.clone(),
            index: node.0,
        })
    }

    pub fn spec_by_name(&self, name: &str) -> Result<Arc<dyn TaskSpec>, ConfigurationError> {
        self.document
            .names
            .get(name)
            .map(|&index| self.spec(NodeHandle(index)))
            .ok_or_else(|| ConfigurationError::NotTaskProducing(name.to_string()))
    }
}

impl Default for Blueprint {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Blueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = &self.document.graph;
        writeln!(f, "graph LR")?;

        for index in graph.node_indices() {
            let slot = &graph[index];
            let name = slot.name.replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in graph.edge_references() {
            let arrow = match edge.weight() {
                Dependency::Pre => "-->",
                Dependency::Post => "-.->",
            };
            writeln!(
                f,
                "    {} {} {}",
                edge.source().index(),
                arrow,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

pub struct TaskDef<'a> {
    blueprint: &'a mut Blueprint,
    name: Option<Cow<'static, str>>,
    vars: Vec<String>,
    sequence: bool,
    batch_size: usize,
    immediate: bool,
    config: Option<ConfigFn>,
}

impl<'a> TaskDef<'a> {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Context variables the work depends on. An empty list makes the task the
    /// same work on every frame.
    pub fn vars<'v>(mut self, vars: impl IntoIterator<Item = &'v str>) -> Self {
        self.vars = vars.into_iter().map(String::from).collect();
        self
    }

    /// Deliver every frame to a single call, in ascending order.
    pub fn sequence(mut self) -> Self {
        self.sequence = true;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// Computes the scheduling preferences from the context, overriding
    /// [`TaskDef::batch_size`] and [`TaskDef::immediate`].
    pub fn dispatcher_config<F>(mut self, config: F) -> Self
    where
        F: Fn(&Context) -> DispatcherConfig + Send + Sync + 'static,
    {
        self.config = Some(Arc::new(config));
        self
    }

    pub fn run<F>(self, callback: F) -> NodeHandle
    where
        F: Fn(&[Context]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = self.name.unwrap_or(Cow::Borrowed("task"));
        let work = FnWork {
            vars: self.vars,
            callback: Arc::new(callback),
        };
        self.blueprint.insert(
            name,
            Arc::new(work),
            self.sequence,
            self.batch_size,
            self.immediate,
            self.config,
        )
    }
}

/// A node of a [`Blueprint`] snapshot, seen through [`TaskSpec`].
struct GraphTask {
    document: Arc<Document>,
    index: NodeIndex,
}

impl GraphTask {
    fn slot(&self) -> &NodeSlot {
        &self.document.graph[self.index]
    }

    fn neighbours(&self, direction: Direction, kind: Dependency, context: &Context) -> Vec<Task> {
        let mut edges: Vec<_> = self
            .document
            .graph
            .edges_directed(self.index, direction)
            .filter(|edge| *edge.weight() == kind)
            .map(|edge| {
                let other = match direction {
                    Direction::Incoming => edge.source(),
                    Direction::Outgoing => edge.target(),
                };
                (edge.id(), other)
            })
            .collect();

        // Connection order.
        edges.sort_by_key(|(edge, _)| *edge);

        edges
            .into_iter()
            .map(|(_, index)| {
                let node = GraphTask {
                    document: self.document.clone(),
                    index,
                };
                Task::new(Arc::new(node), context.clone())
            })
            .collect()
    }
}

impl TaskSpec for GraphTask {
    fn id(&self) -> NodeId {
        self.slot().id
    }

    fn name(&self) -> String {
        self.slot().name.clone()
    }

    fn document(&self) -> Option<DocumentId> {
        Some(self.document.id)
    }

    fn hash(&self, context: &Context) -> Hash32 {
        self.slot().work.hash(context)
    }

    fn pre_tasks(&self, context: &Context) -> Vec<Task> {
        match self.slot().work.pre_context(context) {
            Some(context) => self.neighbours(Direction::Incoming, Dependency::Pre, &context),
            None => Vec::new(),
        }
    }

    fn post_tasks(&self, context: &Context) -> Vec<Task> {
        self.neighbours(Direction::Outgoing, Dependency::Post, context)
    }

    fn execute(&self, contexts: &[Context]) -> anyhow::Result<()> {
        self.slot().work.execute(contexts)
    }

    fn requires_sequence_execution(&self) -> bool {
        self.slot().sequence
    }

    fn dispatcher_config(&self, context: &Context) -> DispatcherConfig {
        let slot = self.slot();
        match &slot.config {
            Some(config) => config(context),
            None => DispatcherConfig {
                batch_size: slot.batch_size,
                immediate: slot.immediate,
            },
        }
    }
}
