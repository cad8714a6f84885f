use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::{Context, Hash32};
use crate::engine::{BatchId, BatchKey, BatchSet, DispatchGraph, TaskBatch, chunk, order};
use crate::error::CycleError;
use crate::frames::FrameList;
use crate::task::{NodeId, Task, TaskSpec};

/// Entry on the current recursion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathKey {
    Batch(BatchKey),
    NoOp(NodeId, Hash32),
}

/// Expands requested tasks into a deduplicated graph of [`TaskBatch`]es.
///
/// Requests for the same node that hash to the same value share a batch, and
/// every frame they were requested on is appended to it. A node requiring
/// sequence execution gets one batch for all of its frames, kept in ascending
/// frame order. Tasks hashing to [`Hash32::NULL`] never get a batch, their pre
/// tasks stand in for them.
///
/// A cycle anywhere in the requested tasks fails the whole build; the builder
/// should be dropped at that point.
#[derive(Default)]
pub struct BatchGraphBuilder {
    batches: Vec<TaskBatch>,
    lookup: HashMap<BatchKey, BatchId>,
    noops: HashMap<(NodeId, Hash32), Vec<BatchId>>,
    resolving: HashSet<(NodeId, Hash32)>,
    roots: BatchSet,
}

impl BatchGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests every task on every frame, frames first.
    pub fn add_tasks(
        &mut self,
        tasks: &[Arc<dyn TaskSpec>],
        frames: &FrameList,
        context: &Context,
    ) -> Result<(), CycleError> {
        for &frame in frames.iter() {
            let context = context.with_frame(frame);
            for node in tasks {
                self.add_task(&Task::new(node.clone(), context.clone()))?;
            }
        }
        Ok(())
    }

    pub fn add_task(&mut self, task: &Task) -> Result<(), CycleError> {
        for id in self.walk(task, &mut Vec::new())? {
            self.roots.insert(id);
        }
        Ok(())
    }

    /// Orders the batches for execution and splits them into chunks.
    pub fn finish(self) -> Result<DispatchGraph, CycleError> {
        let order = order::linearize(&self.batches, &self.roots)?;

        let mut batches = self.batches;
        for batch in &mut batches {
            batch.chunks = chunk::layout(batch);
        }

        tracing::debug!(batches = batches.len(), roots = self.roots.len(), "batch graph ready");

        Ok(DispatchGraph {
            batches,
            roots: self.roots.into_vec(),
            order,
        })
    }

    fn walk(&mut self, task: &Task, path: &mut Vec<PathKey>) -> Result<Vec<BatchId>, CycleError> {
        let hash = task.hash();
        if hash.is_null() {
            return self.walk_noop(task, path);
        }

        let node = task.node();
        let key = match node.requires_sequence_execution() {
            true => BatchKey::Sequence(node.id()),
            false => BatchKey::Hashed(node.id(), hash),
        };

        if path.contains(&PathKey::Batch(key)) {
            return Err(cycle(node));
        }

        let (id, added) = self.acquire(key, task, hash);
        if !added {
            return Ok(vec![id]);
        }

        if task.dispatcher_config().immediate {
            self.batches[id.0].immediate = true;
        }

        path.push(PathKey::Batch(key));
        let dependencies = self.walk_dependencies(task, path);
        path.pop();
        let (pre, post) = dependencies?;

        for post in post {
            self.link_post(id, post);
        }

        let batch = &mut self.batches[id.0];
        for pre in pre {
            batch.pre.insert(pre);
        }

        Ok(vec![id])
    }

    fn walk_noop(&mut self, task: &Task, path: &mut Vec<PathKey>) -> Result<Vec<BatchId>, CycleError> {
        let node = task.node();
        let key = (node.id(), task.context().hash());

        if path.contains(&PathKey::NoOp(key.0, key.1)) {
            return Err(cycle(node));
        }

        if let Some(resolved) = self.noops.get(&key) {
            return Ok(resolved.clone());
        }

        // Reached again through its own post tasks.
        if !self.resolving.insert(key) {
            return Ok(Vec::new());
        }

        path.push(PathKey::NoOp(key.0, key.1));
        let dependencies = self.walk_dependencies(task, path);
        path.pop();
        self.resolving.remove(&key);
        let (pre, post) = dependencies?;

        tracing::debug!(node = %node.name(), pre = pre.len(), post = post.len(), "no-op resolved");

        for post in post {
            for &owner in &pre {
                self.link_post(owner, post);
            }
            self.roots.insert(post);
        }

        self.noops.insert(key, pre.clone());
        Ok(pre)
    }

    /// Resolves `(pre, post)` batches of a task. Post tasks start a fresh path, and
    /// count as in progress while the pre tasks are resolved.
    fn walk_dependencies(
        &mut self,
        task: &Task,
        path: &mut Vec<PathKey>,
    ) -> Result<(Vec<BatchId>, Vec<BatchId>), CycleError> {
        let post = self.walk_all(&task.post_tasks(), &mut Vec::new())?;

        let depth = path.len();
        path.extend(post.iter().map(|id| PathKey::Batch(self.batches[id.0].key)));
        let pre = self.walk_all(&task.pre_tasks(), path);
        path.truncate(depth);

        Ok((pre?, post))
    }

    fn walk_all(&mut self, tasks: &[Task], path: &mut Vec<PathKey>) -> Result<Vec<BatchId>, CycleError> {
        let mut out = BatchSet::default();
        for task in tasks {
            for id in self.walk(task, path)? {
                out.insert(id);
            }
        }
        Ok(out.into_vec())
    }

    /// Finds or creates the batch for `key` and attaches the task's context to it.
    /// Returns whether the context is new to the batch.
    fn acquire(&mut self, key: BatchKey, task: &Task, hash: Hash32) -> (BatchId, bool) {
        let id = match self.lookup.get(&key) {
            Some(&id) => id,
            None => {
                let id = BatchId(self.batches.len());
                self.batches
                    .push(TaskBatch::new(key, task.node().clone(), hash));
                self.lookup.insert(key, id);
                id
            }
        };

        let context = task.context();
        let batch = &mut self.batches[id.0];
        if !batch.context_hashes.insert(context.hash()) {
            return (id, false);
        }

        match key {
            BatchKey::Sequence(_) => {
                let frame = context.frame();
                let at = batch.contexts.partition_point(|c| c.frame() < frame);
                batch.contexts.insert(at, context.clone());
            }
            BatchKey::Hashed(..) => batch.contexts.push(context.clone()),
        }

        tracing::debug!(
            node = %batch.node.name(),
            frame = context.frame(),
            frames = batch.contexts.len(),
            "context attached to batch"
        );

        (id, true)
    }

    fn link_post(&mut self, owner: BatchId, post: BatchId) {
        self.batches[owner.0].post.insert(post);
        self.batches[post.0].post_of.insert(owner);
    }
}

fn cycle(node: &Arc<dyn TaskSpec>) -> CycleError {
    CycleError::Dispatch { node: node.name() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Log, LoggingTask};

    fn build(tasks: &[Arc<dyn TaskSpec>], frames: &str) -> Result<DispatchGraph, CycleError> {
        let mut builder = BatchGraphBuilder::new();
        builder.add_tasks(tasks, &FrameList::parse(frames).unwrap(), &Context::new())?;
        builder.finish()
    }

    fn frames_of(graph: &DispatchGraph, name: &str) -> Vec<Vec<i64>> {
        graph
            .iter()
            .filter(|(_, batch)| batch.name() == name)
            .map(|(_, batch)| batch.frames().into_vec())
            .collect()
    }

    #[test]
    fn test_same_request_twice_is_one_batch() {
        let log = Log::default();
        let a = LoggingTask::new("a", &log).shared();

        let graph = build(&[a.clone(), a], "1").unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.roots().len(), 1);
        assert_eq!(frames_of(&graph, "a"), [vec![1]]);
    }

    #[test]
    fn test_shared_pre_task_is_one_batch() {
        let log = Log::default();
        let shared = LoggingTask::new("shared", &log).shared();
        let a = LoggingTask::new("a", &log).shared();
        let b = LoggingTask::new("b", &log).shared();
        a.add_pre(shared.clone());
        b.add_pre(shared);

        let graph = build(&[a, b], "1").unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(frames_of(&graph, "shared"), [vec![1]]);
    }

    #[test]
    fn test_frame_independent_hash_merges_frames() {
        let log = Log::default();
        let merged = LoggingTask::new("merged", &log).frame_independent().shared();
        let split = LoggingTask::new("split", &log).shared();

        let graph = build(&[merged, split], "1-3").unwrap();
        assert_eq!(frames_of(&graph, "merged"), [vec![1, 2, 3]]);
        assert_eq!(frames_of(&graph, "split"), [vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_sequence_batch_is_sorted() {
        let log = Log::default();
        let seq = LoggingTask::new("seq", &log).sequence().shared();
        let merged = LoggingTask::new("merged", &log).frame_independent().shared();

        let graph = build(&[seq, merged], "2,6,4").unwrap();
        assert_eq!(frames_of(&graph, "seq"), [vec![2, 4, 6]]);
        assert_eq!(frames_of(&graph, "merged"), [vec![2, 6, 4]]);
        assert!(graph.iter().any(|(_, batch)| batch.is_sequence()));
    }

    #[test]
    fn test_noop_is_replaced_by_its_pre_tasks() {
        let log = Log::default();
        let list = LoggingTask::new("list", &log).noop().shared();
        let a = LoggingTask::new("a", &log).shared();
        let b = LoggingTask::new("b", &log).shared();
        list.add_pre(a);
        list.add_pre(b);

        let graph = build(&[list], "1-2").unwrap();
        assert_eq!(graph.len(), 4);
        assert!(frames_of(&graph, "list").is_empty());
        assert_eq!(graph.roots().len(), 4);
        // Independent siblings stay independent.
        assert!(graph.iter().all(|(_, batch)| batch.pre_tasks().is_empty()));
    }

    #[test]
    fn test_noop_in_the_middle() {
        let log = Log::default();
        let top = LoggingTask::new("top", &log).shared();
        let list = LoggingTask::new("list", &log).noop().shared();
        let leaf = LoggingTask::new("leaf", &log).shared();
        top.add_pre(list.clone());
        list.add_pre(leaf);

        let graph = build(&[top], "1").unwrap();
        let names: Vec<_> = graph.iter().map(|(_, batch)| batch.name()).collect();
        assert_eq!(names, ["leaf", "top"]);

        let (_, top) = graph.iter().last().unwrap();
        assert_eq!(graph.batch(top.pre_tasks()[0]).name(), "leaf");
    }

    #[test]
    fn test_post_tasks_of_noop_follow_its_pre_tasks() {
        let log = Log::default();
        let list = LoggingTask::new("list", &log).noop().shared();
        let a = LoggingTask::new("a", &log).shared();
        let p = LoggingTask::new("p", &log).shared();
        list.add_pre(a);
        list.add_post(p);

        let graph = build(&[list], "1").unwrap();
        let names: Vec<_> = graph.iter().map(|(_, batch)| batch.name()).collect();
        assert_eq!(names, ["a", "p"]);

        let (_, p) = graph.iter().last().unwrap();
        assert_eq!(p.owners().len(), 1);
    }

    #[test]
    fn test_pre_cycle_is_rejected() {
        let log = Log::default();
        let a = LoggingTask::new("a", &log).shared();
        let b = LoggingTask::new("b", &log).shared();
        let c = LoggingTask::new("c", &log).shared();
        a.add_pre(b.clone());
        b.add_pre(c.clone());
        c.add_pre(a.clone());

        let err = build(&[a], "1").unwrap_err();
        assert!(matches!(err, CycleError::Dispatch { .. }));
    }

    #[test]
    fn test_cycle_through_merged_frames_is_rejected() {
        let log = Log::default();
        let a = LoggingTask::new("a", &log).frame_independent().shared();
        let b = LoggingTask::new("b", &log).shared();
        a.add_pre(b.clone());
        b.add_pre_in(a.clone(), Context::new().with_frame(5));

        assert!(build(&[a], "1").is_err());
    }

    #[test]
    fn test_cycle_through_noop_is_rejected() {
        let log = Log::default();
        let a = LoggingTask::new("a", &log).shared();
        let list = LoggingTask::new("list", &log).noop().shared();
        a.add_pre(list.clone());
        list.add_pre(a.clone());

        assert!(build(&[a], "1").is_err());
    }

    #[test]
    fn test_pre_and_post_of_the_same_task_is_a_cycle() {
        let log = Log::default();
        let a = LoggingTask::new("a", &log).shared();
        let b = LoggingTask::new("b", &log).shared();
        b.add_pre(a.clone());
        b.add_post(a);

        let err = build(&[b], "1").unwrap_err();
        assert_eq!(err, CycleError::Dispatch { node: "a".into() });
    }

    #[test]
    fn test_post_task_of_its_own_pre_task_is_allowed() {
        let log = Log::default();
        let a = LoggingTask::new("a", &log).shared();
        let b = LoggingTask::new("b", &log).shared();
        a.add_pre(b.clone());
        b.add_post(a.clone());

        let graph = build(&[a], "1").unwrap();
        let names: Vec<_> = graph.iter().map(|(_, batch)| batch.name()).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn test_mutual_post_tasks_are_a_cycle() {
        let log = Log::default();
        let a = LoggingTask::new("a", &log).shared();
        let b = LoggingTask::new("b", &log).shared();
        a.add_post(b.clone());
        b.add_post(a.clone());

        assert!(build(&[a], "1").is_err());
    }

    #[test]
    fn test_immediate_flag_is_collected() {
        let log = Log::default();
        let a = LoggingTask::new("a", &log).immediate().shared();
        let b = LoggingTask::new("b", &log).shared();
        a.add_pre(b);

        let graph = build(&[a], "1").unwrap();
        let flags: Vec<_> = graph
            .iter()
            .map(|(_, batch)| (batch.name(), batch.is_immediate()))
            .collect();
        assert_eq!(flags, [("b".to_string(), false), ("a".to_string(), true)]);
    }

    #[test]
    fn test_graph_hash_ignores_structure() {
        let log = Log::default();
        let a = LoggingTask::new("a", &log).shared();
        let b = LoggingTask::new("b", &log).shared();
        let first = build(&[a.clone(), b.clone()], "1-2").unwrap().hash();
        let second = build(&[b.clone(), a.clone()], "2,1").unwrap().hash();
        assert_eq!(first, second);

        a.add_pre(b.clone());
        let wired = build(&[a.clone(), b], "1-2").unwrap().hash();
        assert_eq!(first, wired);

        let fewer = build(&[a], "1").unwrap().hash();
        assert_ne!(first, fewer);

        let seq = LoggingTask::new("seq", &log).sequence().shared();
        let ascending = build(&[seq.clone()], "1,2").unwrap();
        let descending = build(&[seq], "2,1").unwrap();
        assert_eq!(ascending.iter().next().unwrap().1.frames(), descending.iter().next().unwrap().1.frames());
        assert_eq!(ascending.hash(), descending.hash());
    }

    #[test]
    fn test_many_frames() {
        let log = Log::default();
        let setup = LoggingTask::new("setup", &log).frame_independent().shared();
        let render = LoggingTask::new("render", &log).shared();
        let publish = LoggingTask::new("publish", &log).frame_independent().shared();
        render.add_pre(setup.clone());
        render.add_post(publish.clone());

        let graph = build(&[render], "1-10000").unwrap();
        assert_eq!(graph.len(), 10_002);

        let (_, setup) = graph.iter().next().unwrap();
        assert_eq!(setup.name(), "setup");
        assert_eq!(setup.contexts().len(), 10_000);

        let (_, publish) = graph.iter().last().unwrap();
        assert_eq!(publish.name(), "publish");
        assert_eq!(publish.owners().len(), 10_000);
    }
}
