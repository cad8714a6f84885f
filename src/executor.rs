mod diagnostics;

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{TryRecvError, channel};
use std::time::Instant;

use rayon::Yield;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::Context;
use crate::engine::{BatchId, DispatchGraph};
use crate::error::ExecutionError;
use crate::frames::FrameList;
use crate::task::TaskSpec;

pub use diagnostics::{BatchExecution, Diagnostics};

/// Executes the immediate batches together with everything they depend on.
///
/// The set covers the owners and pre tasks of every immediate batch,
/// transitively, plus the post tasks of every batch in it. Batches run in the
/// graph's execution order and are marked executed, so a later walk skips them.
pub(crate) fn run_immediate(
    graph: &mut DispatchGraph,
    diagnostics: &mut Diagnostics,
) -> Result<(), ExecutionError> {
    let wanted = immediate_closure(graph);
    if wanted.is_empty() {
        return Ok(());
    }

    let batches: Vec<BatchId> = graph.pending().filter(|id| wanted.contains(id)).collect();
    tracing::info!(batches = batches.len(), "Executing immediate tasks");

    for id in batches {
        run_batch(graph, id, true, diagnostics)?;
    }

    Ok(())
}

fn immediate_closure(graph: &DispatchGraph) -> HashSet<BatchId> {
    let mut wanted = HashSet::new();
    let mut stack: Vec<BatchId> = graph
        .pending()
        .filter(|&id| graph.batch(id).is_immediate())
        .collect();

    while let Some(id) = stack.pop() {
        let batch = graph.batch(id);
        if batch.is_executed() || !wanted.insert(id) {
            continue;
        }
        stack.extend(batch.dependencies());
        stack.extend(batch.post_tasks().iter().copied());
    }

    wanted
}

/// Walks the graph on the calling thread, one chunk at a time.
pub(crate) fn run_serial(
    graph: &mut DispatchGraph,
    diagnostics: &mut Diagnostics,
) -> Result<(), ExecutionError> {
    let pending: Vec<BatchId> = graph.pending().collect();
    if pending.is_empty() {
        return Ok(());
    }

    let root_span = tracing::span!(Level::INFO, "dispatch");
    root_span.pb_set_length(pending.len() as u64);
    root_span.pb_set_style(&crate::utils::style_dispatch());
    root_span.pb_set_message("Executing tasks...");
    let _enter = root_span.enter();

    let s = Instant::now();
    for id in pending {
        run_batch(graph, id, false, diagnostics)?;
        root_span.pb_inc(1);
    }

    tracing::info!("Executed tasks {}", crate::utils::as_overhead(s));
    Ok(())
}

fn run_batch(
    graph: &mut DispatchGraph,
    id: BatchId,
    immediate: bool,
    diagnostics: &mut Diagnostics,
) -> Result<(), ExecutionError> {
    let batch = graph.batch(id);
    for chunk in batch.chunks() {
        diagnostics.record(execute_chunk(batch.node(), chunk, immediate)?);
    }
    graph.batch_mut(id).executed = true;
    Ok(())
}

fn execute_chunk(
    node: &Arc<dyn TaskSpec>,
    chunk: &[Context],
    immediate: bool,
) -> Result<BatchExecution, ExecutionError> {
    let name = node.name();
    let frames: FrameList = chunk.iter().map(Context::frame).collect();

    let span = tracing::span!(Level::INFO, "task", name = %name);
    span.pb_set_style(&crate::utils::style_batch());
    span.pb_set_message(&format!("Running {name} [{frames}]"));
    let _enter = span.enter();

    tracing::info!(node = %name, %frames, immediate, "Executing");

    let start = Instant::now();
    let result = match catch_unwind(AssertUnwindSafe(|| node.execute(chunk))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            Err(anyhow::anyhow!(msg))
        }
    };
    let duration = start.elapsed();

    match result {
        Ok(()) => Ok(BatchExecution {
            node: name,
            frames,
            start,
            duration,
            immediate,
        }),
        Err(source) => {
            tracing::error!(node = %name, %frames, "{source}");
            Err(ExecutionError {
                node: name,
                frames,
                source,
            })
        }
    }
}

/// Executes the graph on the rayon pool, starting each batch as soon as its
/// owners and pre tasks have completed.
///
/// The scheduler stays on the calling thread and owns the executed flags,
/// workers get the node and their chunks and report back over a channel. The
/// first failure stops new batches from starting; batches already running are
/// allowed to finish.
pub(crate) fn run_parallel(
    graph: &mut DispatchGraph,
    diagnostics: &mut Diagnostics,
) -> Result<(), ExecutionError> {
    let pending: Vec<BatchId> = graph.pending().collect();
    if pending.is_empty() {
        return Ok(());
    }

    let waiting: HashSet<BatchId> = pending.iter().copied().collect();

    // Map from a batch to the batches waiting on it, and how many each one waits on.
    let mut dependents: HashMap<BatchId, Vec<BatchId>> = HashMap::new();
    let mut dependency_counts: HashMap<BatchId, usize> = HashMap::new();
    for &id in &pending {
        let mut count = 0;
        for dependency in graph.batch(id).dependencies() {
            if waiting.contains(&dependency) {
                dependents.entry(dependency).or_default().push(id);
                count += 1;
            }
        }
        dependency_counts.insert(id, count);
    }

    let root_span = tracing::span!(Level::INFO, "dispatch");
    root_span.pb_set_length(pending.len() as u64);
    root_span.pb_set_style(&crate::utils::style_dispatch());
    root_span.pb_set_message("Executing tasks...");
    let _enter = root_span.enter();

    let s = Instant::now();
    let view: &DispatchGraph = graph;
    let mut completed = Vec::with_capacity(pending.len());
    let mut failure = None;

    rayon::scope(|scope| {
        let (result_sender, result_receiver) =
            channel::<(BatchId, Result<Vec<BatchExecution>, ExecutionError>)>();

        let spawn_batch = |id: BatchId| {
            let batch = view.batch(id);
            let node = batch.node().clone();
            let chunks: Vec<Vec<Context>> = batch.chunks().map(<[Context]>::to_vec).collect();
            let sender = result_sender.clone();

            scope.spawn(move |_| {
                let result = chunks
                    .iter()
                    .map(|chunk| execute_chunk(&node, chunk, false))
                    .collect();
                // The scheduler may have stopped listening after a failure.
                let _ = sender.send((id, result));
            });
        };

        let mut in_flight = 0;
        for &id in &pending {
            if dependency_counts.get(&id).copied().unwrap_or(0) == 0 {
                spawn_batch(id);
                in_flight += 1;
            }
        }

        while in_flight > 0 {
            // The scheduler holds a pool thread, run queued batches while waiting.
            let (id, result) = match result_receiver.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) => {
                    if !matches!(rayon::yield_now(), Some(Yield::Executed)) {
                        std::thread::yield_now();
                    }
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
            };
            in_flight -= 1;

            match result {
                Ok(executions) => {
                    executions.into_iter().for_each(|e| diagnostics.record(e));
                    completed.push(id);
                    root_span.pb_inc(1);
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }

            if let Some(next) = dependents.get(&id) {
                for &index in next {
                    if let Some(count) = dependency_counts.get_mut(&index) {
                        *count -= 1;
                        if *count == 0 {
                            spawn_batch(index);
                            in_flight += 1;
                        }
                    }
                }
            }
        }
    });

    for id in completed {
        graph.batch_mut(id).executed = true;
    }

    match failure {
        Some(err) => Err(err),
        None => {
            tracing::info!("Executed tasks {}", crate::utils::as_overhead(s));
            Ok(())
        }
    }
}
