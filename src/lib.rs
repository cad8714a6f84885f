#![forbid(unsafe_code)]
//! Frame-aware task dispatching.
//!
//! Tasks are requested for a list of frames. Every `(task, context)` pair is
//! expanded into the tasks it depends on, identical work is merged by hash, and
//! the resulting batches are executed in dependency order, optionally several
//! frames per call.
//!
//! The usual entry points are a [`Blueprint`], which describes a graph of named
//! nodes, and a [`Dispatcher`], which turns the requested nodes into a
//! [`DispatchGraph`] and executes it on a [`Backend`]. Anything implementing
//! [`TaskSpec`] can be dispatched, blueprints are just one source of tasks.
//!
//! ```rust
//! use taskspool::{Blueprint, Dispatcher, DispatcherSettings, FramesMode};
//!
//! let mut blueprint = Blueprint::new();
//! let cache = blueprint
//!     .task()
//!     .name("cache")
//!     .vars([])
//!     .batch_size(5)
//!     .run(|contexts| {
//!         assert!(contexts.len() <= 5);
//!         Ok(())
//!     });
//! let render = blueprint.task().name("render").run(|_| Ok(()));
//! blueprint.connect_pre(render, cache).unwrap();
//!
//! let dispatcher = Dispatcher::new(DispatcherSettings {
//!     frames_mode: FramesMode::CustomRange,
//!     frame_range: "1-10".into(),
//!     ..Default::default()
//! });
//!
//! let graph = dispatcher
//!     .plan(&[blueprint.spec(render)], &blueprint.context())
//!     .unwrap();
//!
//! // One cache batch holding all ten frames, one render batch per frame.
//! assert_eq!(graph.len(), 11);
//! assert_eq!(graph.iter().next().unwrap().1.chunks().count(), 2);
//! ```

mod blueprint;
mod core;
mod dispatcher;
mod engine;
mod error;
mod executor;
mod frames;
pub mod nodes;
mod task;
mod utils;

#[cfg(test)]
mod testing;

pub use crate::blueprint::{Blueprint, FnWork, NodeHandle, TaskDef, Work};
pub use crate::core::{
    Blake3Hasher, Context, FRAME, FRAME_RANGE_END, FRAME_RANGE_START, Hash32, JOB_DIRECTORY, Value,
};
pub use crate::dispatcher::{
    Backend, BackendKind, Dispatcher, DispatcherSettings, Hook, LocalBackend, NullBackend,
    ParallelBackend,
};
pub use crate::engine::{BatchGraphBuilder, BatchId, DispatchGraph, TaskBatch};
pub use crate::error::*;
pub use crate::executor::{BatchExecution, Diagnostics};
pub use crate::frames::{
    DEFAULT_END, DEFAULT_START, FrameList, FrameRange, FrameRangeResolver, FramesMode,
};
pub use crate::task::{DispatcherConfig, DocumentId, NodeId, Task, TaskSpec};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
