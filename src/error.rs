use thiserror::Error;

use crate::frames::FrameList;

pub use anyhow::Error as RuntimeError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    FrameRange(#[from] FrameRangeError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Couldn't create the job directory.\n{0}")]
    JobDirectory(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Dispatcher: no tasks were requested")]
    NoTasks,

    #[error("Dispatcher: '{0}' and '{1}' belong to different documents")]
    MixedDocuments(String, String),

    #[error("Dispatcher: '{0}' is not a task node")]
    NotTaskProducing(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CycleError {
    /// Found while building the batch graph; nothing has been executed.
    #[error("Dispatched tasks cannot have cyclic dependencies but {node} is involved in a cycle.")]
    Dispatch { node: String },

    /// Found while wiring a connection; the connection was not made.
    #[error("Cycle detected between {node} and {upstream}")]
    Connection { node: String, upstream: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Dispatcher: custom frame range '{expression}' is not a valid frame list ({reason})")]
pub struct FrameRangeError {
    pub expression: String,
    pub reason: String,
}

impl FrameRangeError {
    pub(crate) fn new(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            reason: reason.into(),
        }
    }
}

/// Error raised by a task body, kept verbatim in `source`.
#[derive(Debug, Error)]
#[error("Task '{node}' failed on frames {frames}:\n{source}")]
pub struct ExecutionError {
    pub node: String,
    pub frames: FrameList,
    #[source]
    pub source: anyhow::Error,
}
