use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{Context, JOB_DIRECTORY};
use crate::engine::{BatchGraphBuilder, DispatchGraph};
use crate::error::{ConfigurationError, DispatchError, ExecutionError, FrameRangeError};
use crate::executor::{self, Diagnostics};
use crate::frames::{FrameList, FrameRange, FrameRangeResolver, FramesMode};
use crate::task::TaskSpec;

type PreDispatchFn = dyn Fn(&[Arc<dyn TaskSpec>], &Context) -> anyhow::Result<bool> + Send + Sync;
type DispatchFn = dyn Fn(&[Arc<dyn TaskSpec>], &Context) -> anyhow::Result<()> + Send + Sync;
type PostDispatchFn = dyn Fn(&[Arc<dyn TaskSpec>], &Context, bool) -> anyhow::Result<()> + Send + Sync;

/// Callbacks run around a dispatch. Nested dispatches run none of them.
///
/// A hook returning an error is logged and otherwise ignored.
pub enum Hook {
    /// Runs first, returning `true` cancels the dispatch.
    PreDispatch(Box<PreDispatchFn>),
    /// Runs once the job context is ready, before any task executes.
    Dispatch(Box<DispatchFn>),
    /// Runs last whenever the pre-dispatch hooks ran, with whether the dispatch succeeded.
    PostDispatch(Box<PostDispatchFn>),
}

impl Hook {
    pub fn pre_dispatch<F>(fun: F) -> Self
    where
        F: Fn(&[Arc<dyn TaskSpec>], &Context) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Hook::PreDispatch(Box::new(fun))
    }

    /// The context passed to `fun` carries the job directory, when one was created.
    pub fn dispatch<F>(fun: F) -> Self
    where
        F: Fn(&[Arc<dyn TaskSpec>], &Context) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Hook::Dispatch(Box::new(fun))
    }

    pub fn post_dispatch<F>(fun: F) -> Self
    where
        F: Fn(&[Arc<dyn TaskSpec>], &Context, bool) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Hook::PostDispatch(Box::new(fun))
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Hook::PreDispatch(_) => write!(f, "Hook::PreDispatch(*)"),
            Hook::Dispatch(_) => write!(f, "Hook::Dispatch(*)"),
            Hook::PostDispatch(_) => write!(f, "Hook::PostDispatch(*)"),
        }
    }
}

/// Where the batches left after the immediate pass are sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Local,
    Parallel,
    Null,
}

impl BackendKind {
    fn backend(self) -> Box<dyn Backend> {
        match self {
            BackendKind::Local => Box::new(LocalBackend),
            BackendKind::Parallel => Box::new(ParallelBackend),
            BackendKind::Null => Box::new(NullBackend),
        }
    }
}

/// Runs, or hands off, the deferred part of a dispatch.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn spool(&self, graph: &mut DispatchGraph, diagnostics: &mut Diagnostics) -> Result<(), ExecutionError>;
}

/// Executes batches one after another on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn spool(&self, graph: &mut DispatchGraph, diagnostics: &mut Diagnostics) -> Result<(), ExecutionError> {
        executor::run_serial(graph, diagnostics)
    }
}

/// Executes independent batches concurrently on the rayon pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelBackend;

impl Backend for ParallelBackend {
    fn name(&self) -> &str {
        "parallel"
    }

    fn spool(&self, graph: &mut DispatchGraph, diagnostics: &mut Diagnostics) -> Result<(), ExecutionError> {
        executor::run_parallel(graph, diagnostics)
    }
}

/// Drops the deferred batches, only immediate work runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend;

impl Backend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn spool(&self, graph: &mut DispatchGraph, _: &mut Diagnostics) -> Result<(), ExecutionError> {
        tracing::debug!(batches = graph.pending().count(), "discarding deferred batches");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub frames_mode: FramesMode,
    /// Frame list expression used by [`FramesMode::CustomRange`].
    pub frame_range: String,
    pub job_name: String,
    /// Root of the numbered job directories, none are created when unset.
    pub jobs_directory: Option<Utf8PathBuf>,
    pub backend: BackendKind,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            frames_mode: FramesMode::CurrentFrame,
            frame_range: String::from("1-100x10"),
            job_name: String::new(),
            jobs_directory: None,
            backend: BackendKind::Local,
        }
    }
}

impl DispatcherSettings {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Turns requested tasks into batches and executes them.
///
/// A dispatch resolves the frames to request, builds the batch graph, runs the
/// immediate batches and hands whatever is left to its [`Backend`].
///
/// # Example
///
/// ```rust
/// use taskspool::{Blueprint, Dispatcher, DispatcherSettings, FramesMode};
///
/// let mut blueprint = Blueprint::new();
/// let render = blueprint.task().name("render").run(|contexts| {
///     println!("rendering {} frames", contexts.len());
///     Ok(())
/// });
///
/// let dispatcher = Dispatcher::new(DispatcherSettings {
///     frames_mode: FramesMode::CustomRange,
///     frame_range: "1-10".into(),
///     ..Default::default()
/// });
///
/// let diagnostics = dispatcher
///     .dispatch(&[blueprint.spec(render)], &blueprint.context())
///     .unwrap();
/// assert_eq!(diagnostics.executions.len(), 10);
/// ```
pub struct Dispatcher {
    settings: DispatcherSettings,
    resolver: Box<dyn FrameRangeResolver>,
    backend: Box<dyn Backend>,
    hooks: Vec<Hook>,
}

impl Dispatcher {
    pub fn new(settings: DispatcherSettings) -> Self {
        Self {
            resolver: Box::new(FrameRange::new(settings.frames_mode, settings.frame_range.clone())),
            backend: settings.backend.backend(),
            hooks: Vec::new(),
            settings,
        }
    }

    pub fn with_resolver(mut self, resolver: impl FrameRangeResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn with_backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Box::new(backend);
        self
    }

    pub fn add_hook(mut self, hook: Hook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// The frames a dispatch in `context` would request.
    pub fn frame_range(&self, context: &Context) -> Result<FrameList, FrameRangeError> {
        self.resolver.frame_range(context)
    }

    /// Builds the batch graph a dispatch would execute, without executing anything.
    pub fn plan(&self, tasks: &[Arc<dyn TaskSpec>], context: &Context) -> Result<DispatchGraph, DispatchError> {
        validate(tasks)?;
        self.build(tasks, context)
    }

    pub fn dispatch(&self, tasks: &[Arc<dyn TaskSpec>], context: &Context) -> Result<Diagnostics, DispatchError> {
        validate(tasks)?;

        if context.contains(JOB_DIRECTORY) {
            return self.run(tasks, context, true);
        }

        for hook in &self.hooks {
            if let Hook::PreDispatch(callback) = hook
                && report(callback(tasks, context), "pre-dispatch").unwrap_or(false)
            {
                tracing::info!("Dispatch cancelled by a pre-dispatch hook");
                self.post_dispatch(tasks, context, false);
                return Ok(Diagnostics::cancelled());
            }
        }

        let result = self.run(tasks, context, false);
        self.post_dispatch(tasks, context, result.is_ok());
        result
    }

    fn post_dispatch(&self, tasks: &[Arc<dyn TaskSpec>], context: &Context, success: bool) {
        for hook in &self.hooks {
            if let Hook::PostDispatch(callback) = hook {
                report(callback(tasks, context, success), "post-dispatch");
            }
        }
    }

    fn run(&self, tasks: &[Arc<dyn TaskSpec>], context: &Context, nested: bool) -> Result<Diagnostics, DispatchError> {
        let s = Instant::now();

        let job_directory = self.job_directory(context)?;
        let job_context = match &job_directory {
            Some(directory) => context.with(JOB_DIRECTORY, directory.as_str()),
            None => context.clone(),
        };

        if !nested {
            for hook in &self.hooks {
                if let Hook::Dispatch(callback) = hook {
                    report(callback(tasks, &job_context), "dispatch");
                }
            }
        }

        let mut graph = self.build(tasks, &job_context)?;
        let mut diagnostics = Diagnostics {
            batches: graph.len(),
            job_directory,
            ..Diagnostics::default()
        };

        executor::run_immediate(&mut graph, &mut diagnostics)?;

        if graph.pending().next().is_some() {
            tracing::debug!(backend = self.backend.name(), "spooling deferred batches");
            self.backend.spool(&mut graph, &mut diagnostics)?;
        }

        tracing::info!(
            batches = diagnostics.batches,
            executions = diagnostics.executions.len(),
            "Dispatch finished {}",
            crate::utils::as_overhead(s)
        );

        Ok(diagnostics)
    }

    fn build(&self, tasks: &[Arc<dyn TaskSpec>], context: &Context) -> Result<DispatchGraph, DispatchError> {
        let frames = self.frame_range(context)?;
        tracing::debug!(%frames, tasks = tasks.len(), "building batch graph");

        let mut builder = BatchGraphBuilder::new();
        builder.add_tasks(tasks, &frames, context)?;
        Ok(builder.finish()?)
    }

    /// Creates `<jobs_directory>/<job_name>/NNNNNN` with the next free number. A
    /// nested dispatch reuses the outer directory when it lives in the same place.
    fn job_directory(&self, context: &Context) -> std::io::Result<Option<Utf8PathBuf>> {
        let outer = context.get_str(JOB_DIRECTORY).map(Utf8Path::new);

        let Some(jobs) = &self.settings.jobs_directory else {
            return Ok(outer.map(Utf8Path::to_path_buf));
        };

        let mut base = jobs.clone();
        if !self.settings.job_name.is_empty() {
            base.push(context.substitute(&self.settings.job_name));
        }

        if let Some(outer) = outer
            && outer.parent() == Some(base.as_path())
        {
            return Ok(Some(outer.to_path_buf()));
        }

        fs::create_dir_all(&base)?;

        let mut highest = -1;
        for entry in base.read_dir_utf8()? {
            if let Some(number) = leading_number(entry?.file_name()) {
                highest = highest.max(number);
            }
        }

        // Another process may claim a number between the scan and the create.
        loop {
            highest += 1;
            let directory = base.join(format!("{highest:06}"));
            match fs::create_dir(&directory) {
                Ok(()) => {
                    tracing::debug!(%directory, "created job directory");
                    return Ok(Some(directory));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

/// Logs a failed hook, the dispatch carries on without its result.
fn report<T>(result: anyhow::Result<T>, stage: &str) -> Option<T> {
    result
        .inspect_err(|err| tracing::error!(stage, "Hook failed: {err:#}"))
        .ok()
}

fn leading_number(name: &str) -> Option<i64> {
    let digits = name.bytes().take_while(u8::is_ascii_digit).count();
    name[..digits].parse().ok()
}

fn validate(tasks: &[Arc<dyn TaskSpec>]) -> Result<(), ConfigurationError> {
    let Some(first) = tasks.first() else {
        return Err(ConfigurationError::NoTasks);
    };

    for task in &tasks[1..] {
        if task.document() != first.document() {
            return Err(ConfigurationError::MixedDocuments(first.name(), task.name()));
        }
    }

    Ok(())
}
