mod change;
mod handle;
pub mod runner;

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::bootstrap::{
    BuildTargetBootstrapper, BuildTargetRunner, TargetConfiguration, TaskInvocationBootstrapper,
    TaskInvocationRunner,
};
use crate::core::{FileContent, Hash32};
use crate::error::ScriptError;
use crate::identifier::{TaskId, TaskName};
use crate::script::ScriptNode;
use crate::task::NamedTaskFactory;
use crate::value::Value;

pub use change::ChangeDetector;
pub use handle::{DependencyHandle, DependencySink};
pub use runner::{
    BuildOutcome, BuildState, Context, Diagnostics, Edge, Engine, EngineBuilder, Environment, FinishedResults,
    TaskExecution, TaskRecord,
};

/// Directories a started task runs with. Relative paths are resolved against
/// the starting task's directories, `None` inherits them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionParameters {
    pub working_directory: Option<Utf8PathBuf>,
    pub build_directory: Option<Utf8PathBuf>,
}

impl ExecutionParameters {
    pub fn in_directory(working_directory: impl Into<Utf8PathBuf>) -> Self {
        Self {
            working_directory: Some(working_directory.into()),
            build_directory: None,
        }
    }
}

/// Read access to task results.
pub trait TaskResolver: Send + Sync {
    /// Waits for `task` and returns its raw result. The access is recorded as a
    /// dependency compared by equality.
    fn task_result(&self, task: &TaskId) -> Result<Value, ScriptError>;

    /// Handle over the raw result of `task`, resolved on first access.
    fn dependency_handle(&self, task: &TaskId) -> DependencyHandle;

    /// Owned resolver for handles that outlive the borrow.
    fn shared(&self) -> Arc<dyn TaskResolver>;
}

/// Everything a running task can ask of the engine.
pub trait TaskContext: TaskResolver {
    fn task_id(&self) -> &TaskId;

    fn working_directory(&self) -> &Utf8Path;

    fn build_directory(&self) -> Option<&Utf8Path>;

    /// Starts `task` unless a task with the same identifier was already started.
    fn start_task(
        &self,
        task: TaskId,
        factory: Factory,
        parameters: Option<ExecutionParameters>,
    ) -> Result<(), ScriptError>;

    /// Records that the output depends on the file at `path` having `hash`, or
    /// on the file being absent if `None`.
    fn report_input_file_dependency(&self, path: &Utf8Path, hash: Option<Hash32>);

    /// Detector the engine applies to this task's own output.
    fn report_self_change_detector(&self, detector: ChangeDetector);

    /// Reads the file at `path`, relative paths against the working directory.
    fn resolve_file(&self, path: &Utf8Path) -> Result<Option<FileContent>, ScriptError>;

    fn target_configuration(&self, file: &FileContent) -> Result<Arc<TargetConfiguration>, ScriptError>;

    /// Looks up a named task. The outcome is recorded so that a change in the
    /// set of available tasks invalidates this task.
    fn lookup_task(
        &self,
        name: &TaskName,
        repository: Option<&str>,
    ) -> Result<Arc<dyn NamedTaskFactory>, ScriptError>;

    fn set_display(&self, display: &str);

    fn warn(&self, message: String);

    /// Fails this task with `error` once it returns, whatever it returns.
    fn abort(&self, error: ScriptError);
}

/// Description of a unit of work. Equal factories under the same identifier
/// produce the same result given unchanged dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Factory {
    Script(ScriptNode),
    InvocationBootstrapper(TaskInvocationBootstrapper),
    InvocationRunner(TaskInvocationRunner),
    BuildTargetBootstrapper(BuildTargetBootstrapper),
    BuildTargetRunner(BuildTargetRunner),
}

impl Factory {
    pub fn run(&self, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
        match self {
            Factory::Script(node) => node.run(ctx),
            Factory::InvocationBootstrapper(bootstrapper) => bootstrapper.run(ctx),
            Factory::InvocationRunner(runner) => runner.run(ctx),
            Factory::BuildTargetBootstrapper(bootstrapper) => bootstrapper.run(ctx),
            Factory::BuildTargetRunner(runner) => runner.run(ctx),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Factory::Script(node) => node.label(),
            Factory::InvocationBootstrapper(bootstrapper) => format!("invoke {}", bootstrapper.name),
            Factory::InvocationRunner(runner) => format!("run {}", runner.name),
            Factory::BuildTargetBootstrapper(bootstrapper) => format!("bootstrap {}", bootstrapper.file),
            Factory::BuildTargetRunner(runner) => format!("target {}", runner.target),
        }
    }
}

impl From<ScriptNode> for Factory {
    fn from(node: ScriptNode) -> Self {
        Factory::Script(node)
    }
}
