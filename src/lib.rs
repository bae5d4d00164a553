#![forbid(unsafe_code)]
//! Execution core of an incremental build engine.
//!
//! Build scripts are turned into a graph of [`ScriptNode`] tasks. Each task
//! runs under a [`TaskId`] and may start further tasks, read the results of
//! others, and report the files it read. Tasks don't block on the values
//! flowing through them: a result can be a [`StructuredTaskResult`], a lazy
//! description (list, map, reference to another task, variable) that is only
//! unwrapped by whoever actually consumes the value. Every unwrapping step is
//! recorded as a dependency with a [`ChangeDetector`], so that the next build
//! reruns exactly the tasks whose observed inputs changed.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kumiki::{BuildTargetBootstrapper, Engine, Factory, TaskRegistry};
//!
//! let registry = TaskRegistry::new();
//! let engine = Engine::builder().repository(Arc::new(registry)).build();
//!
//! let bootstrapper = BuildTargetBootstrapper::new("/work/build.kmk", None, Default::default())?;
//! let outcome = engine.execute(bootstrapper.id(), Factory::BuildTargetBootstrapper(bootstrapper));
//!
//! print!("{}", outcome.diagnostics.report());
//! # Ok::<(), kumiki::ScriptError>(())
//! ```

mod core;
mod error;
mod identifier;
mod structured;
mod task;
mod utils;
mod value;

pub mod bootstrap;
pub mod engine;
pub mod metadata;
pub mod script;
pub mod wire;

pub use crate::bootstrap::{
    BuildTargetBootstrapper, ScriptTarget, TargetConfiguration, TaskInvocationBootstrapper,
};
pub use crate::core::{FileContent, Hash32};
pub use crate::engine::{
    BuildOutcome, BuildState, ChangeDetector, DependencyHandle, Engine, EngineBuilder, ExecutionParameters, Factory,
    TaskContext, TaskResolver,
};
pub use crate::error::{ScriptError, TaskError, WireError};
pub use crate::identifier::{EntryField, IterationStamp, TaskId, TaskIdKind, TaskName};
pub use crate::script::ScriptNode;
pub use crate::structured::{
    ComposedResult, Resolution, StructuredTaskResult, actual_task_result, actual_task_result_handle,
    resolve_composition,
};
pub use crate::task::{NamedTaskFactory, ParameterizableTask, Task, TaskRegistry, TaskRepository};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::value::{Value, ValueKind};
