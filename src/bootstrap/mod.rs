//! Tasks translating "invoke task N" and "run target T of file F" into
//! engine task starts.

mod build_target;
mod script_target;
mod task_invocation;

pub use build_target::{BuildTargetBootstrapper, choose_default_target};
pub use script_target::{
    BuildTargetRunner, ScriptTarget, TargetConfiguration, TargetConfigurationReader, WireTargetReader,
};
pub use task_invocation::{TaskInvocationBootstrapper, TaskInvocationRunner};
