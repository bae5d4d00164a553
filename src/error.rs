use std::fmt::{Display, Formatter};
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::identifier::TaskId;

/// Error returned by a user task, shareable between every task waiting on it.
#[derive(Debug, Clone)]
pub struct TaskError(pub(crate) Arc<anyhow::Error>);

impl TaskError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The script error a user task propagated with `?`, if that is what failed it.
    pub fn script_error(&self) -> Option<&ScriptError> {
        self.0.downcast_ref::<ScriptError>()
    }
}

impl Display for TaskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError(Arc::new(e))
    }
}

#[derive(Debug, Error, Clone)]
pub enum ScriptError {
    /// Invalid declaration, detected before any sub-task of the declaration is started.
    #[error("{0}")]
    Configuration(String),

    #[error("{message}")]
    NotFound {
        message: String,
        searched: String,
        available: Vec<String>,
    },

    /// A failure while evaluating an operand, tagged with the operand's task.
    #[error("{message}")]
    OperandEvaluation {
        message: String,
        task: TaskId,
        #[source]
        cause: Option<Box<ScriptError>>,
    },

    #[error("Internal consistency failure: {0}")]
    InternalConsistency(String),

    /// Another task this one waited on has failed.
    #[error("Task {task} failed:\n{cause}")]
    TaskFailed {
        task: TaskId,
        #[source]
        cause: Box<ScriptError>,
    },

    #[error("Execution deadlocked while waiting for task {0}")]
    Deadlock(TaskId),

    #[error("Invalid dependency handle usage: {0}")]
    HandleUsage(&'static str),

    #[error("Execution aborted: {0}")]
    Aborted(String),

    #[error("I/O error at '{path}': {source}")]
    Io {
        path: Utf8PathBuf,
        source: Arc<std::io::Error>,
    },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Userland(#[from] TaskError),
}

impl ScriptError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn operand(message: impl Into<String>, task: TaskId) -> Self {
        Self::OperandEvaluation {
            message: message.into(),
            task,
            cause: None,
        }
    }

    pub fn operand_caused(message: impl Into<String>, task: TaskId, cause: ScriptError) -> Self {
        Self::OperandEvaluation {
            message: message.into(),
            task,
            cause: Some(Box::new(cause)),
        }
    }

    pub fn not_found(
        message: impl Into<String>,
        searched: impl Into<String>,
        available: impl IntoIterator<Item = String>,
    ) -> Self {
        Self::NotFound {
            message: message.into(),
            searched: searched.into(),
            available: available.into_iter().collect(),
        }
    }

    pub(crate) fn io(path: impl Into<Utf8PathBuf>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(err),
        }
    }

    /// The task this failure was inherited from, if it happened because a
    /// dependency failed rather than in the task itself.
    pub fn failed_dependency(&self) -> Option<&TaskId> {
        match self {
            ScriptError::TaskFailed { task, .. } => Some(task),
            ScriptError::OperandEvaluation {
                cause: Some(cause), ..
            } => cause.failed_dependency(),
            ScriptError::Userland(err) => err.script_error()?.failed_dependency(),
            _ => None,
        }
    }

    /// Whether the failure only reports that waiting for another task could
    /// never complete.
    pub fn is_deadlock(&self) -> bool {
        match self {
            ScriptError::Deadlock(_) => true,
            ScriptError::OperandEvaluation {
                cause: Some(cause), ..
            } => cause.is_deadlock(),
            ScriptError::Userland(err) => err.script_error().is_some_and(ScriptError::is_deadlock),
            _ => false,
        }
    }

    /// Innermost error, looking through dependency failures and operand wrappers.
    pub fn root_cause(&self) -> &ScriptError {
        match self {
            ScriptError::TaskFailed { cause, .. } => cause.root_cause(),
            ScriptError::OperandEvaluation {
                cause: Some(cause), ..
            } => cause.root_cause(),
            ScriptError::Userland(err) => match err.script_error() {
                Some(inner) => inner.root_cause(),
                None => self,
            },
            other => other,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Unrecognized envelope, expected the kumiki magic header")]
    Magic,

    #[error("Envelope is truncated")]
    Truncated,

    #[error("Unsupported wire format version {found}, expected {expected}")]
    Version { found: u8, expected: u8 },

    #[error("Unknown kind tag {0:#04x}")]
    UnknownTag(u8),

    #[error("Kind tag {header:#04x} does not match the encoded body kind {body:#04x}")]
    TagMismatch { header: u8, body: u8 },

    #[error("Couldn't encode value.\n{0}")]
    Encode(String),

    #[error("Couldn't decode value.\n{0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_failed(task: &str, cause: ScriptError) -> ScriptError {
        ScriptError::TaskFailed {
            task: TaskId::named(task),
            cause: Box::new(cause),
        }
    }

    #[test]
    fn test_failed_dependency_through_operand() {
        let err = ScriptError::operand_caused(
            "Condition failed to evaluate.",
            TaskId::named("cond"),
            make_failed("upstream", ScriptError::configuration("bad")),
        );

        assert_eq!(err.failed_dependency(), Some(&TaskId::named("upstream")));
        assert!(matches!(err.root_cause(), ScriptError::Configuration(msg) if msg == "bad"));
    }

    #[test]
    fn test_operand_without_cause_is_root() {
        let err = ScriptError::operand("Iterable is null.", TaskId::named("it"));

        assert!(err.failed_dependency().is_none());
        assert!(!err.is_deadlock());
        assert_eq!(err.to_string(), "Iterable is null.");
    }

    #[test]
    fn test_deadlock_detection() {
        let err = ScriptError::operand_caused(
            "Iterable failed to evaluate.",
            TaskId::named("it"),
            ScriptError::Deadlock(TaskId::named("never")),
        );

        assert!(err.is_deadlock());
    }

    #[test]
    fn test_user_task_propagating_a_failure() {
        let propagated: anyhow::Error = make_failed("upstream", ScriptError::configuration("bad")).into();
        let err = ScriptError::Userland(TaskError::new(propagated.context("while copying")));

        assert_eq!(err.failed_dependency(), Some(&TaskId::named("upstream")));
        assert!(matches!(err.root_cause(), ScriptError::Configuration(msg) if msg == "bad"));

        let deadlocked: anyhow::Error = ScriptError::Deadlock(TaskId::named("never")).into();
        assert!(ScriptError::Userland(TaskError::new(deadlocked)).is_deadlock());

        let own = ScriptError::Userland(TaskError::new(anyhow::anyhow!("disk full")));
        assert!(own.failed_dependency().is_none());
        assert!(matches!(own.root_cause(), ScriptError::Userland(_)));
    }
}
