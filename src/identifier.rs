use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bootstrap::{BuildTargetBootstrapper, TaskInvocationBootstrapper, TaskInvocationRunner};
use crate::error::ScriptError;
use crate::script::ScriptNode;
use crate::value::Value;

/// Key of a unit of work.
///
/// Identifiers are compared structurally. Two starts of the same identifier
/// refer to the same task, so identifiers derived from a parent embed the
/// parent's root identity.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Arc<TaskIdKind>);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskIdKind {
    /// Identifier chosen by the embedding application.
    Named(String),
    /// A script node started on behalf of `root`.
    Script { root: TaskId, node: ScriptNode },
    /// A literal in the scope of `root`.
    Literal { root: TaskId, value: Value },
    /// A foreach local variable of one iteration.
    LocalVariable {
        name: String,
        foreach: TaskId,
        loop_identity: Vec<ScriptNode>,
    },
    /// Element of a plain list iterated by a foreach.
    IterableIndex {
        iterable: TaskId,
        index: u64,
        stamp: IterationStamp,
    },
    /// Key or value of a plain map entry iterated by a foreach.
    MapEntryField {
        iterable: TaskId,
        key: Value,
        field: EntryField,
        stamp: IterationStamp,
    },
    /// Assignment of `variable` in the scope of `root`.
    Assign { root: TaskId, variable: String },
    /// Task defaults visible to the script at `script`.
    TaskDefaults { script: Utf8PathBuf },
    DefaultsLoader { path: Utf8PathBuf },
    /// Root scope of global expressions of a script, where `static` variables live.
    GlobalScope { script: Utf8PathBuf },
    /// Root scope of the `global` variables shared by every script of a build.
    BuildScope,
    /// A literal parameter value passed to a build target from outside of any script.
    BuildTargetParameter {
        file: Utf8PathBuf,
        target: Option<String>,
        name: String,
        value: Value,
    },
    /// A running build target, the root of the target's script tasks.
    BuildFileTarget {
        target: String,
        file: Utf8PathBuf,
        working_directory: Utf8PathBuf,
        parameters: BTreeMap<String, TaskId>,
    },
    BuildTargetBootstrapper(Box<BuildTargetBootstrapper>),
    InvocationBootstrapper(Box<TaskInvocationBootstrapper>),
    InvocationRunner(Box<TaskInvocationRunner>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryField {
    Key,
    Value,
}

/// Fresh token generated for every foreach execution.
///
/// It keys the identifiers of iterated elements that are not plain literals,
/// so that two snapshots of the same iterable never share derived identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IterationStamp(Uuid);

impl IterationStamp {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl TaskId {
    pub fn new(kind: TaskIdKind) -> Self {
        Self(Arc::new(kind))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(TaskIdKind::Named(name.into()))
    }

    pub fn script(root: TaskId, node: ScriptNode) -> Self {
        Self::new(TaskIdKind::Script { root, node })
    }

    pub fn literal(root: TaskId, value: Value) -> Self {
        Self::new(TaskIdKind::Literal { root, value })
    }

    pub fn assign(root: TaskId, variable: impl Into<String>) -> Self {
        Self::new(TaskIdKind::Assign {
            root,
            variable: variable.into(),
        })
    }

    pub fn task_defaults(script: impl Into<Utf8PathBuf>) -> Self {
        Self::new(TaskIdKind::TaskDefaults {
            script: script.into(),
        })
    }

    pub fn global_scope(script: impl Into<Utf8PathBuf>) -> Self {
        Self::new(TaskIdKind::GlobalScope {
            script: script.into(),
        })
    }

    pub fn build_scope() -> Self {
        Self::new(TaskIdKind::BuildScope)
    }

    pub fn kind(&self) -> &TaskIdKind {
        &self.0
    }

    /// The identity the script scope of this task belongs to. Sub-task
    /// identifiers are derived from it.
    pub fn root(&self) -> TaskId {
        match self.kind() {
            TaskIdKind::Script { root, .. }
            | TaskIdKind::Literal { root, .. }
            | TaskIdKind::Assign { root, .. } => root.clone(),
            _ => self.clone(),
        }
    }
}

impl Debug for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            TaskIdKind::Named(name) => f.write_str(name),
            TaskIdKind::Script { root, node } => write!(f, "{root}/{}", node.label()),
            TaskIdKind::Literal { root, value } => write!(f, "{root}/literal({value})"),
            TaskIdKind::LocalVariable { name, foreach, .. } => write!(f, "{foreach}/local(${name})"),
            TaskIdKind::IterableIndex { iterable, index, .. } => write!(f, "{iterable}[{index}]"),
            TaskIdKind::MapEntryField {
                iterable,
                key,
                field,
                ..
            } => write!(f, "{iterable}[{key}].{field:?}"),
            TaskIdKind::Assign { root, variable } => write!(f, "{root}/assign(${variable})"),
            TaskIdKind::TaskDefaults { script } => write!(f, "defaults({script})"),
            TaskIdKind::DefaultsLoader { path } => write!(f, "defaults-loader({path})"),
            TaskIdKind::GlobalScope { script } => write!(f, "static({script})"),
            TaskIdKind::BuildScope => f.write_str("global"),
            TaskIdKind::BuildTargetParameter { name, .. } => write!(f, "parameter({name})"),
            TaskIdKind::BuildFileTarget { target, file, .. } => write!(f, "{file}@{target}"),
            TaskIdKind::BuildTargetBootstrapper(bootstrapper) => {
                write!(f, "bootstrap({}", bootstrapper.file)?;
                if let Some(target) = &bootstrapper.target {
                    write!(f, "@{target}")?;
                }
                f.write_str(")")
            }
            TaskIdKind::InvocationBootstrapper(bootstrapper) => {
                write!(f, "invoke({})", bootstrapper.name)
            }
            TaskIdKind::InvocationRunner(runner) => write!(f, "run({})", runner.name),
        }
    }
}

/// Name of an invocable task: a dotted name with an optional set of qualifiers,
/// written as `name-q1-q2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskName {
    name: String,
    qualifiers: BTreeSet<String>,
}

impl TaskName {
    pub fn new<I, S>(name: impl Into<String>, qualifiers: I) -> Result<Self, ScriptError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        if !is_valid_segment(&name) {
            return Err(ScriptError::configuration(format!("Invalid task name: {name:?}")));
        }

        let mut set = BTreeSet::new();
        for qualifier in qualifiers {
            let qualifier = qualifier.into();
            if !is_valid_segment(&qualifier) {
                return Err(ScriptError::configuration(format!(
                    "Invalid qualifier {qualifier:?} for task name: {name}"
                )));
            }
            set.insert(qualifier);
        }

        Ok(Self {
            name,
            qualifiers: set,
        })
    }

    /// Parses the `name-q1-q2` form.
    pub fn parse(input: &str) -> Result<Self, ScriptError> {
        let mut parts = input.split('-');
        let name = parts.next().unwrap_or_default();
        Self::new(name, parts)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualifiers(&self) -> &BTreeSet<String> {
        &self.qualifiers
    }

    /// Single-part names (no dot) are reserved for the scripting language.
    pub fn is_single_part(&self) -> bool {
        !self.name.contains('.')
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains('-') && !segment.chars().any(char::is_whitespace)
}

impl Display for TaskName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        for qualifier in &self.qualifiers {
            write!(f, "-{qualifier}")?;
        }
        Ok(())
    }
}
