use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::engine::{Factory, TaskContext};
use crate::error::ScriptError;
use crate::identifier::{TaskId, TaskIdKind, TaskName};
use crate::script::{ScriptNode, start_node};
use crate::value::Value;

/// Default parameter tasks per task name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskDefaults {
    entries: BTreeMap<TaskName, BTreeMap<String, TaskId>>,
}

impl TaskDefaults {
    pub fn insert(&mut self, task: TaskName, parameter: impl Into<String>, value: TaskId) -> Result<(), ScriptError> {
        let parameter = parameter.into();
        let parameters = self.entries.entry(task.clone()).or_default();

        if parameters.contains_key(&parameter) {
            return Err(ScriptError::configuration(format!(
                "Multiple default parameter declarations for task: {task} with parameter: {parameter}"
            )));
        }

        parameters.insert(parameter, value);
        Ok(())
    }

    pub fn get(&self, task: &TaskName) -> Option<&BTreeMap<String, TaskId>> {
        self.entries.get(task)
    }

    /// Merges `other` into this, rejecting parameters declared by both.
    pub fn add(&mut self, other: TaskDefaults) -> Result<(), ScriptError> {
        for (task, parameters) in other.entries {
            for (parameter, value) in parameters {
                self.insert(task.clone(), parameter, value)?;
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `defaults(task.a, task.b, Param: value)` of a script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefaultsDeclaration {
    pub tasks: BTreeSet<TaskName>,
    pub parameters: BTreeMap<String, ScriptNode>,
}

impl DefaultsDeclaration {
    pub fn new(tasks: BTreeSet<TaskName>, parameters: BTreeMap<String, ScriptNode>) -> Result<Self, ScriptError> {
        if let Some(builtin) = tasks.iter().find(|task| task.is_single_part()) {
            return Err(ScriptError::configuration(format!(
                "Cannot define defaults for builtin tasks: {builtin}"
            )));
        }

        Ok(Self { tasks, parameters })
    }

    pub(super) fn run(&self, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
        let mut defaults = TaskDefaults::default();

        for (parameter, node) in &self.parameters {
            let value = start_node(ctx, node)?;
            for task in &self.tasks {
                defaults.insert(task.clone(), parameter.as_str(), value.clone())?;
            }
        }

        Ok(Value::Defaults(defaults))
    }
}

/// Collects the defaults visible to one script: its own declarations and
/// those of its defaults files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefaultsAggregator {
    pub script: Utf8PathBuf,
    pub files: Vec<Utf8PathBuf>,
    pub declarations: Vec<DefaultsDeclaration>,
}

impl DefaultsAggregator {
    pub(super) fn run(&self, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
        let mut started = Vec::new();

        for declaration in &self.declarations {
            started.push(start_node(ctx, &ScriptNode::DefaultsDeclaration(declaration.clone()))?);
        }

        for file in &self.files {
            let id = TaskId::new(TaskIdKind::DefaultsLoader { path: file.clone() });
            ctx.start_task(id.clone(), Factory::Script(ScriptNode::DefaultsLoader(file.clone())), None)?;
            started.push(id);
        }

        let mut defaults = TaskDefaults::default();
        for id in started {
            if let Value::Defaults(loaded) = ctx.task_result(&id)? {
                defaults.add(loaded)?;
            }
        }

        Ok(Value::Defaults(defaults))
    }
}

/// Loads the declarations of a defaults file. Their values are scoped to the
/// file, not to the script using them.
pub(super) fn run_loader(path: &Utf8Path, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
    let Some(file) = ctx.resolve_file(path)? else {
        ctx.report_input_file_dependency(path, None);
        ctx.abort(ScriptError::not_found(
            format!("Defaults file not found at path: {path}"),
            path.as_str(),
            [],
        ));
        return Ok(Value::Null);
    };

    ctx.report_input_file_dependency(&file.path, Some(file.hash));
    let configuration = ctx.target_configuration(&file)?;
    let scope = TaskId::global_scope(file.path.clone());

    let mut started = Vec::new();
    for declaration in &configuration.defaults {
        let node = ScriptNode::DefaultsDeclaration(declaration.clone());
        let id = node.sub_task_id(&scope);
        ctx.start_task(id.clone(), Factory::Script(node), None)?;
        started.push(id);
    }

    let mut defaults = TaskDefaults::default();
    for id in started {
        if let Value::Defaults(loaded) = ctx.task_result(&id)? {
            defaults.add(loaded)?;
        }
    }

    Ok(Value::Defaults(defaults))
}
