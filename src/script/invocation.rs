use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::bootstrap::{BuildTargetBootstrapper, TaskInvocationBootstrapper};
use crate::engine::{ChangeDetector, Factory, TaskContext};
use crate::error::ScriptError;
use crate::identifier::{TaskId, TaskIdKind, TaskName};
use crate::script::{DefaultsDeclaration, ScriptNode, start_node};
use crate::structured::{StructuredTaskResult, actual_task_result};
use crate::value::Value;

/// `name-qualifier(Param: value)` call of a task from a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationNode {
    pub name: String,
    pub qualifiers: Vec<ScriptNode>,
    pub repository: Option<String>,
    pub parameters: BTreeMap<String, ScriptNode>,
    /// Script the call is written in, its defaults apply.
    pub script: Utf8PathBuf,
}

/// Call of another build target of the same script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncludeNode {
    pub script: Utf8PathBuf,
    pub target: String,
    pub parameters: BTreeMap<String, ScriptNode>,
}

/// Where an invocation is written.
#[derive(Debug, Clone, Copy)]
pub struct InvocationScope<'a> {
    pub script: &'a Utf8Path,
    pub declared_targets: &'a BTreeSet<String>,
}

/// Name of the unnamed first parameter, as in `print("hello")`.
pub const UNNAMED_PARAMETER: &str = "";

impl ScriptNode {
    /// Node for a call written as `name(parameters)`.
    ///
    /// Single-part names are the builtins of the language and the build
    /// targets of the same script. Everything else is looked up as a task.
    pub fn invocation(
        name: &str,
        qualifiers: Vec<ScriptNode>,
        repository: Option<String>,
        mut parameters: BTreeMap<String, ScriptNode>,
        scope: InvocationScope<'_>,
    ) -> Result<ScriptNode, ScriptError> {
        if name.contains('.') {
            // validates the name, qualifiers are only known at run time
            TaskName::new(name, Vec::<String>::new())?;
            return Ok(ScriptNode::TaskInvocation(Box::new(InvocationNode {
                name: name.to_string(),
                qualifiers,
                repository,
                parameters,
                script: scope.script.to_path_buf(),
            })));
        }

        match name {
            "var" => Ok(ScriptNode::Dereference(variable_name(&parameters)?)),
            "static" => Ok(ScriptNode::StaticVariable {
                script: scope.script.to_path_buf(),
                name: variable_name(&parameters)?,
            }),
            "global" => Ok(ScriptNode::GlobalVariable(variable_name(&parameters)?)),
            "defaults" => {
                let tasks = match parameters.remove(UNNAMED_PARAMETER).and_then(|node| node.try_constantize()) {
                    Some(Value::List(names)) => names,
                    Some(Value::Null) | None => {
                        return Err(ScriptError::configuration("No tasks specified for defaults."));
                    }
                    Some(single) => vec![single],
                };
                let tasks = tasks
                    .iter()
                    .map(|name| TaskName::parse(&name.to_string()))
                    .collect::<Result<BTreeSet<_>, _>>()?;
                Ok(ScriptNode::DefaultsDeclaration(DefaultsDeclaration::new(tasks, parameters)?))
            }
            "abort" => Ok(ScriptNode::Abort(
                parameters.remove(UNNAMED_PARAMETER).map(Box::new),
            )),
            "print" => match parameters.remove(UNNAMED_PARAMETER) {
                Some(value) => Ok(ScriptNode::Print(Box::new(value))),
                None => Err(ScriptError::configuration("Nothing to print.")),
            },
            target if scope.declared_targets.contains(target) => {
                Ok(ScriptNode::Include(Box::new(IncludeNode {
                    script: scope.script.to_path_buf(),
                    target: target.to_string(),
                    parameters,
                })))
            }
            other => Err(ScriptError::configuration(format!(
                "Single named tasks are reserved for the scripting language: {other}"
            ))),
        }
    }
}

impl InvocationNode {
    pub(super) fn run(&self, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
        let mut qualifiers = BTreeSet::new();
        let mut computed = Vec::new();
        for qualifier in &self.qualifiers {
            match qualifier.try_constantize() {
                Some(value) => {
                    qualifiers.insert(qualifier_string(&value, ctx.task_id())?);
                }
                None => computed.push(start_node(ctx, qualifier)?),
            }
        }

        let mut parameters = BTreeMap::new();
        for (name, node) in &self.parameters {
            parameters.insert(name.clone(), start_node(ctx, node)?);
        }

        for id in computed {
            let value = actual_task_result(&id, ctx)
                .map_err(|e| ScriptError::operand_caused("Failed to evaluate qualifier.", id.clone(), e))?;
            qualifiers.insert(qualifier_string(&value, &id)?);
        }

        let name = TaskName::new(self.name.clone(), qualifiers)?;
        self.apply_defaults(&name, &mut parameters, ctx)?;

        let bootstrapper = TaskInvocationBootstrapper {
            name,
            repository: self.repository.clone(),
            parameters,
        };
        let id = TaskId::new(TaskIdKind::InvocationBootstrapper(Box::new(bootstrapper.clone())));
        ctx.start_task(id.clone(), Factory::InvocationBootstrapper(bootstrapper), None)?;

        Ok(Value::from(StructuredTaskResult::Object(id)))
    }

    /// Adds the script defaults of the parameters not given explicitly.
    ///
    /// Defaults are loaded by the build targets of a script. Invocations
    /// running outside of one have none.
    fn apply_defaults(
        &self,
        name: &TaskName,
        parameters: &mut BTreeMap<String, TaskId>,
        ctx: &dyn TaskContext,
    ) -> Result<(), ScriptError> {
        let in_script = match ctx.task_id().root().kind() {
            TaskIdKind::BuildFileTarget { file, .. } | TaskIdKind::GlobalScope { script: file } => {
                *file == self.script
            }
            _ => false,
        };
        if !in_script {
            tracing::debug!("No defaults in scope of {name}");
            return Ok(());
        }

        let defaults_id = TaskId::task_defaults(self.script.clone());
        let handle = ctx.dependency_handle(&defaults_id);

        let baseline = match handle.get() {
            Ok(Value::Defaults(defaults)) => defaults.get(name).cloned(),
            Ok(_) => None,
            Err(e) => {
                return Err(ScriptError::operand_caused(
                    format!("Failed to retrieve defaults for task: {name}"),
                    defaults_id,
                    e,
                ));
            }
        };

        handle.set_detector(ChangeDetector::Defaults {
            task: name.clone(),
            baseline: baseline.clone(),
        })?;

        for (parameter, value) in baseline.into_iter().flatten() {
            parameters.entry(parameter).or_insert(value);
        }

        Ok(())
    }
}

fn variable_name(parameters: &BTreeMap<String, ScriptNode>) -> Result<String, ScriptError> {
    match parameters.get(UNNAMED_PARAMETER).map(ScriptNode::try_constantize) {
        None => Err(ScriptError::configuration("No variable name given.")),
        Some(Some(Value::Null)) => Err(ScriptError::configuration("Variable name is null.")),
        Some(value) => value
            .and_then(|value| value.to_key_string())
            .ok_or_else(|| ScriptError::configuration("Variable name must be a constant.")),
    }
}

fn qualifier_string(value: &Value, origin: &TaskId) -> Result<String, ScriptError> {
    value
        .to_key_string()
        .ok_or_else(|| ScriptError::operand("Qualifier is null.", origin.clone()))
}

impl IncludeNode {
    pub(super) fn run(&self, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
        let mut parameters = BTreeMap::new();
        for (name, node) in &self.parameters {
            parameters.insert(name.clone(), start_node(ctx, node)?);
        }

        let bootstrapper = BuildTargetBootstrapper::new(self.script.clone(), Some(self.target.clone()), parameters)?;
        let id = TaskId::new(TaskIdKind::BuildTargetBootstrapper(Box::new(bootstrapper.clone())));
        ctx.start_task(id.clone(), Factory::BuildTargetBootstrapper(bootstrapper), None)?;

        Ok(Value::from(StructuredTaskResult::Object(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_scope<'a>(targets: &'a BTreeSet<String>) -> InvocationScope<'a> {
        InvocationScope {
            script: Utf8Path::new("/work/build.kmk"),
            declared_targets: targets,
        }
    }

    fn make_unnamed(node: ScriptNode) -> BTreeMap<String, ScriptNode> {
        BTreeMap::from([(UNNAMED_PARAMETER.to_string(), node)])
    }

    #[test]
    fn test_builtins() {
        let targets = BTreeSet::from(["build".to_string()]);
        let scope = make_scope(&targets);

        assert_eq!(
            ScriptNode::invocation("var", vec![], None, make_unnamed(ScriptNode::literal("X")), scope).unwrap(),
            ScriptNode::Dereference("X".into())
        );
        assert!(matches!(
            ScriptNode::invocation("print", vec![], None, make_unnamed(ScriptNode::literal("hi")), scope),
            Ok(ScriptNode::Print(_))
        ));
        assert!(matches!(
            ScriptNode::invocation("build", vec![], None, BTreeMap::new(), scope),
            Ok(ScriptNode::Include(_))
        ));
        assert!(matches!(
            ScriptNode::invocation("example.task", vec![], None, BTreeMap::new(), scope),
            Ok(ScriptNode::TaskInvocation(_))
        ));
    }

    #[test]
    fn test_unknown_single_part_name() {
        let targets = BTreeSet::new();
        let err = ScriptNode::invocation("compile", vec![], None, BTreeMap::new(), make_scope(&targets)).unwrap_err();

        assert!(matches!(err, ScriptError::Configuration(_)));
    }

    #[test]
    fn test_defaults_builtin() {
        let targets = BTreeSet::new();
        let mut parameters = make_unnamed(ScriptNode::literal("example.task"));
        parameters.insert("P".into(), ScriptNode::literal(1));

        let node = ScriptNode::invocation("defaults", vec![], None, parameters, make_scope(&targets)).unwrap();
        let ScriptNode::DefaultsDeclaration(declaration) = node else {
            panic!("not a defaults declaration");
        };

        assert!(declaration.tasks.contains(&TaskName::parse("example.task").unwrap()));
        assert_eq!(declaration.parameters.len(), 1);
    }

    #[test]
    fn test_static_and_global_builtins() {
        let targets = BTreeSet::new();
        let scope = make_scope(&targets);

        assert_eq!(
            ScriptNode::invocation("static", vec![], None, make_unnamed(ScriptNode::literal("Prefix")), scope).unwrap(),
            ScriptNode::StaticVariable {
                script: Utf8PathBuf::from("/work/build.kmk"),
                name: "Prefix".into(),
            }
        );
        assert_eq!(
            ScriptNode::invocation("global", vec![], None, make_unnamed(ScriptNode::literal("Counter")), scope).unwrap(),
            ScriptNode::GlobalVariable("Counter".into())
        );

        for parameters in [
            BTreeMap::new(),
            make_unnamed(ScriptNode::Literal(Value::Null)),
            make_unnamed(ScriptNode::dereference("computed")),
        ] {
            let err = ScriptNode::invocation("global", vec![], None, parameters, scope).unwrap_err();
            assert!(matches!(err, ScriptError::Configuration(_)));
        }
    }
}
