//! Evaluable nodes of the build script language.
//!
//! A [`ScriptNode`] is a pure description of work. Running a node as a task
//! starts the sub-tasks of its operands and returns a structured result that
//! refers to them, so consumers only wait for the parts they use.

mod collection;
mod condition;
mod defaults;
mod foreach;
mod invocation;
mod literal;
mod variable;

use std::collections::{BTreeMap, HashMap};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::engine::{ChangeDetector, Factory, TaskContext};
use crate::error::ScriptError;
use crate::identifier::TaskId;
use crate::structured::StructuredTaskResult;
use crate::value::Value;

pub use collection::MapNode;
pub use condition::ConditionNode;
pub use defaults::{DefaultsAggregator, DefaultsDeclaration, TaskDefaults};
pub use foreach::ForeachNode;
pub use invocation::{IncludeNode, InvocationNode, InvocationScope, UNNAMED_PARAMETER};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptNode {
    Literal(Value),
    /// Concatenation of the string forms of the components.
    CompoundString(Vec<ScriptNode>),
    List(Vec<ScriptNode>),
    Map(MapNode),
    Condition(Box<ConditionNode>),
    Foreach(Box<ForeachNode>),
    TaskInvocation(Box<InvocationNode>),
    /// Invocation of a build target declared in the same script.
    Include(Box<IncludeNode>),
    /// Assignment to a variable: a dereference, a `static` or `global`
    /// variable, or a foreach local.
    Assignment {
        target: Box<ScriptNode>,
        value: Box<ScriptNode>,
    },
    Dereference(String),
    /// Variable shared by the targets and the global expressions of a script.
    StaticVariable {
        script: Utf8PathBuf,
        name: String,
    },
    /// Variable shared by every script of the build.
    GlobalVariable(String),
    DefaultsDeclaration(DefaultsDeclaration),
    DefaultsLoader(Utf8PathBuf),
    DefaultsAggregator(Box<DefaultsAggregator>),
    /// Placeholder of a foreach loop variable, replaced in every iteration.
    LoopVariable(String),
    /// Yields the result of another task.
    Forward(TaskId),
    /// A value with an identity of its own.
    NamedLiteral {
        id: TaskId,
        value: Value,
    },
    /// An element of a structured result, yielded as is.
    StructuredElement(StructuredTaskResult),
    Abort(Option<Box<ScriptNode>>),
    Print(Box<ScriptNode>),
}

impl ScriptNode {
    pub fn literal(value: impl Into<Value>) -> Self {
        ScriptNode::Literal(value.into())
    }

    /// `$variable = value` in the scope of the running target.
    pub fn assignment(variable: impl Into<String>, value: ScriptNode) -> Self {
        ScriptNode::Assignment {
            target: Box::new(ScriptNode::Dereference(variable.into())),
            value: Box::new(value),
        }
    }

    /// Assignment to any assignable node.
    pub fn assign_to(target: ScriptNode, value: ScriptNode) -> Result<Self, ScriptError> {
        match target {
            ScriptNode::Dereference(_)
            | ScriptNode::StaticVariable { .. }
            | ScriptNode::GlobalVariable(_)
            | ScriptNode::LoopVariable(_) => Ok(ScriptNode::Assignment {
                target: Box::new(target),
                value: Box::new(value),
            }),
            other => Err(ScriptError::configuration(format!(
                "Cannot assign to: {}",
                other.label()
            ))),
        }
    }

    pub fn dereference(variable: impl Into<String>) -> Self {
        ScriptNode::Dereference(variable.into())
    }

    pub fn label(&self) -> String {
        match self {
            ScriptNode::Literal(value) => format!("literal({value})"),
            ScriptNode::CompoundString(components) => format!("compound[{}]", components.len()),
            ScriptNode::List(elements) => format!("list[{}]", elements.len()),
            ScriptNode::Map(map) => format!("map[{}]", map.keys.len()),
            ScriptNode::Condition(_) => "condition".into(),
            ScriptNode::Foreach(foreach) => format!("foreach({})", foreach.variables.join(", ")),
            ScriptNode::TaskInvocation(invocation) => format!("task({})", invocation.name),
            ScriptNode::Include(include) => format!("include({})", include.target),
            ScriptNode::Assignment { target, .. } => format!("assign({})", target.label()),
            ScriptNode::Dereference(variable) => format!("${variable}"),
            ScriptNode::StaticVariable { name, .. } => format!("static({name})"),
            ScriptNode::GlobalVariable(name) => format!("global({name})"),
            ScriptNode::DefaultsDeclaration(_) => "defaults".into(),
            ScriptNode::DefaultsLoader(path) => format!("defaults-loader({path})"),
            ScriptNode::DefaultsAggregator(_) => "defaults-aggregator".into(),
            ScriptNode::LoopVariable(variable) => format!("loop(${variable})"),
            ScriptNode::Forward(task) => format!("forward({task})"),
            ScriptNode::NamedLiteral { id, .. } => format!("named({id})"),
            ScriptNode::StructuredElement(element) => format!("element({element})"),
            ScriptNode::Abort(_) => "abort".into(),
            ScriptNode::Print(_) => "print".into(),
        }
    }

    /// Identifier of this node when started by the task `parent`.
    ///
    /// Literals are identified by value within the root scope of the parent,
    /// so the same literal of two scripts never shares a task.
    pub fn sub_task_id(&self, parent: &TaskId) -> TaskId {
        match self {
            ScriptNode::Literal(value) => TaskId::literal(parent.root(), value.clone()),
            ScriptNode::NamedLiteral { id, .. } => id.clone(),
            node => TaskId::script(parent.root(), node.clone()),
        }
    }

    /// Copy of this subtree with every node found in `replacements` swapped.
    pub fn clone_with(&self, replacements: &HashMap<ScriptNode, ScriptNode>) -> ScriptNode {
        if let Some(replacement) = replacements.get(self) {
            return replacement.clone();
        }

        let all = |nodes: &[ScriptNode]| -> Vec<ScriptNode> {
            nodes.iter().map(|node| node.clone_with(replacements)).collect()
        };
        let named = |nodes: &BTreeMap<String, ScriptNode>| -> BTreeMap<String, ScriptNode> {
            nodes
                .iter()
                .map(|(name, node)| (name.clone(), node.clone_with(replacements)))
                .collect()
        };

        match self {
            ScriptNode::CompoundString(components) => ScriptNode::CompoundString(all(components)),
            ScriptNode::List(elements) => ScriptNode::List(all(elements)),
            ScriptNode::Map(map) => ScriptNode::Map(MapNode {
                keys: all(&map.keys),
                values: all(&map.values),
            }),
            ScriptNode::Condition(condition) => ScriptNode::Condition(Box::new(ConditionNode {
                test: condition.test.clone_with(replacements),
                true_branch: all(&condition.true_branch),
                false_branch: all(&condition.false_branch),
            })),
            ScriptNode::Foreach(foreach) => ScriptNode::Foreach(Box::new(ForeachNode {
                variables: foreach.variables.clone(),
                iterable: foreach.iterable.clone_with(replacements),
                locals: foreach
                    .locals
                    .iter()
                    .map(|(name, init)| {
                        (name.clone(), init.as_ref().map(|init| init.clone_with(replacements)))
                    })
                    .collect(),
                body: all(&foreach.body),
                result: foreach.result.as_ref().map(|result| result.clone_with(replacements)),
            })),
            ScriptNode::TaskInvocation(invocation) => {
                ScriptNode::TaskInvocation(Box::new(InvocationNode {
                    name: invocation.name.clone(),
                    qualifiers: all(&invocation.qualifiers),
                    repository: invocation.repository.clone(),
                    parameters: named(&invocation.parameters),
                    script: invocation.script.clone(),
                }))
            }
            ScriptNode::Include(include) => ScriptNode::Include(Box::new(IncludeNode {
                script: include.script.clone(),
                target: include.target.clone(),
                parameters: named(&include.parameters),
            })),
            ScriptNode::Assignment { target, value } => ScriptNode::Assignment {
                target: Box::new(target.clone_with(replacements)),
                value: Box::new(value.clone_with(replacements)),
            },
            ScriptNode::DefaultsDeclaration(declaration) => {
                ScriptNode::DefaultsDeclaration(DefaultsDeclaration {
                    tasks: declaration.tasks.clone(),
                    parameters: named(&declaration.parameters),
                })
            }
            ScriptNode::Abort(message) => {
                ScriptNode::Abort(message.as_ref().map(|m| Box::new(m.clone_with(replacements))))
            }
            ScriptNode::Print(value) => ScriptNode::Print(Box::new(value.clone_with(replacements))),
            leaf => leaf.clone(),
        }
    }

    /// Computes the value without scheduling anything, if every component is
    /// a constant.
    pub fn try_constantize(&self) -> Option<Value> {
        match self {
            ScriptNode::Literal(value) | ScriptNode::NamedLiteral { value, .. } => Some(value.clone()),
            ScriptNode::CompoundString(components) => literal::constantize_compound(components),
            ScriptNode::List(elements) => elements
                .iter()
                .map(ScriptNode::try_constantize)
                .collect::<Option<Vec<_>>>()
                .map(Value::List),
            ScriptNode::Map(map) => map.try_constantize(),
            _ => None,
        }
    }

    pub fn run(&self, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
        tracing::debug!("Running {}", ctx.task_id());

        let value = match self {
            ScriptNode::Literal(value) | ScriptNode::NamedLiteral { value, .. } => value.clone(),
            ScriptNode::CompoundString(components) => literal::run_compound(components, ctx)?,
            ScriptNode::List(elements) => collection::run_list(elements, ctx)?,
            ScriptNode::Map(map) => map.run(ctx)?,
            ScriptNode::Condition(condition) => condition.run(ctx)?,
            ScriptNode::Foreach(foreach) => foreach.run(ctx)?,
            ScriptNode::TaskInvocation(invocation) => invocation.run(ctx)?,
            ScriptNode::Include(include) => include.run(ctx)?,
            ScriptNode::Assignment { target, value } => variable::run_assignment(target, value, ctx)?,
            ScriptNode::Dereference(variable) => variable::run_dereference(variable, ctx),
            ScriptNode::StaticVariable { script, name } => {
                variable::reference(TaskId::global_scope(script.clone()), name)
            }
            ScriptNode::GlobalVariable(name) => variable::reference(TaskId::build_scope(), name),
            ScriptNode::DefaultsDeclaration(declaration) => declaration.run(ctx)?,
            ScriptNode::DefaultsLoader(path) => defaults::run_loader(path, ctx)?,
            ScriptNode::DefaultsAggregator(aggregator) => aggregator.run(ctx)?,
            ScriptNode::LoopVariable(variable) => {
                return Err(ScriptError::configuration(format!(
                    "Loop variable ${variable} is used outside of its foreach."
                )));
            }
            ScriptNode::Forward(task) => Value::from(StructuredTaskResult::Object(task.clone())),
            ScriptNode::StructuredElement(element) => Value::from(element.clone()),
            ScriptNode::Abort(message) => literal::run_abort(message.as_deref(), ctx)?,
            ScriptNode::Print(value) => literal::run_print(value, ctx)?,
        };

        ctx.report_self_change_detector(ChangeDetector::Equality(value.clone()));
        Ok(value)
    }
}

/// Starts `node` as a sub-task of the running task.
pub(crate) fn start_node(ctx: &dyn TaskContext, node: &ScriptNode) -> Result<TaskId, ScriptError> {
    let id = node.sub_task_id(ctx.task_id());
    ctx.start_task(id.clone(), Factory::Script(node.clone()), None)?;
    Ok(id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::{BuildOutcome, Engine};

    /// Runs `node` as the only root task of a fresh engine.
    pub(crate) fn make_run(node: ScriptNode) -> BuildOutcome {
        Engine::builder()
            .build()
            .execute(TaskId::named("root"), Factory::Script(node))
    }

    /// Fully resolved result of the root task.
    pub(crate) fn make_resolved(outcome: &BuildOutcome) -> Result<Value, ScriptError> {
        let results = outcome.results();
        StructuredTaskResult::Object(outcome.root().clone()).to_result(&results)
    }

    #[test]
    fn test_literal_identity_by_root() {
        let literal = ScriptNode::literal("same");
        let first = TaskId::named("first.build");
        let second = TaskId::named("second.build");

        assert_ne!(literal.sub_task_id(&first), literal.sub_task_id(&second));
        assert_eq!(literal.sub_task_id(&first), literal.sub_task_id(&first));

        // nested tasks derive from the root of their parent
        let nested = TaskId::script(first.clone(), ScriptNode::dereference("x"));
        assert_eq!(literal.sub_task_id(&nested), literal.sub_task_id(&first));
    }

    #[test]
    fn test_clone_with_replaces_nested_nodes() {
        let placeholder = ScriptNode::LoopVariable("x".into());
        let node = ScriptNode::List(vec![
            ScriptNode::CompoundString(vec![ScriptNode::literal("v="), placeholder.clone()]),
            ScriptNode::assignment("y", placeholder.clone()),
        ]);

        let mut replacements = HashMap::new();
        replacements.insert(placeholder, ScriptNode::literal(3));

        assert_eq!(
            node.clone_with(&replacements),
            ScriptNode::List(vec![
                ScriptNode::CompoundString(vec![ScriptNode::literal("v="), ScriptNode::literal(3)]),
                ScriptNode::assignment("y", ScriptNode::literal(3)),
            ])
        );
    }

    #[test]
    fn test_constantize_never_folds_operations() {
        assert_eq!(
            ScriptNode::List(vec![ScriptNode::literal(1), ScriptNode::literal("a")]).try_constantize(),
            Some(Value::List(vec![Value::Int(1), Value::from("a")]))
        );
        assert_eq!(
            ScriptNode::List(vec![ScriptNode::literal(1), ScriptNode::dereference("a")]).try_constantize(),
            None
        );
    }

    #[test]
    fn test_unbound_loop_variable_fails() {
        let outcome = make_run(ScriptNode::LoopVariable("x".into()));
        assert!(matches!(outcome.result(), Err(ScriptError::Configuration(_))));
    }
}
