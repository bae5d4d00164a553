use crate::engine::{Factory, TaskContext};
use crate::error::ScriptError;
use crate::identifier::{TaskId, TaskIdKind};
use crate::script::{ScriptNode, start_node};
use crate::structured::{ComposedResult, StructuredTaskResult};
use crate::value::Value;

/// Starts the value and publishes it under the variable `target` names.
pub(super) fn run_assignment(
    target: &ScriptNode,
    value: &ScriptNode,
    ctx: &dyn TaskContext,
) -> Result<Value, ScriptError> {
    let assign_id = assign_id(target, ctx)?;
    let value_id = start_node(ctx, value)?;

    ctx.start_task(assign_id, Factory::Script(ScriptNode::Forward(value_id.clone())), None)?;
    Ok(Value::from(StructuredTaskResult::Object(value_id)))
}

fn assign_id(target: &ScriptNode, ctx: &dyn TaskContext) -> Result<TaskId, ScriptError> {
    match target {
        ScriptNode::Dereference(name) => Ok(TaskId::assign(ctx.task_id().root(), name)),
        ScriptNode::StaticVariable { script, name } => Ok(TaskId::assign(TaskId::global_scope(script.clone()), name)),
        ScriptNode::GlobalVariable(name) => Ok(TaskId::assign(TaskId::build_scope(), name)),
        // a foreach local, bound by the iteration
        ScriptNode::Forward(id) if matches!(id.kind(), TaskIdKind::LocalVariable { .. }) => Ok(id.clone()),
        ScriptNode::LoopVariable(name) => Err(ScriptError::configuration(format!(
            "Variable ${name} used outside of its foreach."
        ))),
        other => Err(ScriptError::configuration(format!("Cannot assign to: {}", other.label()))),
    }
}

pub(super) fn run_dereference(variable: &str, ctx: &dyn TaskContext) -> Value {
    reference(ctx.task_id().root(), variable)
}

pub(super) fn reference(root: TaskId, name: &str) -> Value {
    Value::from(StructuredTaskResult::Composed(ComposedResult::Variable {
        root,
        name: name.to_string(),
    }))
}
