use crate::engine::TaskContext;
use crate::error::ScriptError;
use crate::script::{ScriptNode, start_node};
use crate::structured::{ComposedResult, StructuredTaskResult, actual_task_result};
use crate::value::Value;

pub(super) fn constantize_compound(components: &[ScriptNode]) -> Option<Value> {
    let mut acc = String::new();
    for component in components {
        acc.push_str(&component.try_constantize()?.to_string());
    }
    Some(Value::Str(acc))
}

/// Constant components are inlined, the others are started and concatenated
/// once the result is read.
pub(super) fn run_compound(components: &[ScriptNode], ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
    if let Some(value) = constantize_compound(components) {
        return Ok(value);
    }

    let mut parts = Vec::with_capacity(components.len());
    for component in components {
        match component.try_constantize() {
            Some(value) => parts.push(StructuredTaskResult::Literal(value)),
            None => parts.push(StructuredTaskResult::Object(start_node(ctx, component)?)),
        }
    }

    Ok(Value::from(StructuredTaskResult::Composed(ComposedResult::Concatenation(parts))))
}

pub(super) fn run_abort(message: Option<&ScriptNode>, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
    let message = match message {
        Some(node) => {
            let id = start_node(ctx, node)?;
            actual_task_result(&id, ctx)
                .map_err(|e| ScriptError::operand_caused("Failed to evaluate abort message.", id, e))?
                .to_string()
        }
        None => String::from("Build aborted."),
    };

    ctx.abort(ScriptError::Aborted(message));
    Ok(Value::Null)
}

pub(super) fn run_print(value: &ScriptNode, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
    let id = start_node(ctx, value)?;
    let value = actual_task_result(&id, ctx)
        .map_err(|e| ScriptError::operand_caused("Failed to evaluate printed value.", id, e))?;

    tracing::info!(target: "kumiki::print", "{value}");
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::tests::{make_resolved, make_run};

    #[test]
    fn test_compound_folds_constants() {
        let node = ScriptNode::CompoundString(vec![
            ScriptNode::literal("a"),
            ScriptNode::literal(1),
            ScriptNode::literal(true),
        ]);

        assert_eq!(node.try_constantize(), Some(Value::from("a1true")));
    }

    #[test]
    fn test_compound_of_dynamic_components() {
        let node = ScriptNode::List(vec![
            ScriptNode::assignment("x", ScriptNode::literal("mid")),
            ScriptNode::CompoundString(vec![
                ScriptNode::literal("<"),
                ScriptNode::dereference("x"),
                ScriptNode::literal(">"),
            ]),
        ]);

        let resolved = make_resolved(&make_run(node)).unwrap();
        assert_eq!(resolved, Value::List(vec![Value::from("mid"), Value::from("<mid>")]));
    }

    #[test]
    fn test_abort_fails_the_task() {
        let outcome = make_run(ScriptNode::Abort(Some(Box::new(ScriptNode::literal("stop")))));

        assert!(matches!(outcome.result(), Err(ScriptError::Aborted(message)) if message == "stop"));
    }
}
