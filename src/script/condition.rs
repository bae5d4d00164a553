use serde::{Deserialize, Serialize};

use crate::engine::TaskContext;
use crate::error::ScriptError;
use crate::script::{ScriptNode, start_node};
use crate::structured::actual_task_result;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConditionNode {
    pub test: ScriptNode,
    pub true_branch: Vec<ScriptNode>,
    pub false_branch: Vec<ScriptNode>,
}

impl ScriptNode {
    /// Two-branch condition. A constant test drops the branch that can never run.
    pub fn condition(test: ScriptNode, true_branch: Vec<ScriptNode>, false_branch: Vec<ScriptNode>) -> ScriptNode {
        let (true_branch, false_branch) = match test.try_constantize() {
            Some(value) if value.is_truthy() => (true_branch, Vec::new()),
            Some(_) => (Vec::new(), false_branch),
            None => (true_branch, false_branch),
        };

        ScriptNode::Condition(Box::new(ConditionNode {
            test,
            true_branch,
            false_branch,
        }))
    }
}

impl ConditionNode {
    pub(super) fn run(&self, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
        let test = match self.test.try_constantize() {
            Some(value) => value,
            None => {
                let test_id = start_node(ctx, &self.test)?;
                actual_task_result(&test_id, ctx).map_err(|e| {
                    ScriptError::operand_caused("Condition failed to evaluate.", test_id.clone(), e)
                })?
            }
        };

        let branch = if test.is_truthy() {
            &self.true_branch
        } else {
            &self.false_branch
        };

        for node in branch {
            start_node(ctx, node)?;
        }

        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::TaskId;
    use crate::script::tests::make_run;

    #[test]
    fn test_constant_test_drops_dead_branch() {
        let node = ScriptNode::condition(
            ScriptNode::literal(true),
            vec![ScriptNode::assignment("x", ScriptNode::literal(1))],
            vec![ScriptNode::assignment("x", ScriptNode::literal(2))],
        );

        let ScriptNode::Condition(condition) = node else {
            panic!("not a condition");
        };
        assert_eq!(condition.true_branch.len(), 1);
        assert!(condition.false_branch.is_empty());
    }

    #[test]
    fn test_runs_chosen_branch_only() {
        let node = ScriptNode::List(vec![
            ScriptNode::assignment("flag", ScriptNode::literal("TRUE")),
            ScriptNode::condition(
                ScriptNode::dereference("flag"),
                vec![ScriptNode::assignment("chosen", ScriptNode::literal("yes"))],
                vec![ScriptNode::assignment("chosen", ScriptNode::literal("no"))],
            ),
        ]);

        let outcome = make_run(node);
        let root = TaskId::named("root");
        let chosen = outcome.task_result(&TaskId::assign(root.clone(), "chosen"));

        assert!(chosen.is_some());
        assert!(outcome.task_result(&TaskId::literal(root.clone(), Value::from("yes"))).is_some());
        assert!(outcome.task_result(&TaskId::literal(root, Value::from("no"))).is_none());
    }

    #[test]
    fn test_failing_test_is_reported_on_the_test_task() {
        let node = ScriptNode::condition(ScriptNode::dereference("missing"), vec![], vec![]);
        let outcome = make_run(node);

        let Err(ScriptError::OperandEvaluation { message, task, .. }) = outcome.result() else {
            panic!("condition did not fail with an operand error");
        };
        assert_eq!(message, "Condition failed to evaluate.");
        assert_eq!(task, TaskId::script(TaskId::named("root"), ScriptNode::dereference("missing")));
    }
}
