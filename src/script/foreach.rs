use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::{Factory, TaskContext};
use crate::error::ScriptError;
use crate::identifier::{EntryField, IterationStamp, TaskId, TaskIdKind};
use crate::script::{MapNode, ScriptNode, start_node};
use crate::structured::{StructuredTaskResult, resolve_composition};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeachNode {
    /// One name for lists, key and value names for maps.
    pub variables: Vec<String>,
    pub iterable: ScriptNode,
    /// Per-iteration locals with their optional initializers, in declaration order.
    pub locals: Vec<(String, Option<ScriptNode>)>,
    pub body: Vec<ScriptNode>,
    /// List, map or compound string accumulated over the iterations.
    pub result: Option<ScriptNode>,
}

impl ScriptNode {
    pub fn foreach(
        variables: Vec<String>,
        iterable: ScriptNode,
        locals: Vec<(String, Option<ScriptNode>)>,
        body: Vec<ScriptNode>,
        result: Option<ScriptNode>,
    ) -> Result<ScriptNode, ScriptError> {
        if let Some(result) = &result
            && !matches!(
                result,
                ScriptNode::List(_) | ScriptNode::Map(_) | ScriptNode::CompoundString(_)
            )
        {
            return Err(ScriptError::configuration(format!(
                "Foreach result must be a list, map or string, found: {}",
                result.label()
            )));
        }

        if iterable.try_constantize() == Some(Value::Null) {
            return Err(ScriptError::configuration("Foreach iterable is null."));
        }

        Ok(ScriptNode::Foreach(Box::new(ForeachNode {
            variables,
            iterable,
            locals,
            body,
            result,
        })))
    }
}

/// One loop step: the nodes bound to the loop variables.
struct Iteration {
    bindings: Vec<(String, ScriptNode)>,
    identity: Vec<ScriptNode>,
}

/// Result template with the parts cloned so far.
enum Accumulator<'a> {
    List {
        template: &'a [ScriptNode],
        acc: Vec<ScriptNode>,
    },
    Map {
        template: &'a MapNode,
        acc: MapNode,
    },
    Compound {
        template: &'a [ScriptNode],
        acc: Vec<ScriptNode>,
    },
}

impl<'a> Accumulator<'a> {
    fn new(template: &'a ScriptNode) -> Option<Self> {
        match template {
            ScriptNode::List(elements) => Some(Accumulator::List {
                template: elements,
                acc: Vec::new(),
            }),
            ScriptNode::Map(map) => Some(Accumulator::Map {
                template: map,
                acc: MapNode {
                    keys: Vec::new(),
                    values: Vec::new(),
                },
            }),
            ScriptNode::CompoundString(parts) => Some(Accumulator::Compound {
                template: parts,
                acc: Vec::new(),
            }),
            _ => None,
        }
    }

    fn push(&mut self, replacements: &HashMap<ScriptNode, ScriptNode>) {
        fn clone_all(nodes: &[ScriptNode], replacements: &HashMap<ScriptNode, ScriptNode>) -> Vec<ScriptNode> {
            nodes.iter().map(|node| node.clone_with(replacements)).collect()
        }

        match self {
            Accumulator::List { template, acc } | Accumulator::Compound { template, acc } => {
                acc.extend(clone_all(template, replacements))
            }
            Accumulator::Map { template, acc } => {
                acc.keys.extend(clone_all(&template.keys, replacements));
                acc.values.extend(clone_all(&template.values, replacements));
            }
        }
    }

    fn finish(self) -> ScriptNode {
        match self {
            Accumulator::List { acc, .. } => ScriptNode::List(acc),
            Accumulator::Map { acc, .. } => ScriptNode::Map(acc),
            Accumulator::Compound { acc, .. } => ScriptNode::CompoundString(acc),
        }
    }
}

impl ForeachNode {
    pub(super) fn run(&self, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
        let iterable_id = start_node(ctx, &self.iterable)?;
        let iterations = self.iterations(&iterable_id, ctx)?;

        let this = ctx.task_id().clone();
        let mut accumulator = self.result.as_ref().and_then(Accumulator::new);

        for iteration in iterations {
            let mut replacements: HashMap<ScriptNode, ScriptNode> = iteration
                .bindings
                .into_iter()
                .map(|(name, node)| (ScriptNode::LoopVariable(name), node))
                .collect();

            self.bind_locals(&this, iteration.identity, &mut replacements, ctx)?;

            for node in &self.body {
                start_node(ctx, &node.clone_with(&replacements))?;
            }

            if let Some(acc) = accumulator.as_mut() {
                acc.push(&replacements);
            }
        }

        match accumulator {
            Some(acc) => {
                let id = start_node(ctx, &acc.finish())?;
                Ok(Value::from(StructuredTaskResult::Object(id)))
            }
            None => Ok(Value::Null),
        }
    }

    fn iterations(&self, iterable_id: &TaskId, ctx: &dyn TaskContext) -> Result<Vec<Iteration>, ScriptError> {
        let resolution = resolve_composition(ctx.dependency_handle(iterable_id), ctx)
            .map_err(|e| ScriptError::operand_caused("Iterable failed to evaluate.", iterable_id.clone(), e))?;

        match resolution.value {
            Value::Null => Err(ScriptError::operand("Iterable is null.", iterable_id.clone())),
            Value::Structured(structured) => match &*structured {
                StructuredTaskResult::List(elements) => {
                    self.check_variable_count(1)?;
                    Ok(elements
                        .iter()
                        .enumerate()
                        .map(|(index, element)| self.list_iteration(index, element_node(element)))
                        .collect())
                }
                StructuredTaskResult::Map(entries) => {
                    self.check_variable_count(2)?;
                    Ok(entries
                        .iter()
                        .map(|(key, element)| self.map_iteration(ScriptNode::literal(key.as_str()), element_node(element)))
                        .collect())
                }
                other => Err(ScriptError::operand(
                    format!("Cannot iterate over foreach operand: {other}"),
                    iterable_id.clone(),
                )),
            },
            Value::List(items) => {
                self.check_variable_count(1)?;
                let stamp = IterationStamp::fresh();
                Ok(items
                    .into_iter()
                    .enumerate()
                    .map(|(index, item)| {
                        let node = plain_node(item, || TaskIdKind::IterableIndex {
                            iterable: iterable_id.clone(),
                            index: index as u64,
                            stamp,
                        });
                        self.list_iteration(index, node)
                    })
                    .collect())
            }
            Value::Map(entries) => {
                self.check_variable_count(2)?;
                let stamp = IterationStamp::fresh();
                Ok(entries
                    .into_iter()
                    .map(|(key, item)| {
                        let node = plain_node(item, || TaskIdKind::MapEntryField {
                            iterable: iterable_id.clone(),
                            key: Value::Str(key.clone()),
                            field: EntryField::Value,
                            stamp,
                        });
                        self.map_iteration(ScriptNode::literal(key), node)
                    })
                    .collect())
            }
            other => Err(ScriptError::operand(
                format!("Cannot iterate over foreach operand: {other}"),
                iterable_id.clone(),
            )),
        }
    }

    fn check_variable_count(&self, expected: usize) -> Result<(), ScriptError> {
        if self.variables.len() == expected {
            return Ok(());
        }

        Err(ScriptError::configuration(format!(
            "Invalid foreach variable count for iteration: {} expected: {} with variables: [{}]",
            self.variables.len(),
            expected,
            self.variables.join(", ")
        )))
    }

    fn list_iteration(&self, index: usize, item: ScriptNode) -> Iteration {
        let variable = &self.variables[0];
        Iteration {
            bindings: vec![
                (variable.clone(), item.clone()),
                (format!("{variable}.index"), ScriptNode::literal(index as i64)),
            ],
            identity: vec![item],
        }
    }

    fn map_iteration(&self, key: ScriptNode, value: ScriptNode) -> Iteration {
        Iteration {
            bindings: vec![
                (self.variables[0].clone(), key.clone()),
                (self.variables[1].clone(), value.clone()),
            ],
            identity: vec![key, value],
        }
    }

    /// Binds every local of one iteration to its own task and substitutes the
    /// local's placeholder with it.
    fn bind_locals(
        &self,
        this: &TaskId,
        identity: Vec<ScriptNode>,
        replacements: &mut HashMap<ScriptNode, ScriptNode>,
        ctx: &dyn TaskContext,
    ) -> Result<(), ScriptError> {
        let mut local_ids = Vec::with_capacity(self.locals.len());
        for (name, _) in &self.locals {
            let id = TaskId::new(TaskIdKind::LocalVariable {
                name: name.clone(),
                foreach: this.clone(),
                loop_identity: identity.clone(),
            });
            replacements.insert(ScriptNode::LoopVariable(name.clone()), ScriptNode::Forward(id.clone()));
            local_ids.push(id);
        }

        for ((_, init), local_id) in self.locals.iter().zip(local_ids) {
            let Some(init) = init else {
                continue;
            };

            let init_id = start_node(ctx, &init.clone_with(replacements))?;
            ctx.start_task(local_id, Factory::Script(ScriptNode::Forward(init_id)), None)?;
        }

        Ok(())
    }
}

/// Elements of a structured collection are passed on without waiting for them.
fn element_node(element: &StructuredTaskResult) -> ScriptNode {
    match element {
        StructuredTaskResult::Literal(value) if value.is_unique_literal() => ScriptNode::Literal(value.clone()),
        other => ScriptNode::StructuredElement(other.clone()),
    }
}

fn plain_node(item: Value, id: impl FnOnce() -> TaskIdKind) -> ScriptNode {
    if item.is_unique_literal() {
        ScriptNode::Literal(item)
    } else {
        ScriptNode::NamedLiteral {
            id: TaskId::new(id()),
            value: item,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::tests::{make_resolved, make_run};
    use std::collections::BTreeMap;

    fn make_variable(name: &str) -> ScriptNode {
        ScriptNode::LoopVariable(name.into())
    }

    fn make_int_list(items: &[i64]) -> Value {
        Value::List(items.iter().copied().map(Value::Int).collect())
    }

    #[test]
    fn test_list_iteration_preserves_order() {
        let node = ScriptNode::foreach(
            vec!["x".into()],
            ScriptNode::Literal(make_int_list(&[10, 20, 30])),
            vec![],
            vec![],
            Some(ScriptNode::List(vec![make_variable("x")])),
        )
        .unwrap();

        assert_eq!(make_resolved(&make_run(node)).unwrap(), make_int_list(&[10, 20, 30]));
    }

    #[test]
    fn test_map_iteration_keeps_entries() {
        let mut entries = BTreeMap::new();
        entries.insert("k1".to_string(), Value::Int(1));
        entries.insert("k2".to_string(), Value::Int(2));

        let node = ScriptNode::foreach(
            vec!["k".into(), "v".into()],
            ScriptNode::Literal(Value::Map(entries.clone())),
            vec![],
            vec![],
            Some(ScriptNode::Map(MapNode {
                keys: vec![make_variable("k")],
                values: vec![make_variable("v")],
            })),
        )
        .unwrap();

        assert_eq!(make_resolved(&make_run(node)).unwrap(), Value::Map(entries));
    }

    #[test]
    fn test_variable_count_mismatch() {
        let node = ScriptNode::foreach(
            vec!["a".into(), "b".into()],
            ScriptNode::Literal(make_int_list(&[1])),
            vec![],
            vec![ScriptNode::assignment("never", make_variable("a"))],
            None,
        )
        .unwrap();

        let outcome = make_run(node);
        let err = outcome.result().unwrap_err();

        assert!(matches!(err, ScriptError::Configuration(_)));
        assert!(err.to_string().contains("expected: 1"));
        // the body never started
        assert_eq!(outcome.record(&TaskId::named("root")).map(|r| r.started.len()), Some(1));
    }

    #[test]
    fn test_index_and_locals_are_bound() {
        let node = ScriptNode::foreach(
            vec!["x".into()],
            ScriptNode::Literal(Value::List(vec![Value::from("a"), Value::from("b")])),
            vec![(
                "label".into(),
                Some(ScriptNode::CompoundString(vec![
                    make_variable("x"),
                    ScriptNode::literal("#"),
                    make_variable("x.index"),
                ])),
            )],
            vec![],
            Some(ScriptNode::List(vec![make_variable("label")])),
        )
        .unwrap();

        assert_eq!(
            make_resolved(&make_run(node)).unwrap(),
            Value::List(vec![Value::from("a#0"), Value::from("b#1")])
        );
    }

    #[test]
    fn test_structured_iterable_is_not_forced() {
        let node = ScriptNode::foreach(
            vec!["x".into()],
            ScriptNode::List(vec![
                ScriptNode::assignment("first", ScriptNode::literal("one")),
                ScriptNode::literal("two"),
            ]),
            vec![],
            vec![],
            Some(ScriptNode::CompoundString(vec![make_variable("x"), ScriptNode::literal(";")])),
        )
        .unwrap();

        assert_eq!(make_resolved(&make_run(node)).unwrap(), Value::from("one;two;"));
    }

    #[test]
    fn test_non_unique_elements_get_named_identities() {
        let nested = Value::List(vec![make_int_list(&[1]), make_int_list(&[2])]);
        let node = ScriptNode::foreach(
            vec!["x".into()],
            ScriptNode::Literal(nested.clone()),
            vec![],
            vec![],
            Some(ScriptNode::List(vec![make_variable("x")])),
        )
        .unwrap();

        let outcome = make_run(node);
        assert_eq!(make_resolved(&outcome).unwrap(), nested);
    }

    #[test]
    fn test_invalid_template_is_rejected() {
        let err = ScriptNode::foreach(
            vec!["x".into()],
            ScriptNode::Literal(make_int_list(&[1])),
            vec![],
            vec![],
            Some(ScriptNode::literal("nope")),
        )
        .unwrap_err();

        assert!(matches!(err, ScriptError::Configuration(_)));
    }

    #[test]
    fn test_null_iterable() {
        assert!(ScriptNode::foreach(vec!["x".into()], ScriptNode::Literal(Value::Null), vec![], vec![], None).is_err());

        let node = ScriptNode::foreach(
            vec!["x".into()],
            ScriptNode::dereference("nothing_assigned"),
            vec![],
            vec![],
            None,
        )
        .unwrap();
        let err = make_run(node).result().unwrap_err();
        assert_eq!(err.to_string(), "Iterable failed to evaluate.");
    }

    #[test]
    fn test_uninitialized_local_is_assigned_in_body() {
        let node = ScriptNode::foreach(
            vec!["x".into()],
            ScriptNode::Literal(Value::List(vec![Value::from("1"), Value::from("2")])),
            vec![("l".into(), None)],
            vec![
                ScriptNode::assign_to(
                    make_variable("l"),
                    ScriptNode::CompoundString(vec![make_variable("x"), ScriptNode::literal("!")]),
                )
                .unwrap(),
            ],
            Some(ScriptNode::List(vec![make_variable("l")])),
        )
        .unwrap();

        assert_eq!(
            make_resolved(&make_run(node)).unwrap(),
            Value::List(vec![Value::from("1!"), Value::from("2!")])
        );
    }

    #[test]
    fn test_loop_variable_is_not_assignable() {
        let node = ScriptNode::foreach(
            vec!["x".into()],
            ScriptNode::Literal(make_int_list(&[1])),
            vec![],
            vec![ScriptNode::assign_to(make_variable("x"), ScriptNode::literal(2)).unwrap()],
            None,
        )
        .unwrap();

        let outcome = make_run(node);
        let roots = outcome.diagnostics.root_failures();
        assert_eq!(roots.len(), 1);
        assert!(matches!(roots[0].1, ScriptError::Configuration(_)));
    }
}
