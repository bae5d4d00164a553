//! Results whose value may not be computed yet.
//!
//! A task can return a [`StructuredTaskResult`] instead of a plain value. The
//! structure tells consumers where the actual values come from, so a consumer
//! that needs a single element of a list only waits for the task producing
//! that element.

use std::collections::{BTreeMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::{ChangeDetector, DependencyHandle, TaskResolver};
use crate::error::ScriptError;
use crate::identifier::TaskId;
use crate::value::{Value, ValueKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StructuredTaskResult {
    Literal(Value),
    List(Vec<StructuredTaskResult>),
    Map(BTreeMap<String, StructuredTaskResult>),
    /// The result of another task.
    Object(TaskId),
    Composed(ComposedResult),
}

/// Results that wrap an intermediate structured result which must be
/// unwrapped before the value can be used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComposedResult {
    /// The value of `$name` in the scope of `root`.
    Variable { root: TaskId, name: String },
    /// Concatenated string forms of the components.
    Concatenation(Vec<StructuredTaskResult>),
    /// An intermediate result known up front.
    Intermediate(Box<StructuredTaskResult>),
}

impl ComposedResult {
    /// Unwraps one level of composition.
    pub fn intermediate(&self, resolver: &dyn TaskResolver) -> Result<StructuredTaskResult, ScriptError> {
        match self {
            ComposedResult::Variable { root, name } => Ok(StructuredTaskResult::Object(TaskId::assign(
                root.clone(),
                name.as_str(),
            ))),
            ComposedResult::Concatenation(components) => {
                let mut acc = String::new();
                for component in components {
                    acc.push_str(&component.to_result(resolver)?.to_string());
                }
                Ok(StructuredTaskResult::Literal(Value::Str(acc)))
            }
            ComposedResult::Intermediate(result) => Ok((**result).clone()),
        }
    }
}

impl StructuredTaskResult {
    /// Replaces every contained identifier and composition with its value.
    pub fn to_result(&self, resolver: &dyn TaskResolver) -> Result<Value, ScriptError> {
        match self {
            StructuredTaskResult::Literal(value) => Ok(value.clone()),
            StructuredTaskResult::List(elements) => elements
                .iter()
                .map(|element| element.to_result(resolver))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            StructuredTaskResult::Map(entries) => entries
                .iter()
                .map(|(key, element)| Ok((key.clone(), element.to_result(resolver)?)))
                .collect::<Result<BTreeMap<_, _>, ScriptError>>()
                .map(Value::Map),
            StructuredTaskResult::Object(task) => actual_task_result(task, resolver),
            StructuredTaskResult::Composed(composed @ ComposedResult::Variable { root, name }) => {
                let assign = TaskId::assign(root.clone(), name.as_str());
                composed
                    .intermediate(resolver)
                    .and_then(|intermediate| intermediate.to_result(resolver))
                    .map_err(|e| variable_error(name, assign, e))
            }
            StructuredTaskResult::Composed(composed) => composed.intermediate(resolver)?.to_result(resolver),
        }
    }

    /// Lazy variant of [`to_result`](Self::to_result).
    pub fn to_dependency_handle(&self, resolver: &dyn TaskResolver) -> DependencyHandle {
        match self {
            StructuredTaskResult::Literal(value) => DependencyHandle::resolved(value.clone()),
            StructuredTaskResult::Object(task) => {
                let task = task.clone();
                let resolver = resolver.shared();
                DependencyHandle::forwarding(move || actual_task_result_handle(&task, &*resolver))
            }
            StructuredTaskResult::Composed(ComposedResult::Variable { root, name }) => {
                let assign = TaskId::assign(root.clone(), name.as_str());
                let name = name.clone();
                let resolver = resolver.shared();
                DependencyHandle::forwarding(move || {
                    actual_task_result_handle(&assign, &*resolver)
                        .map_err(|e| variable_error(&name, assign.clone(), e))
                })
            }
            other => {
                let other = other.clone();
                let resolver = resolver.shared();
                DependencyHandle::lazy(move || other.to_result(&*resolver))
            }
        }
    }
}

fn variable_error(name: &str, assign: TaskId, cause: ScriptError) -> ScriptError {
    if cause.is_deadlock() {
        ScriptError::operand(
            format!("Failed to evaluate ${name} variable. (unassigned variable)"),
            assign,
        )
    } else {
        ScriptError::operand_caused(format!("Failed to evaluate ${name} variable."), assign, cause)
    }
}

impl Display for StructuredTaskResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StructuredTaskResult::Literal(value) => write!(f, "{value}"),
            StructuredTaskResult::List(elements) => write!(f, "list[{}]", elements.len()),
            StructuredTaskResult::Map(entries) => write!(f, "map[{}]", entries.len()),
            StructuredTaskResult::Object(task) => write!(f, "object({task})"),
            StructuredTaskResult::Composed(ComposedResult::Variable { name, .. }) => write!(f, "${name}"),
            StructuredTaskResult::Composed(_) => f.write_str("composed"),
        }
    }
}

/// Result of `task`, unwrapped one level if it is structured.
pub fn actual_task_result(task: &TaskId, resolver: &dyn TaskResolver) -> Result<Value, ScriptError> {
    match resolver.task_result(task)? {
        Value::Structured(structured) => structured.to_result(resolver),
        value => Ok(value),
    }
}

/// Handle variant of [`actual_task_result`].
///
/// The engine handle of `task` is marked as depending on whether the result is
/// structured, the returned handle is free for the caller's own detector.
pub fn actual_task_result_handle(
    task: &TaskId,
    resolver: &dyn TaskResolver,
) -> Result<DependencyHandle, ScriptError> {
    let handle = resolver.dependency_handle(task);
    match handle.get()? {
        Value::Structured(structured) => {
            handle.set_detector(ChangeDetector::InstanceOf(ValueKind::Structured))?;
            Ok(structured.to_dependency_handle(resolver))
        }
        _ => {
            handle.set_detector(ChangeDetector::NotInstanceOf(ValueKind::Structured))?;
            Ok(handle.clone())
        }
    }
}

/// Outcome of [`resolve_composition`].
#[derive(Debug)]
pub struct Resolution {
    pub value: Value,
    /// The handle the final value was read from.
    pub handle: DependencyHandle,
    /// Number of wrappers unwrapped on the way.
    pub steps: usize,
}

/// Unwraps `handle` while its value is an object wrapper or a composition.
///
/// Every consumed wrapper gets an equality detector, so a change in the shape
/// of any wrapper invalidates the consumer. The handle holding the final value
/// gets a not-instance-of detector, so the value later becoming wrapped also
/// invalidates it. Reaching an identifier twice is a construction error.
pub fn resolve_composition(
    mut handle: DependencyHandle,
    resolver: &dyn TaskResolver,
) -> Result<Resolution, ScriptError> {
    let mut visited = HashSet::new();
    if let Some(task) = handle.task_id() {
        visited.insert(task.clone());
    }

    let mut steps = 0;
    loop {
        let value = handle.get()?;
        let structured = match &value {
            Value::Structured(structured) => Arc::clone(structured),
            _ => {
                handle.set_detector(ChangeDetector::NotInstanceOf(ValueKind::Structured))?;
                return Ok(Resolution { value, handle, steps });
            }
        };

        handle.set_detector(ChangeDetector::Equality(value))?;
        steps += 1;

        let mut current = (*structured).clone();
        let next = loop {
            match current {
                StructuredTaskResult::Composed(composed) => current = composed.intermediate(resolver)?,
                StructuredTaskResult::Object(task) => break task,
                StructuredTaskResult::Literal(value) => {
                    return Ok(Resolution {
                        handle: DependencyHandle::resolved(value.clone()),
                        value,
                        steps,
                    });
                }
                // collections stay structured, their elements are not forced
                shape => {
                    let value = Value::from(shape);
                    return Ok(Resolution {
                        handle: DependencyHandle::resolved(value.clone()),
                        value,
                        steps,
                    });
                }
            }
        };

        if !visited.insert(next.clone()) {
            return Err(ScriptError::InternalConsistency(format!(
                "Result composition revisits task {next}"
            )));
        }

        handle = resolver.dependency_handle(&next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DependencySink;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Resolver over fixed results, recording the detector of every handle.
    struct FixedResolver {
        results: HashMap<TaskId, Value>,
        detectors: Arc<Recorder>,
    }

    #[derive(Default)]
    struct Recorder {
        entries: Mutex<Vec<(TaskId, Option<ChangeDetector>)>>,
    }

    impl DependencySink for Recorder {
        fn record_access(&self, task: &TaskId, _: &Result<Value, ScriptError>) -> usize {
            let mut entries = self.entries.lock().unwrap();
            entries.push((task.clone(), None));
            entries.len() - 1
        }

        fn record_detector(&self, slot: usize, detector: ChangeDetector) {
            self.entries.lock().unwrap()[slot].1 = Some(detector);
        }
    }

    impl TaskResolver for Arc<FixedResolver> {
        fn task_result(&self, task: &TaskId) -> Result<Value, ScriptError> {
            self.results
                .get(task)
                .cloned()
                .ok_or_else(|| ScriptError::Deadlock(task.clone()))
        }

        fn dependency_handle(&self, task: &TaskId) -> DependencyHandle {
            let result = self.task_result(task);
            DependencyHandle::tracked(
                task.clone(),
                move || result,
                Arc::clone(&self.detectors) as Arc<dyn DependencySink>,
            )
        }

        fn shared(&self) -> Arc<dyn TaskResolver> {
            Arc::new(Arc::clone(self))
        }
    }

    fn make_resolver(results: Vec<(TaskId, Value)>) -> Arc<FixedResolver> {
        Arc::new(FixedResolver {
            results: results.into_iter().collect(),
            detectors: Arc::default(),
        })
    }

    fn make_object(task: &TaskId) -> Value {
        Value::from(StructuredTaskResult::Object(task.clone()))
    }

    /// `t0 -> t1 -> ... -> tN` where `tN` holds a plain value.
    fn make_chain(depth: usize, last: Value) -> (Vec<TaskId>, Vec<(TaskId, Value)>) {
        let ids: Vec<_> = (0..=depth).map(|i| TaskId::named(format!("t{i}"))).collect();
        let mut results = Vec::new();
        for i in 0..depth {
            results.push((ids[i].clone(), make_object(&ids[i + 1])));
        }
        results.push((ids[depth].clone(), last));
        (ids, results)
    }

    fn resolve_chain(resolver: &Arc<FixedResolver>, start: &TaskId) -> Vec<(TaskId, ChangeDetector)> {
        let resolution = resolve_composition(resolver.dependency_handle(start), resolver).unwrap();
        assert_eq!(resolution.value, Value::from("end"));

        resolver
            .detectors
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(task, detector)| (task.clone(), detector.clone().unwrap()))
            .collect()
    }

    #[test]
    fn test_composition_terminates_with_one_detector_per_step() {
        for depth in 0..6 {
            let (ids, results) = make_chain(depth, Value::from("end"));
            let resolver = make_resolver(results);

            let resolution = resolve_composition(resolver.dependency_handle(&ids[0]), &resolver).unwrap();

            assert_eq!(resolution.steps, depth);
            assert_eq!(resolution.value, Value::from("end"));

            let entries = resolver.detectors.entries.lock().unwrap();
            assert_eq!(entries.len(), depth + 1);
            for (i, (task, detector)) in entries.iter().enumerate() {
                assert_eq!(task, &ids[i]);
                let expected = if i < depth {
                    ChangeDetector::Equality(make_object(&ids[i + 1]))
                } else {
                    ChangeDetector::NotInstanceOf(ValueKind::Structured)
                };
                assert_eq!(detector.as_ref(), Some(&expected));
            }
        }
    }

    #[test]
    fn test_detectors_only_fire_at_the_altered_step() {
        let (ids, results) = make_chain(3, Value::from("end"));
        let baseline = resolve_chain(&make_resolver(results.clone()), &ids[0]);

        // same chain again, nothing changes
        for (task, detector) in &baseline {
            let current = results.iter().find(|(id, _)| id == task).unwrap();
            assert!(!detector.is_changed(&current.1));
        }

        // t1 now points to a different task which holds the same end value
        let detour = TaskId::named("detour");
        let mut altered = results.clone();
        altered[1].1 = make_object(&detour);
        altered.push((detour, Value::from("end")));

        let fired: Vec<_> = baseline
            .iter()
            .filter(|(task, detector)| {
                let current = altered.iter().find(|(id, _)| id == task).unwrap();
                detector.is_changed(&current.1)
            })
            .map(|(task, _)| task.clone())
            .collect();

        assert_eq!(fired, vec![ids[1].clone()]);
    }

    #[test]
    fn test_composed_variable_unwraps_through_assignment() {
        let root = TaskId::named("root");
        let assign = TaskId::assign(root.clone(), "Var");
        let value_task = TaskId::named("value");
        let resolver = make_resolver(vec![
            (TaskId::named("deref"), Value::from(StructuredTaskResult::Composed(ComposedResult::Variable {
                root: root.clone(),
                name: "Var".into(),
            }))),
            (assign.clone(), make_object(&value_task)),
            (value_task, Value::from("end")),
        ]);

        let resolution = resolve_composition(resolver.dependency_handle(&TaskId::named("deref")), &resolver).unwrap();

        assert_eq!(resolution.value, Value::from("end"));
        assert_eq!(resolution.steps, 2);
    }

    #[test]
    fn test_cyclic_composition_is_rejected() {
        let a = TaskId::named("a");
        let b = TaskId::named("b");
        let resolver = make_resolver(vec![(a.clone(), make_object(&b)), (b.clone(), make_object(&a))]);

        let err = resolve_composition(resolver.dependency_handle(&a), &resolver).unwrap_err();
        assert!(matches!(err, ScriptError::InternalConsistency(_)));
    }

    #[test]
    fn test_to_result_of_nested_structures() {
        let element = TaskId::named("element");
        let mut entries = BTreeMap::new();
        entries.insert("k".to_string(), StructuredTaskResult::Object(element.clone()));
        let structured = StructuredTaskResult::List(vec![
            StructuredTaskResult::Literal(Value::Int(1)),
            StructuredTaskResult::Map(entries),
            StructuredTaskResult::Composed(ComposedResult::Concatenation(vec![
                StructuredTaskResult::Literal(Value::from("a")),
                StructuredTaskResult::Object(element.clone()),
            ])),
        ]);
        let resolver = make_resolver(vec![(element, Value::from("b"))]);

        let mut expected_map = BTreeMap::new();
        expected_map.insert("k".to_string(), Value::from("b"));
        assert_eq!(
            structured.to_result(&resolver).unwrap(),
            Value::List(vec![Value::Int(1), Value::Map(expected_map), Value::from("ab")])
        );
    }

    #[test]
    fn test_actual_result_handle_marks_structured_results() {
        let outer = TaskId::named("outer");
        let inner = TaskId::named("inner");
        let resolver = make_resolver(vec![(outer.clone(), make_object(&inner)), (inner, Value::Int(5))]);

        let handle = actual_task_result_handle(&outer, &resolver).unwrap();
        assert_eq!(handle.get().unwrap(), Value::Int(5));

        let entries = resolver.detectors.entries.lock().unwrap();
        assert_eq!(entries[0].1, Some(ChangeDetector::InstanceOf(ValueKind::Structured)));
        assert_eq!(entries[1].1, Some(ChangeDetector::NotInstanceOf(ValueKind::Structured)));
    }

    #[test]
    fn test_unassigned_variable_is_an_operand_error() {
        let resolver = make_resolver(vec![]);
        let variable = StructuredTaskResult::Composed(ComposedResult::Variable {
            root: TaskId::named("root"),
            name: "Missing".into(),
        });

        let err = variable.to_result(&resolver).unwrap_err();
        assert_eq!(err.to_string(), "Failed to evaluate $Missing variable. (unassigned variable)");
    }
}
