use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::identifier::{TaskId, TaskName};
use crate::value::{Value, ValueKind};

/// Decides whether a dependency's current value must be treated as changed
/// compared to the value observed when the detector was installed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeDetector {
    Always,
    Never,
    /// Changed unless the value equals the baseline.
    Equality(Value),
    /// Changed once the value is no longer of the given kind.
    InstanceOf(ValueKind),
    /// Changed once the value becomes of the given kind.
    NotInstanceOf(ValueKind),
    /// Changed only when the defaults declared for `task` differ from the baseline.
    Defaults {
        task: TaskName,
        baseline: Option<BTreeMap<String, TaskId>>,
    },
}

impl ChangeDetector {
    pub fn is_changed(&self, current: &Value) -> bool {
        let changed = match self {
            ChangeDetector::Always => true,
            ChangeDetector::Never => false,
            ChangeDetector::Equality(baseline) => baseline != current,
            ChangeDetector::InstanceOf(kind) => current.kind() != *kind,
            ChangeDetector::NotInstanceOf(kind) => current.kind() == *kind,
            ChangeDetector::Defaults { task, baseline } => match current {
                Value::Defaults(defaults) => defaults.get(task) != baseline.as_ref(),
                _ => true,
            },
        };

        if changed {
            tracing::info!("Change detected by {}", self);
        }

        changed
    }
}

impl Display for ChangeDetector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeDetector::Always => f.write_str("always"),
            ChangeDetector::Never => f.write_str("never"),
            ChangeDetector::Equality(value) => write!(f, "equality({value})"),
            ChangeDetector::InstanceOf(kind) => write!(f, "instance-of({kind:?})"),
            ChangeDetector::NotInstanceOf(kind) => write!(f, "not-instance-of({kind:?})"),
            ChangeDetector::Defaults { task, .. } => write!(f, "defaults({task})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::TaskDefaults;
    use crate::structured::StructuredTaskResult;

    fn make_defaults(task: &TaskName, param: &str, id: &str) -> Value {
        let mut defaults = TaskDefaults::default();
        defaults
            .insert(task.clone(), param, TaskId::named(id))
            .unwrap();
        Value::Defaults(defaults)
    }

    #[test]
    fn test_equality() {
        let detector = ChangeDetector::Equality(Value::from("a"));

        assert!(!detector.is_changed(&Value::from("a")));
        assert!(detector.is_changed(&Value::from("b")));
    }

    #[test]
    fn test_instance_of() {
        let wrapped = Value::from(StructuredTaskResult::Object(TaskId::named("t")));

        assert!(!ChangeDetector::InstanceOf(ValueKind::Structured).is_changed(&wrapped));
        assert!(ChangeDetector::InstanceOf(ValueKind::Structured).is_changed(&Value::Int(1)));
        assert!(ChangeDetector::NotInstanceOf(ValueKind::Structured).is_changed(&wrapped));
        assert!(!ChangeDetector::NotInstanceOf(ValueKind::Structured).is_changed(&Value::Int(1)));
    }

    #[test]
    fn test_defaults_only_watch_their_task() {
        let watched = TaskName::parse("example.task").unwrap();
        let other = TaskName::parse("other.task").unwrap();

        let detector = ChangeDetector::Defaults {
            task: watched.clone(),
            baseline: None,
        };

        assert!(!detector.is_changed(&make_defaults(&other, "Param", "x")));
        assert!(detector.is_changed(&make_defaults(&watched, "Param", "x")));
        assert!(detector.is_changed(&Value::Null));
    }

    #[test]
    fn test_constant_detectors() {
        assert!(ChangeDetector::Always.is_changed(&Value::Null));
        assert!(!ChangeDetector::Never.is_changed(&Value::Null));
    }
}
