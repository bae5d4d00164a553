//! Read-only documentation of tasks and literals, for editors and tooling.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::identifier::TaskName;
use crate::task::TaskRegistry;
use crate::value::ValueKind;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterInformation {
    pub name: String,
    pub kind: Option<ValueKind>,
    pub required: bool,
    pub documentation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInformation {
    pub documentation: Option<String>,
    pub parameters: Vec<ParameterInformation>,
    pub result: Option<ValueKind>,
}

impl TaskInformation {
    pub fn new(documentation: impl Into<String>) -> Self {
        Self {
            documentation: Some(documentation.into()),
            ..Self::default()
        }
    }

    pub fn parameter(mut self, name: impl Into<String>, kind: Option<ValueKind>, required: bool) -> Self {
        self.parameters.push(ParameterInformation {
            name: name.into(),
            kind,
            required,
            documentation: None,
        });
        self
    }

    pub fn parameter_named(&self, name: &str) -> Option<&ParameterInformation> {
        self.parameters.iter().find(|parameter| parameter.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiteralInformation {
    pub literal: String,
    pub kind: ValueKind,
    pub documentation: Option<String>,
}

/// Source of documentation consulted by script tooling.
pub trait ScriptInformationProvider {
    /// Tasks whose name starts with `keyword`.
    fn tasks(&self, keyword: &str) -> Vec<(String, &TaskInformation)>;

    fn task(&self, name: &TaskName) -> Option<&TaskInformation>;

    /// Literals starting with `keyword`.
    fn literals(&self, keyword: &str) -> Vec<&LiteralInformation>;
}

/// Sorted index of documentation, keyed by the textual task name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataIndex {
    tasks: BTreeMap<String, TaskInformation>,
    literals: BTreeMap<String, LiteralInformation>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_registry(registry: &TaskRegistry) -> Self {
        let mut index = Self::new();
        for (name, information) in registry.information() {
            index.add_task(&name, information);
        }
        index
    }

    pub fn add_task(&mut self, name: &TaskName, information: TaskInformation) -> &mut Self {
        self.tasks.insert(name.to_string(), information);
        self
    }

    pub fn add_literal(&mut self, information: LiteralInformation) -> &mut Self {
        self.literals.insert(information.literal.clone(), information);
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn with_prefix<'a, T>(map: &'a BTreeMap<String, T>, keyword: &str) -> impl Iterator<Item = (&'a String, &'a T)> {
    let keyword = keyword.to_string();
    map.range::<str, _>((Bound::Included(keyword.as_str()), Bound::Unbounded))
        .take_while(move |(key, _)| key.starts_with(&keyword))
}

impl ScriptInformationProvider for MetadataIndex {
    fn tasks(&self, keyword: &str) -> Vec<(String, &TaskInformation)> {
        with_prefix(&self.tasks, keyword)
            .map(|(name, information)| (name.clone(), information))
            .collect()
    }

    fn task(&self, name: &TaskName) -> Option<&TaskInformation> {
        self.tasks.get(&name.to_string())
    }

    fn literals(&self, keyword: &str) -> Vec<&LiteralInformation> {
        with_prefix(&self.literals, keyword).map(|(_, information)| information).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn make_index() -> MetadataIndex {
        let registry = TaskRegistry::new();
        registry
            .register(TaskName::parse("text.join").unwrap(), || None::<Box<dyn Task>>)
            .register(TaskName::parse("text.split").unwrap(), || None::<Box<dyn Task>>)
            .register(TaskName::parse("file.copy").unwrap(), || None::<Box<dyn Task>>);

        let mut index = MetadataIndex::from_registry(&registry);
        index
            .add_task(
                &TaskName::parse("text.join").unwrap(),
                TaskInformation::new("Joins strings.").parameter("Separator", Some(ValueKind::Str), false),
            )
            .add_task(&TaskName::parse("text.split").unwrap(), TaskInformation::new("Splits a string."))
            .add_task(&TaskName::parse("file.copy").unwrap(), TaskInformation::default())
            .add_literal(LiteralInformation {
                literal: "true".into(),
                kind: ValueKind::Bool,
                documentation: None,
            })
            .add_literal(LiteralInformation {
                literal: "null".into(),
                kind: ValueKind::Null,
                documentation: Some("No value.".into()),
            });
        index
    }

    #[test]
    fn test_prefix_lookup() {
        let index = make_index();

        let names: Vec<_> = index.tasks("text.").into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["text.join", "text.split"]);
        assert!(index.tasks("zip").is_empty());
        assert_eq!(index.tasks("").len(), 3);
        assert_eq!(index.literals("n").len(), 1);
    }

    #[test]
    fn test_task_parameters() {
        let index = make_index();
        let join = index.task(&TaskName::parse("text.join").unwrap()).unwrap();

        assert!(!join.parameter_named("Separator").unwrap().required);
        assert!(join.parameter_named("Missing").is_none());
        assert!(index.to_json().unwrap().contains("Joins strings."));
    }
}
