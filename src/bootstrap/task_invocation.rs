use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::{Factory, TaskContext};
use crate::error::{ScriptError, TaskError};
use crate::identifier::{TaskId, TaskIdKind, TaskName};
use crate::structured::StructuredTaskResult;
use crate::value::Value;

/// Looks up a named task and starts its runner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskInvocationBootstrapper {
    pub name: TaskName,
    pub repository: Option<String>,
    pub parameters: BTreeMap<String, TaskId>,
}

/// Instantiates and runs a named task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskInvocationRunner {
    pub name: TaskName,
    pub repository: Option<String>,
    pub parameters: BTreeMap<String, TaskId>,
}

impl TaskInvocationBootstrapper {
    pub fn run(&self, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
        // fails early with the available names if the task is unknown
        ctx.lookup_task(&self.name, self.repository.as_deref())?;

        let runner = TaskInvocationRunner {
            name: self.name.clone(),
            repository: self.repository.clone(),
            parameters: self.parameters.clone(),
        };
        let id = TaskId::new(TaskIdKind::InvocationRunner(Box::new(runner.clone())));
        ctx.start_task(id.clone(), Factory::InvocationRunner(runner), None)?;

        Ok(Value::from(StructuredTaskResult::Object(id)))
    }
}

impl TaskInvocationRunner {
    pub fn run(&self, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
        let factory = ctx.lookup_task(&self.name, self.repository.as_deref())?;
        let Some(mut task) = factory.create_task() else {
            return Err(ScriptError::InternalConsistency(format!(
                "Task factory created no task: {}",
                self.name
            )));
        };

        ctx.set_display(&self.name.to_string());

        match task.parameters() {
            Some(parameterizable) => parameterizable
                .init_parameters(ctx, &self.parameters)
                .map_err(TaskError::from)?,
            None if !self.parameters.is_empty() => {
                let names: Vec<_> = self.parameters.keys().map(String::as_str).collect();
                tracing::warn!("Ignoring parameters [{}] of {}", names.join(", "), self.name);
                ctx.warn(format!(
                    "Parameters were provided for non parameterizable task: {}",
                    self.name
                ));
            }
            None => {}
        }

        Ok(task.run(ctx).map_err(TaskError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::task::{ParameterizableTask, Task, TaskRegistry};
    use std::sync::Arc;

    /// Concatenates its `Left` and `Right` parameters.
    #[derive(Default)]
    struct Join {
        parameters: BTreeMap<String, TaskId>,
    }

    impl ParameterizableTask for Join {
        fn init_parameters(
            &mut self,
            _: &dyn TaskContext,
            parameters: &BTreeMap<String, TaskId>,
        ) -> anyhow::Result<()> {
            anyhow::ensure!(parameters.contains_key("Left"), "Left is required");
            self.parameters = parameters.clone();
            Ok(())
        }
    }

    impl Task for Join {
        fn parameters(&mut self) -> Option<&mut dyn ParameterizableTask> {
            Some(self)
        }

        fn run(&mut self, ctx: &dyn TaskContext) -> anyhow::Result<Value> {
            let mut acc = String::new();
            for id in self.parameters.values() {
                acc.push_str(&crate::structured::actual_task_result(id, ctx)?.to_string());
            }
            Ok(Value::Str(acc))
        }
    }

    struct Plain;

    impl Task for Plain {
        fn run(&mut self, _: &dyn TaskContext) -> anyhow::Result<Value> {
            Ok(Value::from("plain"))
        }
    }

    fn make_engine() -> Engine {
        let registry = TaskRegistry::new();
        registry
            .register(TaskName::parse("text.join").unwrap(), || {
                Some(Box::new(Join::default()) as Box<dyn Task>)
            })
            .register(TaskName::parse("text.plain").unwrap(), || {
                Some(Box::new(Plain) as Box<dyn Task>)
            })
            .register(TaskName::parse("text.broken").unwrap(), || None::<Box<dyn Task>>);

        Engine::builder().repository(Arc::new(registry)).build()
    }

    fn make_bootstrapper(name: &str, parameters: BTreeMap<String, TaskId>) -> Factory {
        Factory::InvocationBootstrapper(TaskInvocationBootstrapper {
            name: TaskName::parse(name).unwrap(),
            repository: None,
            parameters,
        })
    }

    #[test]
    fn test_unknown_task_lists_available_names() {
        let outcome = make_engine().execute(TaskId::named("root"), make_bootstrapper("text.missing", BTreeMap::new()));

        let Err(ScriptError::NotFound { available, .. }) = outcome.result() else {
            panic!("lookup did not fail with not found");
        };
        assert!(available.contains(&"text.join".to_string()));
    }

    #[test]
    fn test_factory_without_task_is_internal_failure() {
        let outcome = make_engine().execute(TaskId::named("root"), make_bootstrapper("text.broken", BTreeMap::new()));

        let results = outcome.results();
        let err = StructuredTaskResult::Object(TaskId::named("root"))
            .to_result(&results)
            .unwrap_err();
        assert!(matches!(err.root_cause(), ScriptError::InternalConsistency(_)));
    }

    #[test]
    fn test_parameters_of_plain_task_are_warned_about() {
        let parameters = BTreeMap::from([("Unused".to_string(), TaskId::named("nothing"))]);
        let outcome = make_engine().execute(TaskId::named("root"), make_bootstrapper("text.plain", parameters));

        let results = outcome.results();
        assert_eq!(
            StructuredTaskResult::Object(TaskId::named("root")).to_result(&results).unwrap(),
            Value::from("plain")
        );
        assert_eq!(outcome.diagnostics.warnings.len(), 1);
    }

    #[test]
    fn test_parameter_initialization_failure_is_userland() {
        let outcome = make_engine().execute(TaskId::named("root"), make_bootstrapper("text.join", BTreeMap::new()));

        let results = outcome.results();
        let err = StructuredTaskResult::Object(TaskId::named("root"))
            .to_result(&results)
            .unwrap_err();
        assert!(matches!(err.root_cause(), ScriptError::Userland(_)));
    }
}
