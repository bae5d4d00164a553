//! Tasks invocable by name from scripts.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use crate::engine::TaskContext;
use crate::identifier::{TaskId, TaskName};
use crate::metadata::TaskInformation;
use crate::value::Value;

/// Creates instances of a named task.
pub trait NamedTaskFactory: Send + Sync {
    /// `None` is an internal consistency failure of the factory.
    fn create_task(&self) -> Option<Box<dyn Task>>;

    /// Documentation shown for the task, if any.
    fn information(&self) -> Option<TaskInformation> {
        None
    }
}

impl<F> NamedTaskFactory for F
where
    F: Fn() -> Option<Box<dyn Task>> + Send + Sync,
{
    fn create_task(&self) -> Option<Box<dyn Task>> {
        self()
    }
}

pub trait Task: Send {
    /// Tasks accepting named parameters return themselves here.
    fn parameters(&mut self) -> Option<&mut dyn ParameterizableTask> {
        None
    }

    fn run(&mut self, ctx: &dyn TaskContext) -> anyhow::Result<Value>;
}

pub trait ParameterizableTask {
    /// Receives the identifiers of the tasks computing each named parameter.
    /// The values are read through `ctx`.
    fn init_parameters(
        &mut self,
        ctx: &dyn TaskContext,
        parameters: &BTreeMap<String, TaskId>,
    ) -> anyhow::Result<()>;
}

/// Source of named tasks, optionally split into named repositories.
pub trait TaskRepository: Send + Sync {
    fn lookup(&self, name: &TaskName, repository: Option<&str>) -> Option<Arc<dyn NamedTaskFactory>>;

    fn task_names(&self) -> Vec<TaskName>;
}

/// In-memory [`TaskRepository`].
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<(Option<String>, TaskName), Arc<dyn NamedTaskFactory>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: TaskName, factory: impl NamedTaskFactory + 'static) -> &Self {
        self.register_in(None, name, factory)
    }

    pub fn register_in(
        &self,
        repository: Option<&str>,
        name: TaskName,
        factory: impl NamedTaskFactory + 'static,
    ) -> &Self {
        if let Ok(mut tasks) = self.tasks.write() {
            tasks.insert((repository.map(str::to_string), name), Arc::new(factory));
        }
        self
    }

    pub fn unregister(&self, name: &TaskName, repository: Option<&str>) {
        if let Ok(mut tasks) = self.tasks.write() {
            tasks.remove(&(repository.map(str::to_string), name.clone()));
        }
    }

    /// Documentation of every registered task that has some.
    pub fn information(&self) -> Vec<(TaskName, TaskInformation)> {
        let Ok(tasks) = self.tasks.read() else {
            return Vec::new();
        };

        tasks
            .iter()
            .filter_map(|((_, name), factory)| Some((name.clone(), factory.information()?)))
            .collect()
    }
}

impl TaskRepository for TaskRegistry {
    fn lookup(&self, name: &TaskName, repository: Option<&str>) -> Option<Arc<dyn NamedTaskFactory>> {
        let tasks = self.tasks.read().ok()?;
        tasks.get(&(repository.map(str::to_string), name.clone())).cloned()
    }

    fn task_names(&self) -> Vec<TaskName> {
        let Ok(tasks) = self.tasks.read() else {
            return Vec::new();
        };

        tasks
            .keys()
            .map(|(_, name)| name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
