mod diagnostics;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use indicatif::ProgressStyle;
use petgraph::graph::{DiGraph, NodeIndex};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::bootstrap::{TargetConfiguration, TargetConfigurationReader, WireTargetReader};
use crate::core::{FileContent, Hash32};
use crate::engine::{
    ChangeDetector, DependencyHandle, DependencySink, ExecutionParameters, Factory, TaskContext, TaskResolver,
};
use crate::error::{ScriptError, TaskError};
use crate::identifier::{TaskId, TaskName};
use crate::task::{NamedTaskFactory, TaskRegistry, TaskRepository};
use crate::value::Value;

pub use diagnostics::{Diagnostics, Edge, TaskExecution};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Frozen configuration shared by every task of a build.
pub struct Environment {
    pub repository: Arc<dyn TaskRepository>,
    pub reader: Arc<dyn TargetConfigurationReader>,
    pub working_directory: Utf8PathBuf,
    pub build_directory: Option<Utf8PathBuf>,
}

/// Everything the engine remembers about one executed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub factory: Factory,
    /// Directories the task ran with, after resolution.
    pub parameters: ExecutionParameters,
    pub output: Option<Value>,
    pub dependencies: Vec<(TaskId, ChangeDetector)>,
    pub input_files: Vec<(Utf8PathBuf, Option<Hash32>)>,
    /// Task lookups and whether they found a task.
    pub lookups: Vec<(TaskName, Option<String>, bool)>,
    pub started: Vec<(TaskId, Factory, Option<ExecutionParameters>)>,
    pub self_detector: Option<ChangeDetector>,
    pub display: Option<String>,
}

impl TaskRecord {
    fn new(factory: Factory, parameters: ExecutionParameters) -> Self {
        Self {
            factory,
            parameters,
            output: None,
            dependencies: Vec::new(),
            input_files: Vec::new(),
            lookups: Vec::new(),
            started: Vec::new(),
            self_detector: None,
            display: None,
        }
    }
}

/// Records of a finished build, the input of the next incremental build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildState {
    pub tasks: HashMap<TaskId, TaskRecord>,
}

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    repository: Option<Arc<dyn TaskRepository>>,
    reader: Option<Arc<dyn TargetConfigurationReader>>,
    working_directory: Option<Utf8PathBuf>,
    build_directory: Option<Utf8PathBuf>,
    previous: Option<BuildState>,
    parallelism: Option<usize>,
}

impl EngineBuilder {
    pub fn repository(mut self, repository: Arc<dyn TaskRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn target_reader(mut self, reader: Arc<dyn TargetConfigurationReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn working_directory(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn build_directory(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.build_directory = Some(dir.into());
        self
    }

    /// State of the previous build, tasks whose inputs didn't change are reused.
    pub fn previous_state(mut self, state: BuildState) -> Self {
        self.previous = Some(state);
        self
    }

    /// Number of workers running tasks at the same time, the size of the
    /// rayon pool by default. Workers blocked on a result don't count.
    pub fn parallelism(mut self, workers: usize) -> Self {
        self.parallelism = Some(workers);
        self
    }

    pub fn build(self) -> Engine {
        let working_directory = self.working_directory.unwrap_or_else(|| {
            std::env::current_dir()
                .ok()
                .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
                .unwrap_or_else(|| Utf8PathBuf::from("/"))
        });

        Engine {
            env: Arc::new(Environment {
                repository: self.repository.unwrap_or_else(|| Arc::new(TaskRegistry::new())),
                reader: self.reader.unwrap_or_else(|| Arc::new(WireTargetReader)),
                working_directory,
                build_directory: self.build_directory,
            }),
            previous: Arc::new(self.previous.unwrap_or_default()),
            parallelism: self.parallelism.unwrap_or_else(rayon::current_num_threads).max(1),
        }
    }
}

/// In-process engine running tasks on a bounded pool of worker threads.
///
/// Each identifier is executed at most once per build. A task waiting for a
/// result blocks its worker, and another worker takes over the queued tasks
/// while it does. Once every running task is waiting, the waits fail with
/// [`ScriptError::Deadlock`].
pub struct Engine {
    env: Arc<Environment>,
    previous: Arc<BuildState>,
    parallelism: usize,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Runs `factory` as the root task `root` and every task it starts.
    pub fn execute(&self, root: TaskId, factory: Factory) -> BuildOutcome {
        let span = tracing::span!(Level::INFO, "build");
        span.pb_set_style(&crate::utils::get_style_build());
        span.pb_set_message("Running tasks...");
        let _enter = span.enter();

        let runtime = Arc::new(Runtime {
            env: Arc::clone(&self.env),
            previous: Arc::clone(&self.previous),
            parallelism: self.parallelism,
            state: Mutex::new(RunState::default()),
            signal: Condvar::new(),
            files: Mutex::new(HashMap::new()),
            configurations: Mutex::new(HashMap::new()),
            lookups: Mutex::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
            span: span.clone(),
            style: crate::utils::get_style_task().unwrap_or_else(|_| ProgressStyle::default_spinner()),
        });

        let parameters = ExecutionParameters {
            working_directory: Some(self.env.working_directory.clone()),
            build_directory: self.env.build_directory.clone(),
        };
        runtime.start(root.clone(), factory, parameters);
        runtime.wait_idle();

        tracing::info!("Build complete!");
        runtime.outcome(root)
    }
}

enum Slot {
    Running(Factory),
    Finished(Box<Finished>),
}

struct Finished {
    result: Result<Value, ScriptError>,
    record: TaskRecord,
    execution: TaskExecution,
    reused: bool,
}

/// A started task no worker has picked up yet.
struct Job {
    task: TaskId,
    factory: Factory,
    parameters: ExecutionParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitMode {
    /// The task can't go on without the result.
    Required,
    /// The task checks whether it can be reused, and runs instead if the
    /// result doesn't come.
    Speculative,
}

#[derive(Default)]
struct RunState {
    slots: HashMap<TaskId, Slot>,
    queue: VecDeque<Job>,
    /// Started and not finished, queued ones included.
    running: usize,
    waiting: usize,
    speculating: usize,
    workers: usize,
    idle: usize,
    /// Bumped on every detected deadlock, releases all current waiters.
    deadlocks: u64,
    /// Bumped to release the speculative waiters only.
    abandoned: u64,
    warnings: Vec<(TaskId, String)>,
}

impl RunState {
    /// Workers running a task or ready to pick one up.
    fn runnable(&self) -> usize {
        self.workers.saturating_sub(self.waiting)
    }

    fn settle(
        &mut self,
        task: TaskId,
        result: Result<Value, ScriptError>,
        record: TaskRecord,
        start: Instant,
        reused: bool,
    ) {
        let execution = TaskExecution {
            start,
            duration: start.elapsed(),
        };

        self.slots.insert(
            task,
            Slot::Finished(Box::new(Finished {
                result,
                record,
                execution,
                reused,
            })),
        );
        self.running -= 1;
    }
}

struct Runtime {
    env: Arc<Environment>,
    previous: Arc<BuildState>,
    parallelism: usize,
    state: Mutex<RunState>,
    signal: Condvar,
    files: Mutex<HashMap<Utf8PathBuf, Option<FileContent>>>,
    configurations: Mutex<HashMap<Hash32, Arc<TargetConfiguration>>>,
    lookups: Mutex<HashMap<(TaskName, Option<String>), Option<Arc<dyn NamedTaskFactory>>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    span: tracing::Span,
    style: ProgressStyle,
}

impl Runtime {
    /// Queues `task` unless it already exists. `parameters` are resolved.
    fn start(self: &Arc<Self>, task: TaskId, factory: Factory, parameters: ExecutionParameters) {
        let mut state = lock(&self.state);
        if let Some(slot) = state.slots.get(&task) {
            let existing = match slot {
                Slot::Running(factory) => factory,
                Slot::Finished(finished) => &finished.record.factory,
            };
            if *existing != factory {
                let message = format!("Task started multiple times with different factories: {task}");
                tracing::warn!("{message}");
                state.warnings.push((task, message));
            }
            return;
        }

        tracing::debug!("Starting {task}");
        self.span.pb_inc_length(1);

        state.slots.insert(task.clone(), Slot::Running(factory.clone()));
        state.running += 1;
        state.queue.push_back(Job {
            task,
            factory,
            parameters,
        });

        if state.queue.len() > state.idle && state.runnable() < self.parallelism {
            self.spawn_worker(&mut state);
        }
        drop(state);

        self.signal.notify_all();
    }

    /// Adds a worker. Called with the state locked.
    fn spawn_worker(self: &Arc<Self>, state: &mut RunState) {
        state.workers += 1;
        state.idle += 1;

        let runtime = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("kumiki-worker".into())
            .spawn(move || runtime.work());

        match spawned {
            Ok(handle) => lock(&self.threads).push(handle),
            Err(e) => {
                tracing::error!("Failed to spawn worker thread: {e}");
                state.workers -= 1;
                state.idle -= 1;

                // nobody is left to run the queue
                if state.workers == 0 {
                    let error = ScriptError::InternalConsistency(format!("Failed to spawn worker thread: {e}"));
                    while let Some(job) = state.queue.pop_front() {
                        let record = TaskRecord::new(job.factory, job.parameters);
                        state.settle(job.task, Err(error.clone()), record, Instant::now(), false);
                    }
                    self.signal.notify_all();
                }
            }
        }
    }

    fn work(self: Arc<Self>) {
        let mut state = lock(&self.state);
        loop {
            if let Some(job) = state.queue.pop_front() {
                state.idle -= 1;
                drop(state);

                self.run(job.task, job.factory, job.parameters);

                state = lock(&self.state);
                state.idle += 1;
                continue;
            }

            if state.running == 0 || state.runnable() > self.parallelism {
                state.idle -= 1;
                state.workers -= 1;
                return;
            }

            state = self.signal.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn run(self: &Arc<Self>, task: TaskId, factory: Factory, parameters: ExecutionParameters) {
        let span = tracing::span!(Level::INFO, "task", id = %task);
        span.pb_set_style(&self.style);
        span.pb_set_message(&factory.label());
        let _enter = span.enter();

        let start = Instant::now();

        if let Some(record) = self.try_reuse(&task, &factory, &parameters)
            && let Some(output) = record.output.clone()
        {
            tracing::debug!("Reusing {task}");
            self.finish(task, Ok(output), record, start, true);
            return;
        }

        let sink = Arc::new(RecordSink::default());
        let ctx = Context {
            runtime: Arc::clone(self),
            task: task.clone(),
            working_directory: parameters
                .working_directory
                .clone()
                .unwrap_or_else(|| self.env.working_directory.clone()),
            build_directory: parameters.build_directory.clone(),
            parameters: parameters.clone(),
            sink: Arc::clone(&sink),
            span: span.clone(),
        };

        // A panicking task only poisons its own data, everything shared is
        // behind locks that tolerate poisoning.
        let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| factory.run(&ctx))) {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Task panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Task panicked: {s}")
                } else {
                    String::from("Task panicked with unknown payload")
                };

                Err(ScriptError::Userland(TaskError::new(anyhow::anyhow!(msg))))
            }
        };
        drop(ctx);

        let (mut record, aborted) = sink.take(factory, parameters);
        let result = match aborted {
            Some(error) => Err(error),
            None => result,
        };
        record.output = result.as_ref().ok().cloned();

        if let Err(e) = &result {
            tracing::debug!("Task {task} failed: {e}");
        } else if let Some(previous) = self.previous.tasks.get(&task)
            && let (Some(detector), Some(output)) = (&record.self_detector, &previous.output)
            && !detector.is_changed(output)
        {
            tracing::debug!("Output of {task} is unchanged");
        }

        self.finish(task, result, record, start, false);
    }

    /// The previous record of `task`, if it can stand in for running it.
    ///
    /// Children of the previous run are only started again once every
    /// dependency is known to be unchanged, except for the children whose
    /// results are themselves among the dependencies.
    fn try_reuse(
        self: &Arc<Self>,
        task: &TaskId,
        factory: &Factory,
        parameters: &ExecutionParameters,
    ) -> Option<TaskRecord> {
        let previous = self.previous.tasks.get(task)?;
        if previous.factory != *factory || previous.parameters != *parameters || previous.output.is_none() {
            return None;
        }

        let files_unchanged = previous
            .input_files
            .par_iter()
            .all(|(path, hash)| Hash32::hash_file(path.as_std_path()).ok() == *hash);
        if !files_unchanged {
            tracing::info!("Input files of {task} changed");
            return None;
        }

        for (name, repository, found) in &previous.lookups {
            if self.lookup(name, repository.as_deref()).is_some() != *found {
                tracing::info!("Availability of task {name} changed");
                return None;
            }
        }

        let children: HashMap<&TaskId, (&Factory, Option<&ExecutionParameters>)> = previous
            .started
            .iter()
            .map(|(child, factory, child_parameters)| (child, (factory, child_parameters.as_ref())))
            .collect();

        for (dependency, detector) in &previous.dependencies {
            if let Some((factory, child_parameters)) = children.get(dependency) {
                let resolved = resolve_parameters(parameters, *child_parameters);
                self.start(dependency.clone(), (*factory).clone(), resolved);
            }

            let Ok(current) = self.wait(dependency, WaitMode::Speculative) else {
                tracing::debug!("Dependency {dependency} of {task} is unavailable");
                return None;
            };
            if detector.is_changed(&current) {
                tracing::info!("Dependency {dependency} of {task} changed");
                return None;
            }
        }

        for (child, factory, child_parameters) in &previous.started {
            let resolved = resolve_parameters(parameters, child_parameters.as_ref());
            self.start(child.clone(), factory.clone(), resolved);
        }

        Some(previous.clone())
    }

    fn finish(
        &self,
        task: TaskId,
        result: Result<Value, ScriptError>,
        record: TaskRecord,
        start: Instant,
        reused: bool,
    ) {
        lock(&self.state).settle(task, result, record, start, reused);

        self.span.pb_inc(1);
        self.signal.notify_all();
    }

    fn wait(self: &Arc<Self>, task: &TaskId, mode: WaitMode) -> Result<Value, ScriptError> {
        let speculative = mode == WaitMode::Speculative;

        let mut state = lock(&self.state);
        loop {
            if let Some(Slot::Finished(finished)) = state.slots.get(task) {
                return finished.result.clone().map_err(|cause| ScriptError::TaskFailed {
                    task: task.clone(),
                    cause: Box::new(cause),
                });
            }

            // every other running task is already waiting
            if state.waiting + 1 >= state.running {
                if speculative {
                    return Err(ScriptError::Deadlock(task.clone()));
                }

                if state.speculating > 0 {
                    // a task giving up on its reuse check runs instead, and
                    // may still produce what the others wait for
                    state.abandoned += 1;
                    self.signal.notify_all();
                } else {
                    tracing::debug!("Deadlock while waiting for {task}");
                    state.deadlocks += 1;
                    self.signal.notify_all();
                    return Err(ScriptError::Deadlock(task.clone()));
                }
            }

            let (deadlocks, abandoned) = (state.deadlocks, state.abandoned);
            state.waiting += 1;
            if speculative {
                state.speculating += 1;
            }

            // the queue must not stall behind blocked workers
            if state.queue.len() > state.idle && state.runnable() < self.parallelism {
                self.spawn_worker(&mut state);
            }

            state = self.signal.wait(state).unwrap_or_else(PoisonError::into_inner);
            state.waiting -= 1;
            if speculative {
                state.speculating -= 1;
            }

            let finished = matches!(state.slots.get(task), Some(Slot::Finished(_)));
            if !finished && (state.deadlocks != deadlocks || (speculative && state.abandoned != abandoned)) {
                return Err(ScriptError::Deadlock(task.clone()));
            }
        }
    }

    fn wait_idle(&self) {
        let mut state = lock(&self.state);
        while state.running > 0 {
            state = self.signal.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        drop(state);

        let threads = std::mem::take(&mut *lock(&self.threads));
        for thread in threads {
            if thread.join().is_err() {
                tracing::error!("Worker thread terminated abnormally");
            }
        }
    }

    fn read_file(&self, path: &Utf8Path) -> Result<Option<FileContent>, ScriptError> {
        if let Some(cached) = lock(&self.files).get(path) {
            return Ok(cached.clone());
        }

        let content = match fs::read(path) {
            Ok(bytes) => Some(FileContent::new(path, bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(ScriptError::io(path, e)),
        };

        lock(&self.files).insert(path.to_path_buf(), content.clone());
        Ok(content)
    }

    fn configuration(&self, file: &FileContent) -> Result<Arc<TargetConfiguration>, ScriptError> {
        if let Some(cached) = lock(&self.configurations).get(&file.hash) {
            return Ok(Arc::clone(cached));
        }

        let configuration = Arc::new(self.env.reader.read(file)?);
        lock(&self.configurations).insert(file.hash, Arc::clone(&configuration));
        Ok(configuration)
    }

    fn lookup(&self, name: &TaskName, repository: Option<&str>) -> Option<Arc<dyn NamedTaskFactory>> {
        let key = (name.clone(), repository.map(str::to_string));
        lock(&self.lookups)
            .entry(key)
            .or_insert_with(|| self.env.repository.lookup(name, repository))
            .clone()
    }

    fn outcome(&self, root: TaskId) -> BuildOutcome {
        let state = std::mem::take(&mut *lock(&self.state));

        let mut results = HashMap::new();
        let mut tasks = HashMap::new();
        let mut diagnostics = Diagnostics {
            warnings: state.warnings,
            ..Diagnostics::default()
        };

        for (task, slot) in state.slots {
            let Slot::Finished(finished) = slot else {
                continue;
            };
            let Finished {
                result,
                record,
                execution,
                reused,
            } = *finished;

            if reused {
                diagnostics.cached.insert(task.clone());
            } else {
                diagnostics.execution_times.insert(task.clone(), execution);
            }
            if let Err(e) = &result {
                diagnostics.failures.push((task.clone(), e.clone()));
            }

            results.insert(task.clone(), result);
            tasks.insert(task, record);
        }

        diagnostics.failures.sort_by_cached_key(|(task, _)| task.to_string());
        diagnostics.graph = task_graph(&tasks);

        BuildOutcome {
            root,
            results: FinishedResults(Arc::new(results)),
            state: BuildState { tasks },
            diagnostics,
        }
    }
}

fn task_graph(tasks: &HashMap<TaskId, TaskRecord>) -> DiGraph<TaskId, Edge> {
    let mut graph = DiGraph::new();
    let mut indices: HashMap<TaskId, NodeIndex> = HashMap::new();

    let mut index_of = |graph: &mut DiGraph<TaskId, Edge>, task: &TaskId| {
        *indices
            .entry(task.clone())
            .or_insert_with(|| graph.add_node(task.clone()))
    };

    for (task, record) in tasks {
        let from = index_of(&mut graph, task);
        for (child, _, _) in &record.started {
            let to = index_of(&mut graph, child);
            graph.add_edge(from, to, Edge::Starts);
        }
        for (dependency, _) in &record.dependencies {
            let to = index_of(&mut graph, dependency);
            graph.add_edge(from, to, Edge::Reads);
        }
    }

    graph
}

/// Directories of a child task started with `child` by a task running with
/// `parent`.
fn resolve_parameters(parent: &ExecutionParameters, child: Option<&ExecutionParameters>) -> ExecutionParameters {
    let base = parent.working_directory.clone().unwrap_or_default();

    let working_directory = match child.and_then(|child| child.working_directory.as_ref()) {
        Some(dir) => base.join(dir),
        None => base,
    };
    let build_directory = match child.and_then(|child| child.build_directory.as_ref()) {
        Some(dir) => Some(working_directory.join(dir)),
        None => parent.build_directory.clone(),
    };

    ExecutionParameters {
        working_directory: Some(working_directory),
        build_directory,
    }
}

#[derive(Default)]
struct Recording {
    dependencies: Vec<(TaskId, ChangeDetector)>,
    input_files: Vec<(Utf8PathBuf, Option<Hash32>)>,
    lookups: Vec<(TaskName, Option<String>, bool)>,
    started: Vec<(TaskId, Factory, Option<ExecutionParameters>)>,
    self_detector: Option<ChangeDetector>,
    display: Option<String>,
    aborted: Option<ScriptError>,
}

/// Collects what a running task reports.
#[derive(Default)]
struct RecordSink {
    inner: Mutex<Recording>,
}

impl RecordSink {
    fn take(&self, factory: Factory, parameters: ExecutionParameters) -> (TaskRecord, Option<ScriptError>) {
        let recording = std::mem::take(&mut *lock(&self.inner));
        let record = TaskRecord {
            dependencies: recording.dependencies,
            input_files: recording.input_files,
            lookups: recording.lookups,
            started: recording.started,
            self_detector: recording.self_detector,
            display: recording.display,
            ..TaskRecord::new(factory, parameters)
        };
        (record, recording.aborted)
    }
}

impl DependencySink for RecordSink {
    fn record_access(&self, task: &TaskId, observed: &Result<Value, ScriptError>) -> usize {
        let detector = match observed {
            Ok(value) => ChangeDetector::Equality(value.clone()),
            Err(_) => ChangeDetector::Always,
        };

        let mut inner = lock(&self.inner);
        inner.dependencies.push((task.clone(), detector));
        inner.dependencies.len() - 1
    }

    fn record_detector(&self, slot: usize, detector: ChangeDetector) {
        if let Some(entry) = lock(&self.inner).dependencies.get_mut(slot) {
            entry.1 = detector;
        }
    }
}

/// The engine side of one running task.
#[derive(Clone)]
pub struct Context {
    runtime: Arc<Runtime>,
    task: TaskId,
    working_directory: Utf8PathBuf,
    build_directory: Option<Utf8PathBuf>,
    parameters: ExecutionParameters,
    sink: Arc<RecordSink>,
    span: tracing::Span,
}

impl TaskResolver for Context {
    fn task_result(&self, task: &TaskId) -> Result<Value, ScriptError> {
        let result = self.runtime.wait(task, WaitMode::Required);
        self.sink.record_access(task, &result);
        result
    }

    fn dependency_handle(&self, task: &TaskId) -> DependencyHandle {
        let runtime = Arc::clone(&self.runtime);
        let id = task.clone();
        DependencyHandle::tracked(
            task.clone(),
            move || runtime.wait(&id, WaitMode::Required),
            Arc::clone(&self.sink) as Arc<dyn DependencySink>,
        )
    }

    fn shared(&self) -> Arc<dyn TaskResolver> {
        Arc::new(self.clone())
    }
}

impl TaskContext for Context {
    fn task_id(&self) -> &TaskId {
        &self.task
    }

    fn working_directory(&self) -> &Utf8Path {
        &self.working_directory
    }

    fn build_directory(&self) -> Option<&Utf8Path> {
        self.build_directory.as_deref()
    }

    fn start_task(
        &self,
        task: TaskId,
        factory: Factory,
        parameters: Option<ExecutionParameters>,
    ) -> Result<(), ScriptError> {
        let resolved = resolve_parameters(&self.parameters, parameters.as_ref());
        lock(&self.sink.inner)
            .started
            .push((task.clone(), factory.clone(), parameters));

        self.runtime.start(task, factory, resolved);
        Ok(())
    }

    fn report_input_file_dependency(&self, path: &Utf8Path, hash: Option<Hash32>) {
        let path = self.working_directory.join(path);
        lock(&self.sink.inner).input_files.push((path, hash));
    }

    fn report_self_change_detector(&self, detector: ChangeDetector) {
        lock(&self.sink.inner).self_detector = Some(detector);
    }

    fn resolve_file(&self, path: &Utf8Path) -> Result<Option<FileContent>, ScriptError> {
        self.runtime.read_file(&self.working_directory.join(path))
    }

    fn target_configuration(&self, file: &FileContent) -> Result<Arc<TargetConfiguration>, ScriptError> {
        self.runtime.configuration(file)
    }

    fn lookup_task(
        &self,
        name: &TaskName,
        repository: Option<&str>,
    ) -> Result<Arc<dyn NamedTaskFactory>, ScriptError> {
        let found = self.runtime.lookup(name, repository);
        lock(&self.sink.inner)
            .lookups
            .push((name.clone(), repository.map(str::to_string), found.is_some()));

        found.ok_or_else(|| {
            let available = self.runtime.env.repository.task_names();
            ScriptError::not_found(
                format!("Task not found: {name}"),
                name.to_string(),
                available.iter().map(TaskName::to_string),
            )
        })
    }

    fn set_display(&self, display: &str) {
        self.span.pb_set_message(display);
        lock(&self.sink.inner).display = Some(display.to_string());
    }

    fn warn(&self, message: String) {
        tracing::warn!("{message}");
        lock(&self.runtime.state).warnings.push((self.task.clone(), message));
    }

    fn abort(&self, error: ScriptError) {
        lock(&self.sink.inner).aborted.get_or_insert(error);
    }
}

/// Results of a finished build, usable to resolve structured results.
#[derive(Clone)]
pub struct FinishedResults(Arc<HashMap<TaskId, Result<Value, ScriptError>>>);

impl TaskResolver for FinishedResults {
    fn task_result(&self, task: &TaskId) -> Result<Value, ScriptError> {
        match self.0.get(task) {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(cause)) => Err(ScriptError::TaskFailed {
                task: task.clone(),
                cause: Box::new(cause.clone()),
            }),
            // never started, so it would have been waited for forever
            None => Err(ScriptError::Deadlock(task.clone())),
        }
    }

    fn dependency_handle(&self, task: &TaskId) -> DependencyHandle {
        let result = self.task_result(task);
        DependencyHandle::lazy(move || result)
    }

    fn shared(&self) -> Arc<dyn TaskResolver> {
        Arc::new(self.clone())
    }
}

pub struct BuildOutcome {
    root: TaskId,
    results: FinishedResults,
    pub state: BuildState,
    pub diagnostics: Diagnostics,
}

impl BuildOutcome {
    pub fn root(&self) -> &TaskId {
        &self.root
    }

    /// Raw result of the root task.
    pub fn result(&self) -> Result<Value, ScriptError> {
        match self.results.0.get(&self.root) {
            Some(result) => result.clone(),
            None => Err(ScriptError::InternalConsistency(format!(
                "Root task {} did not finish",
                self.root
            ))),
        }
    }

    pub fn task_result(&self, task: &TaskId) -> Option<&Result<Value, ScriptError>> {
        self.results.0.get(task)
    }

    pub fn record(&self, task: &TaskId) -> Option<&TaskRecord> {
        self.state.tasks.get(task)
    }

    pub fn results(&self) -> FinishedResults {
        self.results.clone()
    }

    pub fn executed(&self) -> HashSet<&TaskId> {
        self.diagnostics.execution_times.keys().collect()
    }
}
