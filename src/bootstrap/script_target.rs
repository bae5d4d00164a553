use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::FileContent;
use crate::engine::{Factory, TaskContext};
use crate::error::ScriptError;
use crate::identifier::TaskId;
use crate::script::{DefaultsAggregator, DefaultsDeclaration, ScriptNode, start_node};
use crate::structured::StructuredTaskResult;
use crate::value::Value;
use crate::wire;

/// A build target of a script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptTarget {
    pub name: String,
    /// Input parameters with their optional default values.
    pub parameters: BTreeMap<String, Option<ScriptNode>>,
    /// Variables published as the result of the target.
    pub outputs: BTreeSet<String>,
    pub statements: Vec<ScriptNode>,
}

/// Parsed form of one build script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetConfiguration {
    pub script: Utf8PathBuf,
    pub targets: BTreeMap<String, ScriptTarget>,
    /// Statements outside of any target.
    pub globals: Vec<ScriptNode>,
    pub defaults: Vec<DefaultsDeclaration>,
    /// Defaults files, relative paths are resolved against the script's directory.
    pub defaults_files: Vec<Utf8PathBuf>,
}

impl TargetConfiguration {
    pub fn new(script: impl Into<Utf8PathBuf>) -> Self {
        Self {
            script: script.into(),
            targets: BTreeMap::new(),
            globals: Vec::new(),
            defaults: Vec::new(),
            defaults_files: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: ScriptTarget) -> Self {
        self.targets.insert(target.name.clone(), target);
        self
    }

    pub fn target_names(&self) -> BTreeSet<String> {
        self.targets.keys().cloned().collect()
    }
}

/// Turns the content of a build script into its target configuration.
pub trait TargetConfigurationReader: Send + Sync {
    fn read(&self, file: &FileContent) -> Result<TargetConfiguration, ScriptError>;
}

/// Reads configurations stored in the binary envelope of [`wire`].
#[derive(Debug, Default, Clone, Copy)]
pub struct WireTargetReader;

impl TargetConfigurationReader for WireTargetReader {
    fn read(&self, file: &FileContent) -> Result<TargetConfiguration, ScriptError> {
        Ok(wire::decode_configuration(&file.bytes)?)
    }
}

/// Runs one target of a script configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildTargetRunner {
    pub configuration: Arc<TargetConfiguration>,
    pub target: String,
    pub parameters: BTreeMap<String, TaskId>,
}

impl BuildTargetRunner {
    pub fn run(&self, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
        let configuration = &self.configuration;
        let Some(target) = configuration.targets.get(&self.target) else {
            return Err(ScriptError::InternalConsistency(format!(
                "Target {} is missing from its configuration",
                self.target
            )));
        };

        for (name, default) in &target.parameters {
            if default.is_none() && !self.parameters.contains_key(name) {
                return Err(ScriptError::configuration(format!(
                    "Build target input parameter: {name} is missing."
                )));
            }
        }

        let this = ctx.task_id().clone();
        let script = &configuration.script;
        let directory = script.parent().map(|dir| dir.to_path_buf()).unwrap_or_default();

        let aggregator = DefaultsAggregator {
            script: script.clone(),
            files: configuration
                .defaults_files
                .iter()
                .map(|file| directory.join(file))
                .collect(),
            declarations: configuration.defaults.clone(),
        };
        ctx.start_task(
            TaskId::task_defaults(script.clone()),
            Factory::Script(ScriptNode::DefaultsAggregator(Box::new(aggregator))),
            None,
        )?;

        let global_scope = TaskId::global_scope(script.clone());
        for statement in &configuration.globals {
            ctx.start_task(
                statement.sub_task_id(&global_scope),
                Factory::Script(statement.clone()),
                None,
            )?;
        }

        for (name, default) in &target.parameters {
            let value = match (self.parameters.get(name), default) {
                (Some(given), _) => given.clone(),
                (None, Some(default)) => start_node(ctx, default)?,
                (None, None) => continue,
            };
            ctx.start_task(
                TaskId::assign(this.clone(), name.as_str()),
                Factory::Script(ScriptNode::Forward(value)),
                None,
            )?;
        }

        for statement in &target.statements {
            start_node(ctx, statement)?;
        }

        let outputs = target
            .outputs
            .iter()
            .map(|output| {
                let assign = TaskId::assign(this.clone(), output.as_str());
                (output.clone(), StructuredTaskResult::Object(assign))
            })
            .collect();

        Ok(Value::from(StructuredTaskResult::Map(outputs)))
    }
}
