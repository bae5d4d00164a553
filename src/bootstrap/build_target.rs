use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::bootstrap::BuildTargetRunner;
use crate::engine::{ExecutionParameters, Factory, TaskContext};
use crate::error::ScriptError;
use crate::identifier::{TaskId, TaskIdKind};
use crate::script::ScriptNode;
use crate::structured::StructuredTaskResult;
use crate::value::Value;

/// Target chosen when none is named: the only target, or the one called
/// `build` among several.
pub fn choose_default_target(targets: &BTreeSet<String>) -> Option<String> {
    match targets.len() {
        0 => None,
        1 => targets.first().cloned(),
        _ if targets.contains("build") => Some(String::from("build")),
        _ => None,
    }
}

/// Reads a build script and starts one of its targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildTargetBootstrapper {
    pub file: Utf8PathBuf,
    pub target: Option<String>,
    pub parameters: BTreeMap<String, TaskId>,
    pub working_directory: Option<Utf8PathBuf>,
    pub build_directory: Option<Utf8PathBuf>,
}

impl BuildTargetBootstrapper {
    pub fn new(
        file: impl Into<Utf8PathBuf>,
        target: Option<String>,
        parameters: BTreeMap<String, TaskId>,
    ) -> Result<Self, ScriptError> {
        let file = file.into();
        if !file.is_absolute() {
            return Err(ScriptError::configuration(format!(
                "Build script path must be absolute: {file}"
            )));
        }

        Ok(Self {
            file,
            target,
            parameters,
            working_directory: None,
            build_directory: None,
        })
    }

    /// Working directory of the target, relative to the invoker's. The build
    /// directory must be relative to the working directory.
    pub fn with_directories(
        mut self,
        working_directory: Option<Utf8PathBuf>,
        build_directory: Option<Utf8PathBuf>,
    ) -> Result<Self, ScriptError> {
        if let Some(build_directory) = &build_directory
            && build_directory.is_absolute()
        {
            return Err(ScriptError::configuration(format!(
                "Build directory must be relative: {build_directory}"
            )));
        }

        self.working_directory = working_directory;
        self.build_directory = build_directory;
        Ok(self)
    }

    /// Starts one literal task per parameter value, then describes the
    /// bootstrapper using them.
    pub fn with_literal_parameters(
        ctx: &dyn TaskContext,
        file: impl Into<Utf8PathBuf>,
        target: Option<String>,
        values: BTreeMap<String, Value>,
    ) -> Result<Self, ScriptError> {
        let file = file.into();
        let mut parameters = BTreeMap::new();

        for (name, value) in values {
            let id = TaskId::new(TaskIdKind::BuildTargetParameter {
                file: file.clone(),
                target: target.clone(),
                name: name.clone(),
                value: value.clone(),
            });
            ctx.start_task(id.clone(), Factory::Script(ScriptNode::Literal(value)), None)?;
            parameters.insert(name, id);
        }

        Self::new(file, target, parameters)
    }

    pub fn id(&self) -> TaskId {
        TaskId::new(TaskIdKind::BuildTargetBootstrapper(Box::new(self.clone())))
    }

    pub fn run(&self, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
        let Some(file) = ctx.resolve_file(&self.file)? else {
            ctx.report_input_file_dependency(&self.file, None);
            return Err(ScriptError::not_found(
                format!("Build script file not found at: {}", self.file),
                self.file.as_str(),
                [],
            ));
        };
        ctx.report_input_file_dependency(&file.path, Some(file.hash));

        let configuration = ctx.target_configuration(&file)?;
        let names: BTreeSet<String> = configuration.targets.keys().cloned().collect();

        let target = match &self.target {
            Some(target) if names.contains(target) => target.clone(),
            Some(target) => {
                return Err(ScriptError::not_found(
                    format!(
                        "Build target not found with name: {target} in file: {} Available targets: {}",
                        file.path,
                        names.iter().cloned().collect::<Vec<_>>().join(", ")
                    ),
                    target.as_str(),
                    names,
                ));
            }
            None => choose_default_target(&names).ok_or_else(|| {
                ScriptError::not_found(
                    format!(
                        "Failed to determine build target to invoke in: {} Available targets: {:?}",
                        file.path, names
                    ),
                    file.path.as_str(),
                    names.iter().cloned(),
                )
            })?,
        };

        if let Some(declared) = configuration.targets.get(&target) {
            for parameter in self.parameters.keys() {
                if !declared.parameters.contains_key(parameter) {
                    ctx.warn(format!(
                        "Target {target} in file {} has no parameter named: {parameter}",
                        file.path
                    ));
                }
            }
        }

        let working_directory = match &self.working_directory {
            Some(dir) => ctx.working_directory().join(dir),
            None => file.parent().to_path_buf(),
        };
        let build_directory = match &self.build_directory {
            Some(dir) => Some(working_directory.join(dir)),
            None => ctx.build_directory().map(|dir| dir.to_path_buf()),
        };

        tracing::debug!("Bootstrapping target {target} of {}", file.path);

        let id = TaskId::new(TaskIdKind::BuildFileTarget {
            target: target.clone(),
            file: file.path.clone(),
            working_directory: working_directory.clone(),
            parameters: self.parameters.clone(),
        });
        let runner = BuildTargetRunner {
            configuration,
            target,
            parameters: self.parameters.clone(),
        };
        ctx.start_task(
            id.clone(),
            Factory::BuildTargetRunner(runner),
            Some(ExecutionParameters {
                working_directory: Some(working_directory),
                build_directory,
            }),
        )?;

        Ok(Value::from(StructuredTaskResult::Object(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_names(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_default_target_selection() {
        assert_eq!(choose_default_target(&make_names(&[])), None);
        assert_eq!(choose_default_target(&make_names(&["x"])), Some("x".into()));
        assert_eq!(choose_default_target(&make_names(&["x", "build"])), Some("build".into()));
        assert_eq!(choose_default_target(&make_names(&["x", "y"])), None);
    }

    #[test]
    fn test_paths_are_validated() {
        assert!(BuildTargetBootstrapper::new("relative/build.kmk", None, BTreeMap::new()).is_err());

        let bootstrapper = BuildTargetBootstrapper::new("/work/build.kmk", None, BTreeMap::new()).unwrap();
        assert!(
            bootstrapper
                .clone()
                .with_directories(None, Some("/absolute/out".into()))
                .is_err()
        );
        assert!(bootstrapper.with_directories(Some("sub".into()), Some("out".into())).is_ok());
    }
}
