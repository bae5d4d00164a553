use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::TaskContext;
use crate::error::ScriptError;
use crate::identifier::TaskId;
use crate::script::{ScriptNode, start_node};
use crate::structured::{StructuredTaskResult, actual_task_result};
use crate::value::Value;

/// Keys and values of a map literal, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapNode {
    pub keys: Vec<ScriptNode>,
    pub values: Vec<ScriptNode>,
}

impl ScriptNode {
    /// Map literal. Constant keys must be unique after conversion to strings.
    pub fn map(entries: Vec<(ScriptNode, ScriptNode)>) -> Result<ScriptNode, ScriptError> {
        let mut seen = BTreeMap::new();
        for (key, _) in &entries {
            let Some(constant) = key.try_constantize() else {
                continue;
            };
            let Some(key) = constant.to_key_string() else {
                return Err(ScriptError::configuration("Map key is null."));
            };
            if seen.insert(key.clone(), ()).is_some() {
                return Err(ScriptError::configuration(format!(
                    "Map key present multiple times: {key}"
                )));
            }
        }

        let (keys, values) = entries.into_iter().unzip();
        Ok(ScriptNode::Map(MapNode { keys, values }))
    }
}

impl MapNode {
    pub(super) fn try_constantize(&self) -> Option<Value> {
        let values = self
            .values
            .iter()
            .map(ScriptNode::try_constantize)
            .collect::<Option<Vec<_>>>()?;

        let mut entries = BTreeMap::new();
        for (key, value) in self.keys.iter().zip(values) {
            let key = key.try_constantize()?.to_key_string()?;
            if entries.insert(key, value).is_some() {
                return None;
            }
        }

        Some(Value::Map(entries))
    }

    pub(super) fn run(&self, ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
        let this = ctx.task_id().clone();

        let mut value_ids = Vec::with_capacity(self.values.len());
        for value in &self.values {
            value_ids.push(start_node(ctx, value)?);
        }

        let mut entries = BTreeMap::new();
        let mut computed = Vec::new();

        for (key, value_id) in self.keys.iter().zip(value_ids) {
            match key.try_constantize() {
                Some(constant) => insert_entry(&mut entries, &constant, value_id, &this)?,
                None => computed.push((start_node(ctx, key)?, value_id)),
            }
        }

        for (key_id, value_id) in computed {
            let key = actual_task_result(&key_id, ctx)
                .map_err(|e| ScriptError::operand_caused("Failed to evaluate map key.", key_id.clone(), e))?;
            insert_entry(&mut entries, &key, value_id, &key_id)?;
        }

        Ok(Value::from(StructuredTaskResult::Map(entries)))
    }
}

fn insert_entry(
    entries: &mut BTreeMap<String, StructuredTaskResult>,
    key: &Value,
    value: TaskId,
    origin: &TaskId,
) -> Result<(), ScriptError> {
    let Some(key) = key.to_key_string() else {
        return Err(ScriptError::operand("Map key is null.", origin.clone()));
    };

    if entries.contains_key(&key) {
        return Err(ScriptError::operand(
            format!("Map key present multiple times: {key}"),
            origin.clone(),
        ));
    }

    entries.insert(key, StructuredTaskResult::Object(value));
    Ok(())
}

/// Constant elements are inlined, every other element is started on its own.
pub(super) fn run_list(elements: &[ScriptNode], ctx: &dyn TaskContext) -> Result<Value, ScriptError> {
    let mut results = Vec::with_capacity(elements.len());
    for element in elements {
        match element.try_constantize() {
            Some(value) => results.push(StructuredTaskResult::Literal(value)),
            None => results.push(StructuredTaskResult::Object(start_node(ctx, element)?)),
        }
    }

    Ok(Value::from(StructuredTaskResult::List(results)))
}
