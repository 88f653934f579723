// Workflow graphs, in ComfyUI's "API format".
//
// That's the format you get from "Save (API Format)": a map of node ID to
// {class_type, inputs, _meta}. Inputs are either literals or [node_id, output_index] links.
// We only ever overwrite inputs; nodes are never added or removed.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PredictError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workflow {
    nodes: BTreeMap<String, Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub class_type: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Input>,
    /// Anything else (_meta, mostly). Carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A reference to output `index` of node `node`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link(pub String, pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Input {
    Link(Link),
    Literal(Value),
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Input::Literal(value)
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Input::Literal(Value::from(value))
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Input::Literal(Value::from(value))
    }
}

impl From<u32> for Input {
    fn from(value: u32) -> Self {
        Input::Literal(Value::from(value))
    }
}

#[cfg(test)]
impl Input {
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Input::Literal(v) => Some(v),
            Input::Link(_) => None,
        }
    }
}

impl Workflow {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read workflow {}", path.display()))?;
        let workflow = Self::parse(&text)
            .with_context(|| format!("failed to parse workflow {}", path.display()))?;
        debug!("Loaded {} nodes from {}", workflow.len(), path.display());
        Ok(workflow)
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("workflow is not valid API-format JSON")
    }

    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value(self).context("failed to serialize workflow")
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: &str) -> Result<&Node, PredictError> {
        self.nodes
            .get(id)
            .ok_or_else(|| PredictError::NodeNotFound(id.to_owned()))
    }

    pub fn node_mut(&mut self, id: &str) -> Result<&mut Node, PredictError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| PredictError::NodeNotFound(id.to_owned()))
    }
}

impl Node {
    /// Overwrites (or sets) a single input.
    pub fn set_input(&mut self, name: &str, value: impl Into<Input>) {
        self.inputs.insert(name.to_owned(), value.into());
    }

    #[cfg(test)]
    pub fn input(&self, name: &str) -> Option<&Input> {
        self.inputs.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = include_str!("../testdata/workflow_api.json");

    #[test]
    fn test_parse_template() {
        let workflow = Workflow::parse(TEMPLATE).unwrap();
        assert_eq!(workflow.len(), 3);
        let loader = workflow.node("4").unwrap();
        assert_eq!(loader.class_type, "CheckpointLoaderSimple");
        assert_eq!(loader.input("ckpt_name"), Some(&Input::from("")));
        let builder = workflow.node("3").unwrap();
        assert_eq!(
            builder.input("model"),
            Some(&Input::Link(Link("4".to_string(), 0)))
        );
        assert_eq!(builder.extra["_meta"]["title"], "DYNAMIC TRT_MODEL CONVERSION");
    }

    #[test]
    fn test_missing_node() {
        let mut workflow = Workflow::parse(TEMPLATE).unwrap();
        match workflow.node_mut("42") {
            Err(PredictError::NodeNotFound(id)) => assert_eq!(id, "42"),
            other => panic!("expected NodeNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_reserialize_keeps_everything() {
        let workflow = Workflow::parse(TEMPLATE).unwrap();
        let original: Value = serde_json::from_str(TEMPLATE).unwrap();
        assert_eq!(workflow.to_json().unwrap(), original);
    }

    #[test]
    fn test_not_a_workflow() {
        assert!(Workflow::parse("[1, 2, 3]").is_err());
        assert!(Workflow::parse(r#"{"1": {"inputs": {}}}"#).is_err());
    }
}
