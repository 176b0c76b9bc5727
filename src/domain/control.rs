//! Control-flow configuration carried by plan nodes.
//!
//! A node has at most one control-flow construct. On the wire this is three
//! optional fields (`conditional`, `for_each`, `subflow`); in Rust it is the
//! [`ControlFlow`] sum type, and a payload setting more than one field is
//! rejected when the plan is deserialised.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Branching pattern of a conditional node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionalKind {
    /// Boolean branching over `true` / `false` branches.
    If,
    /// Multi-way branching keyed by the expression result.
    Switch,
}

/// One branch of a conditional node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConditionalBranch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalConfig {
    #[serde(rename = "type")]
    pub kind: ConditionalKind,
    pub expression: String,
    #[serde(default)]
    pub branches: BTreeMap<String, ConditionalBranch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

fn default_max_parallel() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForEachConfig {
    /// Expression yielding the array to iterate.
    pub collection: String,
    pub item_var: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,
    /// 1 is sequential.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,
    #[serde(default)]
    pub body: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubflowConfig {
    pub flow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_mapping: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mapping: Option<BTreeMap<String, String>>,
}

/// The control-flow construct of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFlow {
    Conditional(ConditionalConfig),
    ForEach(ForEachConfig),
    Subflow(SubflowConfig),
}

impl ControlFlow {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlFlow::Conditional(_) => "conditional",
            ControlFlow::ForEach(_) => "for_each",
            ControlFlow::Subflow(_) => "subflow",
        }
    }

    /// Node ids this construct may activate: branch targets or loop body.
    pub fn referenced_nodes(&self) -> Vec<&str> {
        match self {
            ControlFlow::Conditional(cfg) => cfg
                .branches
                .values()
                .flat_map(|b| b.targets.iter().map(String::as_str))
                .collect(),
            ControlFlow::ForEach(cfg) => cfg.body.iter().map(String::as_str).collect(),
            ControlFlow::Subflow(_) => Vec::new(),
        }
    }
}

/// Wire form of the control-flow fields of a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ControlFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional: Option<ConditionalConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEachConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subflow: Option<SubflowConfig>,
}

impl ControlFields {
    pub fn into_control(self, node_id: &str) -> Result<Option<ControlFlow>, String> {
        match (self.conditional, self.for_each, self.subflow) {
            (None, None, None) => Ok(None),
            (Some(c), None, None) => Ok(Some(ControlFlow::Conditional(c))),
            (None, Some(f), None) => Ok(Some(ControlFlow::ForEach(f))),
            (None, None, Some(s)) => Ok(Some(ControlFlow::Subflow(s))),
            _ => Err(format!(
                "node '{}' sets more than one of conditional, for_each, subflow",
                node_id
            )),
        }
    }
}

impl From<Option<ControlFlow>> for ControlFields {
    fn from(control: Option<ControlFlow>) -> Self {
        let mut fields = ControlFields::default();
        match control {
            Some(ControlFlow::Conditional(c)) => fields.conditional = Some(c),
            Some(ControlFlow::ForEach(f)) => fields.for_each = Some(f),
            Some(ControlFlow::Subflow(s)) => fields.subflow = Some(s),
            None => {}
        }
        fields
    }
}
