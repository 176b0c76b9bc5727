use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::control::{ConditionalKind, ControlFields, ControlFlow};

/// An immutable, caller-supplied execution graph.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<EdgeSpec>,
}

/// A directed edge between two plan nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
}

impl EdgeSpec {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// One node of a plan: an execution descriptor plus at most one control-flow
/// construct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNodeSpec", into = "RawNodeSpec")]
pub struct NodeSpec {
    pub id: String,
    pub kind: String,
    pub agent_id: Option<String>,
    pub command: Vec<String>,
    pub image: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Ids of nodes this node depends on.
    pub inputs: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub retries: u32,
    pub control: Option<ControlFlow>,
}

impl NodeSpec {
    pub fn new(id: &str, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            agent_id: None,
            command: Vec::new(),
            image: None,
            env: BTreeMap::new(),
            inputs: Vec::new(),
            timeout_secs: None,
            retries: 0,
            control: None,
        }
    }

    pub fn with_control(mut self, control: ControlFlow) -> Self {
        self.control = Some(control);
        self
    }

    pub fn is_control_flow(&self) -> bool {
        self.control.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawNodeSpec {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
    #[serde(default)]
    retries: u32,
    #[serde(flatten)]
    control: ControlFields,
}

impl TryFrom<RawNodeSpec> for NodeSpec {
    type Error = String;

    fn try_from(raw: RawNodeSpec) -> Result<Self, Self::Error> {
        let control = raw.control.into_control(&raw.id)?;
        Ok(Self {
            id: raw.id,
            kind: raw.kind,
            agent_id: raw.agent_id,
            command: raw.command,
            image: raw.image,
            env: raw.env,
            inputs: raw.inputs,
            timeout_secs: raw.timeout_secs,
            retries: raw.retries,
            control,
        })
    }
}

impl From<NodeSpec> for RawNodeSpec {
    fn from(spec: NodeSpec) -> Self {
        Self {
            id: spec.id,
            kind: spec.kind,
            agent_id: spec.agent_id,
            command: spec.command,
            image: spec.image,
            env: spec.env,
            inputs: spec.inputs,
            timeout_secs: spec.timeout_secs,
            retries: spec.retries,
            control: spec.control.into(),
        }
    }
}

impl Plan {
    pub fn new(nodes: Vec<NodeSpec>, edges: Vec<EdgeSpec>) -> Self {
        Self { nodes, edges }
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.id.as_str())
    }

    /// Check the plan's structure. Returns one message per problem found;
    /// an empty vector means the plan is well formed.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut ids: HashSet<&str> = HashSet::new();

        for node in &self.nodes {
            if node.id.is_empty() {
                errors.push("Node with empty id".to_string());
            } else if !ids.insert(node.id.as_str()) {
                errors.push(format!("Duplicate node id '{}'", node.id));
            }
        }

        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !ids.contains(end.as_str()) {
                    errors.push(format!(
                        "Edge {} -> {} references unknown node '{}'",
                        edge.from, edge.to, end
                    ));
                }
            }
        }

        for node in &self.nodes {
            for input in &node.inputs {
                if !ids.contains(input.as_str()) {
                    errors.push(format!(
                        "Node '{}' depends on '{}', which does not exist",
                        node.id, input
                    ));
                }
            }
            if let Some(ref control) = node.control {
                validate_control(&node.id, control, &ids, &mut errors);
            }
        }

        if errors.is_empty()
            && let Some(remaining) = self.find_cycle()
        {
            errors.push(format!(
                "Cycle detected in plan. Remaining nodes: {:?}",
                remaining
            ));
        }

        errors
    }

    /// Kahn's algorithm over edges and node inputs. Returns the nodes left
    /// over when no zero in-degree node remains, or `None` for an acyclic plan.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        let links = self
            .edges
            .iter()
            .map(|e| (e.from.as_str(), e.to.as_str()))
            .chain(
                self.nodes
                    .iter()
                    .flat_map(|n| n.inputs.iter().map(move |i| (i.as_str(), n.id.as_str()))),
            );
        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        for (from, to) in links {
            if !seen.insert((from, to)) {
                continue;
            }
            dependents.entry(from).or_default().push(to);
            *in_degree.entry(to).or_insert(0) += 1;
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;

        while let Some(id) = ready.pop() {
            visited += 1;
            if let Some(next) = dependents.get(id) {
                for &dep in next {
                    if let Some(deg) = in_degree.get_mut(dep) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.push(dep);
                        }
                    }
                }
            }
        }

        if visited == in_degree.len() {
            return None;
        }
        let mut remaining: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        remaining.sort();
        Some(remaining)
    }
}

fn validate_control(
    node_id: &str,
    control: &ControlFlow,
    ids: &HashSet<&str>,
    errors: &mut Vec<String>,
) {
    match control {
        ControlFlow::Conditional(cfg) => {
            if cfg.expression.trim().is_empty() {
                errors.push(format!("Conditional '{}' has an empty expression", node_id));
            }
            if cfg.branches.is_empty() {
                errors.push(format!("Conditional '{}' has no branches", node_id));
            }
            if cfg.kind == ConditionalKind::If {
                for key in cfg.branches.keys() {
                    if key != "true" && key != "false" {
                        errors.push(format!(
                            "Conditional '{}' of type if has branch '{}'; only 'true' and 'false' are allowed",
                            node_id, key
                        ));
                    }
                }
            }
            if let Some(ref default) = cfg.default
                && !cfg.branches.contains_key(default)
            {
                errors.push(format!(
                    "Conditional '{}' default branch '{}' is not defined",
                    node_id, default
                ));
            }
            for (branch, spec) in &cfg.branches {
                for target in &spec.targets {
                    if !ids.contains(target.as_str()) {
                        errors.push(format!(
                            "Conditional '{}' branch '{}' targets unknown node '{}'",
                            node_id, branch, target
                        ));
                    }
                }
            }
        }
        ControlFlow::ForEach(cfg) => {
            if cfg.collection.trim().is_empty() {
                errors.push(format!("ForEach '{}' has an empty collection", node_id));
            }
            if cfg.item_var.trim().is_empty() {
                errors.push(format!("ForEach '{}' has an empty item_var", node_id));
            }
            if cfg.max_parallel < 1 {
                errors.push(format!("ForEach '{}' max_parallel must be at least 1", node_id));
            }
            for body in &cfg.body {
                if body == node_id {
                    errors.push(format!("ForEach '{}' lists itself in its body", node_id));
                } else if !ids.contains(body.as_str()) {
                    errors.push(format!(
                        "ForEach '{}' body references unknown node '{}'",
                        node_id, body
                    ));
                }
            }
        }
        ControlFlow::Subflow(cfg) => {
            if cfg.flow_id.trim().is_empty() {
                errors.push(format!("Subflow '{}' has an empty flow_id", node_id));
            }
        }
    }
}
