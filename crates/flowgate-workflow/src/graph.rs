//! Workflow graph model
//!
//! A [`WorkflowDefinition`] is the exchanged record: nodes, edges, variable
//! declarations and triggers. [`WorkflowDefinition::validate`] checks it before
//! it is accepted and [`ExecutionGraph`] is the indexed form the engine walks.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use petgraph::Direction;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::approval::{ApprovalFallback, ApprovalType};
use crate::condition::Condition;

/// Kind of a node. Unknown type strings are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    Start,
    End,
    Task,
    Approval,
    Decision,
    Parallel,
    Merge,
    Delay,
    Other(String),
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Task => "task",
            Self::Approval => "approval",
            Self::Decision => "decision",
            Self::Parallel => "parallel",
            Self::Merge => "merge",
            Self::Delay => "delay",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for NodeType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "start" => Self::Start,
            "end" => Self::End,
            "task" => Self::Task,
            "approval" => Self::Approval,
            "decision" => Self::Decision,
            "parallel" => Self::Parallel,
            "merge" => Self::Merge,
            "delay" => Self::Delay,
            _ => Self::Other(value),
        }
    }
}

impl From<NodeType> for String {
    fn from(value: NodeType) -> Self {
        match value {
            NodeType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Type specific configuration, parsed on demand
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            node_type,
            config: Value::Null,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::End)
    }

    pub fn task(id: impl Into<String>, config: Value) -> Self {
        Self::new(id, NodeType::Task).with_config(config)
    }

    pub fn approval(id: impl Into<String>, config: Value) -> Self {
        Self::new(id, NodeType::Approval).with_config(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Display name, falling back to the id
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Deserialize the node configuration into its typed form.
    /// A missing configuration is read as an empty object.
    pub fn parse_config<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.config {
            Value::Null => serde_json::from_value(Value::Object(Map::new())),
            config => serde_json::from_value(config.clone()),
        }
    }
}

/// Configuration of a `task` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Capability required; derived from the action when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    pub action: String,
    /// String values of the form `${path}` are resolved against the variables
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, alias = "timeoutSeconds", alias = "timeout")]
    pub timeout_secs: Option<f64>,
    #[serde(default, alias = "retryCount", alias = "retries")]
    pub retry_count: u32,
    #[serde(default, alias = "retryDelaySeconds")]
    pub retry_delay_secs: Option<f64>,
    #[serde(default, alias = "preferredAgent")]
    pub preferred_agent: Option<String>,
    /// Extra variable name the output is stored under
    #[serde(default, alias = "outputVariable")]
    pub output_variable: Option<String>,
}

/// Configuration of an `approval` node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalNodeConfig {
    #[serde(default, alias = "approvalType")]
    pub approval_type: ApprovalType,
    /// Action being approved; the node label when absent
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub requester: Option<String>,
    /// Risk context (affected systems, critical system flag, financial impact)
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default, alias = "timeoutSeconds", alias = "timeout")]
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub fallback: ApprovalFallback,
    /// Skip risk based and rule based auto-approval
    #[serde(default, alias = "alwaysRequire")]
    pub always_require: bool,
}

/// Configuration of a `delay` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(alias = "durationSeconds", alias = "duration")]
    pub duration_secs: f64,
}

/// Configuration of a `decision` node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Target taken when no edge condition matches
    #[serde(default, alias = "defaultTarget")]
    pub default_target: Option<String>,
}

/// Directed connection between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
            label: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

fn default_variable_type() -> String {
    "any".to_string()
}

/// Declared workflow input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type", default = "default_variable_type")]
    pub var_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Variable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            var_type: default_variable_type(),
            default: None,
            required: false,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// How a workflow may be started. Carried for callers; the engine does not
/// schedule triggers itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub trigger_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    /// Maximum execution time in seconds
    #[serde(default, alias = "timeoutSeconds", skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: default_version(),
            nodes: Vec::new(),
            edges: Vec::new(),
            variables: Vec::new(),
            triggers: Vec::new(),
            metadata: HashMap::new(),
            timeout_secs: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Connect two nodes with an unconditioned edge
    pub fn connect(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.with_edge(Edge::new(source, target))
    }

    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_timeout(mut self, timeout_secs: f64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    /// Check structure and configuration. Errors make the definition
    /// unusable; warnings and suggestions never do.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.nodes.is_empty() {
            report.errors.push("workflow has no nodes".to_string());
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                report.errors.push("node with an empty id".to_string());
            }
            if !ids.insert(node.id.as_str()) {
                report.errors.push(format!("duplicate node id: {}", node.id));
            }
        }

        if !self.nodes.is_empty() {
            if !self.nodes.iter().any(|node| node.node_type == NodeType::Start) {
                report.errors.push("workflow has no start node".to_string());
            }
            if !self.nodes.iter().any(|node| node.node_type == NodeType::End) {
                report.suggestions.push(
                    "workflow has no end node; it completes when every branch has finished"
                        .to_string(),
                );
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !ids.contains(endpoint.as_str()) {
                    report.errors.push(format!(
                        "edge {} -> {} references missing node {}",
                        edge.source, edge.target, endpoint
                    ));
                }
            }
            if let Some(condition) = &edge.condition {
                if let Err(e) = Condition::parse(condition) {
                    report.errors.push(format!(
                        "edge {} -> {} has an invalid condition: {}",
                        edge.source, edge.target, e
                    ));
                }
            }
        }

        for node in &self.nodes {
            self.check_node_config(node, &mut report);
        }

        let mut names = HashSet::new();
        for variable in &self.variables {
            if !names.insert(variable.name.as_str()) {
                report
                    .errors
                    .push(format!("duplicate variable name: {}", variable.name));
            }
        }

        self.check_structure(&mut report);

        report.valid = report.errors.is_empty();
        report
    }

    fn check_node_config(&self, node: &Node, report: &mut ValidationReport) {
        match &node.node_type {
            NodeType::Task => match node.parse_config::<TaskConfig>() {
                Ok(config) => {
                    if config.action.trim().is_empty() {
                        report
                            .errors
                            .push(format!("task node {} has an empty action", node.id));
                    }
                    match config.timeout_secs {
                        Some(timeout) if timeout <= 0.0 => report.errors.push(format!(
                            "task node {} has a non-positive timeout",
                            node.id
                        )),
                        Some(_) => {}
                        None => report.suggestions.push(format!(
                            "task node {} has no explicit timeout; the engine default applies",
                            node.id
                        )),
                    }
                }
                Err(e) => report
                    .errors
                    .push(format!("task node {} has invalid config: {}", node.id, e)),
            },
            NodeType::Approval => match node.parse_config::<ApprovalNodeConfig>() {
                Ok(config) => {
                    if config.timeout_secs.is_none() {
                        report.suggestions.push(format!(
                            "approval node {} has no explicit timeout; the {} default applies",
                            node.id,
                            config.approval_type.as_str()
                        ));
                    }
                }
                Err(e) => report
                    .errors
                    .push(format!("approval node {} has invalid config: {}", node.id, e)),
            },
            NodeType::Delay => match node.parse_config::<DelayConfig>() {
                Ok(config) if config.duration_secs < 0.0 => report
                    .errors
                    .push(format!("delay node {} has a negative duration", node.id)),
                Ok(_) => {}
                Err(e) => report
                    .errors
                    .push(format!("delay node {} has invalid config: {}", node.id, e)),
            },
            NodeType::Decision => {
                let outgoing: Vec<&Edge> =
                    self.edges.iter().filter(|edge| edge.source == node.id).collect();
                if outgoing.len() < 2 {
                    report.warnings.push(format!(
                        "decision node {} has {} outgoing edge(s); at least two are expected",
                        node.id,
                        outgoing.len()
                    ));
                }

                match node.parse_config::<DecisionConfig>() {
                    Ok(DecisionConfig {
                        default_target: Some(target),
                    }) if !outgoing.iter().any(|edge| edge.target == target) => {
                        report.errors.push(format!(
                            "decision node {} default target {} is not one of its successors",
                            node.id, target
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => report
                        .errors
                        .push(format!("decision node {} has invalid config: {}", node.id, e)),
                }
            }
            NodeType::Other(kind) => report.warnings.push(format!(
                "node {} has unknown type '{}' and will complete as a no-op",
                node.id, kind
            )),
            NodeType::Start | NodeType::End | NodeType::Parallel | NodeType::Merge => {}
        }
    }

    fn check_structure(&self, report: &mut ValidationReport) {
        let index = GraphIndex::build(self);
        let reachable = index.reachable_from_starts(self);

        for node in &self.nodes {
            if node.node_type != NodeType::Start && !reachable.contains(node.id.as_str()) {
                report
                    .warnings
                    .push(format!("node {} is not reachable from any start node", node.id));
            }
        }

        if let Some(cycle) = index.find_cycle() {
            report.warnings.push(format!(
                "possible cycle: {}; loops are bounded by the engine's visit limit",
                cycle.join(" -> ")
            ));
        }
    }
}

/// Validation outcome. `valid` is true iff `errors` is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "valid")
        } else {
            write!(f, "{}", self.errors.join("; "))
        }
    }
}

/// petgraph view over the valid parts of a definition. Edge weights are
/// indexes into `WorkflowDefinition::edges`.
struct GraphIndex {
    graph: DiGraph<String, usize>,
    nodes: HashMap<String, NodeIndex>,
}

impl GraphIndex {
    fn build(definition: &WorkflowDefinition) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();

        for node in &definition.nodes {
            if !nodes.contains_key(&node.id) {
                let index = graph.add_node(node.id.clone());
                nodes.insert(node.id.clone(), index);
            }
        }

        for (position, edge) in definition.edges.iter().enumerate() {
            if let (Some(&source), Some(&target)) =
                (nodes.get(&edge.source), nodes.get(&edge.target))
            {
                graph.add_edge(source, target, position);
            }
        }

        Self { graph, nodes }
    }

    fn start_indexes(&self, definition: &WorkflowDefinition) -> Vec<NodeIndex> {
        definition
            .nodes
            .iter()
            .filter(|node| node.node_type == NodeType::Start)
            .filter_map(|node| self.nodes.get(&node.id).copied())
            .collect()
    }

    fn reachable_from_starts(&self, definition: &WorkflowDefinition) -> HashSet<String> {
        let mut reachable = HashSet::new();
        for start in self.start_indexes(definition) {
            let mut bfs = Bfs::new(&self.graph, start);
            while let Some(index) = bfs.next(&self.graph) {
                reachable.insert(self.graph[index].clone());
            }
        }
        reachable
    }

    /// First cycle found by a depth-first search, as a node id path
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        for node in self.graph.node_indices() {
            if let Some(mut path) = self.find_cycle_util(node, &mut visited, &mut rec_stack) {
                // The path is collected while unwinding, so reverse it and
                // drop the prefix leading into the cycle
                path.reverse();
                let closing = *path.last()?;
                let start = path.iter().position(|n| *n == closing)?;
                return Some(
                    path[start..]
                        .iter()
                        .map(|n| self.graph[*n].clone())
                        .collect(),
                );
            }
        }

        None
    }

    fn find_cycle_util(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        rec_stack: &mut HashSet<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        if rec_stack.contains(&node) {
            return Some(vec![node]);
        }

        if visited.contains(&node) {
            return None;
        }

        visited.insert(node);
        rec_stack.insert(node);

        for neighbor in self.graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(mut cycle) = self.find_cycle_util(neighbor, visited, rec_stack) {
                cycle.push(node);
                return Some(cycle);
            }
        }

        rec_stack.remove(&node);
        None
    }

    /// Edges that close a cycle when walking depth-first from the start nodes
    fn back_edges(&self, starts: &[NodeIndex]) -> HashSet<usize> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut back = HashSet::new();

        for &start in starts {
            self.classify(start, &mut visited, &mut on_stack, &mut back);
        }

        back
    }

    fn classify(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        on_stack: &mut HashSet<NodeIndex>,
        back: &mut HashSet<usize>,
    ) {
        if !visited.insert(node) {
            return;
        }
        on_stack.insert(node);

        for edge in self.graph.edges_directed(node, Direction::Outgoing) {
            if on_stack.contains(&edge.target()) {
                back.insert(*edge.weight());
            } else {
                self.classify(edge.target(), visited, on_stack, back);
            }
        }

        on_stack.remove(&node);
    }
}

/// Indexed, validated graph used by the engine.
///
/// Edges are split into forward edges, which take part in join counting, and
/// back edges, which close a loop and re-fire their target directly.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    definition: Arc<WorkflowDefinition>,
    nodes: HashMap<String, usize>,
    start_nodes: Vec<String>,
    reachable: HashSet<String>,
    back_edges: HashSet<usize>,
    outgoing: HashMap<String, Vec<usize>>,
    forward_inputs: HashMap<String, Vec<usize>>,
    conditions: HashMap<usize, Condition>,
}

impl ExecutionGraph {
    /// Build the graph of a definition, returning the validation report when
    /// the definition has errors.
    pub fn build(definition: Arc<WorkflowDefinition>) -> Result<Self, ValidationReport> {
        let report = definition.validate();
        if !report.valid {
            return Err(report);
        }

        let index = GraphIndex::build(&definition);
        let starts = index.start_indexes(&definition);
        let reachable = index.reachable_from_starts(&definition);
        let back_edges = index.back_edges(&starts);

        let nodes = definition
            .nodes
            .iter()
            .enumerate()
            .map(|(position, node)| (node.id.clone(), position))
            .collect();
        let start_nodes = starts.iter().map(|n| index.graph[*n].clone()).collect();

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut forward_inputs: HashMap<String, Vec<usize>> = HashMap::new();
        let mut conditions = HashMap::new();

        for (position, edge) in definition.edges.iter().enumerate() {
            outgoing
                .entry(edge.source.clone())
                .or_default()
                .push(position);

            if !back_edges.contains(&position) && reachable.contains(&edge.source) {
                forward_inputs
                    .entry(edge.target.clone())
                    .or_default()
                    .push(position);
            }

            if let Some(expression) = &edge.condition {
                // Already checked by validate
                if let Ok(condition) = Condition::parse(expression) {
                    conditions.insert(position, condition);
                }
            }
        }

        Ok(Self {
            definition,
            nodes,
            start_nodes,
            reachable,
            back_edges,
            outgoing,
            forward_inputs,
            conditions,
        })
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes
            .get(node_id)
            .and_then(|position| self.definition.nodes.get(*position))
    }

    pub fn edge(&self, edge: usize) -> Option<&Edge> {
        self.definition.edges.get(edge)
    }

    /// Parsed condition of an edge, if it has one
    pub fn condition(&self, edge: usize) -> Option<&Condition> {
        self.conditions.get(&edge)
    }

    pub fn start_nodes(&self) -> &[String] {
        &self.start_nodes
    }

    pub fn is_reachable(&self, node_id: &str) -> bool {
        self.reachable.contains(node_id)
    }

    pub fn is_back_edge(&self, edge: usize) -> bool {
        self.back_edges.contains(&edge)
    }

    /// Outgoing edges in definition order
    pub fn outgoing(&self, node_id: &str) -> &[usize] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Forward edges from reachable sources a node waits for before firing
    pub fn forward_inputs(&self, node_id: &str) -> &[usize] {
        self.forward_inputs
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Nodes counted by progress: reachable from a start node, start nodes
    /// themselves excluded
    pub fn progress_nodes(&self) -> impl Iterator<Item = &Node> {
        self.definition
            .nodes
            .iter()
            .filter(|node| node.node_type != NodeType::Start && self.is_reachable(&node.id))
    }
}
