use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::core::errors::Result;

/// Closed set of atomic operations a node can perform against the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Navigate,
    Click,
    #[serde(alias = "type")]
    TypeText,
    #[serde(alias = "wait", alias = "wait-for-condition")]
    WaitFor,
    #[serde(alias = "extract-data")]
    Extract,
    #[serde(alias = "assert-condition")]
    Assert,
    Scroll,
    Hover,
    Select,
    Screenshot,
}

impl OperationKind {
    pub const ALL: [OperationKind; 10] = [
        Self::Navigate,
        Self::Click,
        Self::TypeText,
        Self::WaitFor,
        Self::Extract,
        Self::Assert,
        Self::Scroll,
        Self::Hover,
        Self::Select,
        Self::Screenshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Click => "click",
            Self::TypeText => "type-text",
            Self::WaitFor => "wait-for",
            Self::Extract => "extract",
            Self::Assert => "assert",
            Self::Scroll => "scroll",
            Self::Hover => "hover",
            Self::Select => "select",
            Self::Screenshot => "screenshot",
        }
    }

    /// Kinds that act on an element and therefore need a target descriptor
    pub fn requires_target(&self) -> bool {
        matches!(
            self,
            Self::Click | Self::TypeText | Self::Assert | Self::Hover | Self::Select
        )
    }

    /// Parameters a node of this kind must carry
    pub fn required_params(&self) -> &'static [&'static str] {
        match self {
            Self::Navigate => &["url"],
            Self::TypeText => &["text"],
            Self::Select => &["value"],
            _ => &[],
        }
    }

    /// Kinds that change page state; used by policy rules
    pub fn is_side_effecting(&self) -> bool {
        matches!(
            self,
            Self::Navigate | Self::Click | Self::TypeText | Self::Select
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque locator reference, resolved at execution time by the locator resolver
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetDescriptor(pub String);

impl TargetDescriptor {
    pub fn new(descriptor: impl Into<String>) -> Self {
        Self(descriptor.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetDescriptor {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TargetDescriptor {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Condition under which an edge activates its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeGuard {
    Always,
    #[default]
    OnSuccess,
    OnFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEdge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub guard: EdgeGuard,
}

impl ActionEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, guard: EdgeGuard) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard,
        }
    }
}

/// Post-condition evaluated after a nominally successful operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Assertion {
    /// The operation produced a non-null result
    ResultPresent,
    ResultEquals { value: Value },
    /// String result contains `text`, array result contains it as an element,
    /// or object result has it as a key
    ResultContains { text: String },
    /// JSON pointer into the result equals `value`
    FieldEquals { pointer: String, value: Value },
    /// The target resolves and the surface confirms it
    TargetPresent { target: TargetDescriptor },
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_cost() -> u64 {
    1
}

/// One atomic operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionNode {
    pub id: String,
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetDescriptor>,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    #[serde(
        default = "default_timeout",
        rename = "timeout_ms",
        with = "crate::core::time::duration_ms"
    )]
    pub timeout: Duration,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Budget units consumed per attempt
    #[serde(default = "default_cost")]
    pub cost: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ActionNode {
    pub fn new(id: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            id: id.into(),
            kind,
            target: None,
            params: HashMap::new(),
            timeout: default_timeout(),
            max_retries: 0,
            assertions: Vec::new(),
            depends_on: Vec::new(),
            cost: default_cost(),
            description: None,
        }
    }

    pub fn navigate(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(id, OperationKind::Navigate).param("url", Value::String(url.into()))
    }

    pub fn click(id: impl Into<String>, target: impl Into<TargetDescriptor>) -> Self {
        Self::new(id, OperationKind::Click).target(target)
    }

    pub fn type_text(
        id: impl Into<String>,
        target: impl Into<TargetDescriptor>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(id, OperationKind::TypeText)
            .target(target)
            .param("text", Value::String(text.into()))
    }

    pub fn wait_for(id: impl Into<String>, target: impl Into<TargetDescriptor>) -> Self {
        Self::new(id, OperationKind::WaitFor).target(target)
    }

    pub fn extract(id: impl Into<String>, target: impl Into<TargetDescriptor>) -> Self {
        Self::new(id, OperationKind::Extract).target(target)
    }

    /// Assert node probing `target`, with a matching `TargetPresent` assertion
    pub fn assert_present(id: impl Into<String>, target: impl Into<TargetDescriptor>) -> Self {
        let target = target.into();
        Self::new(id, OperationKind::Assert)
            .target(target.clone())
            .assertion(Assertion::TargetPresent { target })
    }

    pub fn target(mut self, target: impl Into<TargetDescriptor>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn assertion(mut self, assertion: Assertion) -> Self {
        self.assertions.push(assertion);
        self
    }

    pub fn depends_on(mut self, node_id: impl Into<String>) -> Self {
        self.depends_on.push(node_id.into());
        self
    }

    pub fn cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// String parameter lookup
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

fn default_budget() -> u64 {
    1_000
}

fn default_deadline() -> Duration {
    Duration::from_secs(300)
}

/// Immutable description of one attempt at fulfilling a goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionGraph {
    pub id: String,
    pub goal: String,
    /// Declaration order is significant: it breaks ties deterministically
    pub nodes: Vec<ActionNode>,
    #[serde(default)]
    pub edges: Vec<ActionEdge>,
    #[serde(default = "default_budget")]
    pub budget: u64,
    #[serde(
        default = "default_deadline",
        rename = "deadline_ms",
        with = "crate::core::time::duration_ms"
    )]
    pub deadline: Duration,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ActionGraph {
    pub fn new(id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            goal: goal.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            budget: default_budget(),
            deadline: default_deadline(),
            metadata: HashMap::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn node(&self, id: &str) -> Option<&ActionNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ActionEdge> + 'a {
        self.edges.iter().filter(move |e| e.to == node_id)
    }

    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ActionEdge> + 'a {
        self.edges.iter().filter(move |e| e.from == node_id)
    }

    /// Nodes with no incoming edge, in declaration order
    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| self.incoming(&n.id).next().is_none())
            .map(|n| n.id.as_str())
            .collect()
    }

    /// A node's failure is handled when the graph routes it to a failure branch
    pub fn has_failure_branch(&self, node_id: &str) -> bool {
        self.outgoing(node_id)
            .any(|e| e.guard == EdgeGuard::OnFailure)
    }

    /// Sum of per-attempt costs across all nodes
    pub fn total_cost(&self) -> u64 {
        self.nodes.iter().map(|n| n.cost).fold(0, u64::saturating_add)
    }

    pub fn validate(&self) -> Vec<super::GraphViolation> {
        super::validate(self)
    }

    pub fn layers(&self) -> Result<Vec<Vec<String>>> {
        super::topological_layers(self)
    }
}
