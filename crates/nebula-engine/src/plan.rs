//! Execution plan model.
//!
//! A plan is an immutable flow tree whose leaves are steps bound to a
//! capability. Plans are loaded from JSON or TOML and validated before a run
//! starts.
//!
//! # Example TOML
//!
//! ```toml
//! plan_id = "release"
//! name = "Release pipeline"
//! required_capabilities = ["coder", "reviewer"]
//!
//! [root]
//! type = "sequential"
//!
//! [[root.children]]
//! type = "step"
//! id = "write"
//! capability = "coder"
//! params = { task = "{{request.summary}}" }
//! output_key = "code"
//!
//! [[root.children]]
//! type = "step"
//! id = "review"
//! capability = "reviewer"
//! requires_approval = true
//! timeout_secs = 120
//! ```

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::Predicate;
use crate::error::{EngineError, Result};

/// A declarative workflow: a root flow tree plus the capabilities it uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Unique plan identifier.
    pub plan_id: String,

    /// Human-readable name.
    #[serde(default)]
    pub name: String,

    /// Free-form description.
    #[serde(default)]
    pub description: String,

    /// Root of the flow tree.
    pub root: FlowNode,

    /// Capabilities (agent identifiers) the plan's steps reference.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

/// One node of a plan's control structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowNode {
    /// Children run in list order; the first failure stops the sequence.
    Sequential { children: Vec<FlowNode> },

    /// Children run concurrently.
    Parallel {
        children: Vec<FlowNode>,
        /// Resolve after every child (`true`) or after the first (`false`).
        #[serde(default = "default_wait_for_all")]
        wait_for_all: bool,
    },

    /// Exactly one branch runs, chosen by `predicate`.
    Conditional {
        predicate: Predicate,
        then_branch: Box<FlowNode>,
        #[serde(default)]
        else_branch: Option<Box<FlowNode>>,
    },

    /// `body` repeats until `exit_condition` holds or `max_iterations` is hit.
    Loop {
        body: Box<FlowNode>,
        exit_condition: Predicate,
        max_iterations: u32,
        /// Shared state key that receives the zero-based iteration index.
        #[serde(default)]
        iteration_key: Option<String>,
    },

    /// A nested flow, executed transparently.
    SubFlow { flow: Box<FlowNode> },

    /// A leaf unit of work.
    Step(StepSpec),
}

fn default_wait_for_all() -> bool {
    true
}

/// A leaf step bound to a capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step identifier, unique within the plan.
    pub id: String,

    /// Display name. Falls back to the id.
    #[serde(default)]
    pub name: String,

    /// Shown to the approver when `requires_approval` is set.
    #[serde(default)]
    pub description: String,

    /// Capability (agent identifier) that performs the step.
    pub capability: String,

    /// Block on a human decision before invoking.
    #[serde(default)]
    pub requires_approval: bool,

    /// Per-step invocation timeout. The engine default applies when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Parameters passed to the invoker; may contain `{{path}}` templates.
    #[serde(default = "empty_params")]
    pub params: Value,

    /// Store the step's output under this key instead of merging it at the
    /// top level of shared state.
    #[serde(default)]
    pub output_key: Option<String>,
}

fn empty_params() -> Value {
    Value::Object(serde_json::Map::new())
}

impl StepSpec {
    /// Create a step with the given id and capability.
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: String::new(),
            capability: capability.into(),
            requires_approval: false,
            timeout_secs: None,
            params: empty_params(),
            output_key: None,
        }
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The name to show in status and prompts.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// The declared timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl FlowNode {
    /// Wrap a step as a leaf node.
    pub fn step(step: StepSpec) -> Self {
        FlowNode::Step(step)
    }

    pub fn sequential(children: Vec<FlowNode>) -> Self {
        FlowNode::Sequential { children }
    }

    pub fn parallel(children: Vec<FlowNode>, wait_for_all: bool) -> Self {
        FlowNode::Parallel {
            children,
            wait_for_all,
        }
    }

    /// Short name of the node kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowNode::Sequential { .. } => "sequential",
            FlowNode::Parallel { .. } => "parallel",
            FlowNode::Conditional { .. } => "conditional",
            FlowNode::Loop { .. } => "loop",
            FlowNode::SubFlow { .. } => "sub_flow",
            FlowNode::Step(_) => "step",
        }
    }

    /// Visit every leaf step in tree order.
    pub fn for_each_step<'a>(&'a self, f: &mut impl FnMut(&'a StepSpec)) {
        match self {
            FlowNode::Sequential { children } | FlowNode::Parallel { children, .. } => {
                for child in children {
                    child.for_each_step(f);
                }
            }
            FlowNode::Conditional {
                then_branch,
                else_branch,
                ..
            } => {
                then_branch.for_each_step(f);
                if let Some(else_branch) = else_branch {
                    else_branch.for_each_step(f);
                }
            }
            FlowNode::Loop { body, .. } => body.for_each_step(f),
            FlowNode::SubFlow { flow } => flow.for_each_step(f),
            FlowNode::Step(step) => f(step),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl ExecutionPlan {
    /// Create a plan from an id and a root node.
    pub fn new(plan_id: impl Into<String>, root: FlowNode) -> Self {
        Self {
            plan_id: plan_id.into(),
            name: String::new(),
            description: String::new(),
            root,
            required_capabilities: Vec::new(),
        }
    }

    /// Parse a plan from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidPlan(format!("JSON parse error: {}", e)))
    }

    /// Parse a plan from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| EngineError::InvalidPlan(format!("TOML parse error: {}", e)))
    }

    /// Load a plan from a file. `.toml` files are parsed as TOML, anything
    /// else as JSON.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidPlan(format!("Failed to read {}: {}", path.display(), e))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_json(&content),
        }
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Internal(format!("Failed to serialize plan: {}", e)))
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

impl ExecutionPlan {
    /// Number of leaf steps in the tree.
    pub fn step_count(&self) -> usize {
        let mut count = 0;
        self.root.for_each_step(&mut |_| count += 1);
        count
    }

    /// Distinct capabilities referenced by steps, sorted.
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps = BTreeSet::new();
        self.root.for_each_step(&mut |step| {
            caps.insert(step.capability.clone());
        });
        caps.into_iter().collect()
    }

    /// Find a step by id.
    pub fn find_step(&self, step_id: &str) -> Option<&StepSpec> {
        let mut found = None;
        self.root.for_each_step(&mut |step| {
            if found.is_none() && step.id == step_id {
                found = Some(step);
            }
        });
        found
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl ExecutionPlan {
    /// Validate the plan.
    ///
    /// Checks:
    /// - Plan id is not empty
    /// - Every step has an id and a capability
    /// - No duplicate step ids
    /// - Sequential and parallel nodes have children
    /// - Loops allow at least one iteration
    /// - Step capabilities appear in `required_capabilities` when it is set
    pub fn validate(&self) -> Result<()> {
        if self.plan_id.trim().is_empty() {
            return Err(EngineError::InvalidPlan("Plan ID cannot be empty".into()));
        }

        validate_node(&self.root)?;

        let mut seen_ids = HashSet::new();
        let mut steps = Vec::new();
        self.root.for_each_step(&mut |step| steps.push(step));

        for step in &steps {
            if step.id.is_empty() {
                return Err(EngineError::InvalidPlan("Step ID cannot be empty".into()));
            }
            if step.capability.is_empty() {
                return Err(EngineError::InvalidPlan(format!(
                    "Step '{}' has no capability",
                    step.id
                )));
            }
            if !seen_ids.insert(step.id.as_str()) {
                return Err(EngineError::InvalidPlan(format!(
                    "Duplicate step ID: {}",
                    step.id
                )));
            }
        }

        if !self.required_capabilities.is_empty() {
            for step in &steps {
                if !self.required_capabilities.contains(&step.capability) {
                    return Err(EngineError::InvalidPlan(format!(
                        "Step '{}' uses capability '{}' not listed in required_capabilities",
                        step.id, step.capability
                    )));
                }
            }
        }

        Ok(())
    }
}

fn validate_node(node: &FlowNode) -> Result<()> {
    match node {
        FlowNode::Sequential { children } | FlowNode::Parallel { children, .. } => {
            if children.is_empty() {
                return Err(EngineError::InvalidPlan(format!(
                    "{} node must have at least one child",
                    node.kind()
                )));
            }
            children.iter().try_for_each(validate_node)
        }
        FlowNode::Conditional {
            then_branch,
            else_branch,
            ..
        } => {
            validate_node(then_branch)?;
            if let Some(else_branch) = else_branch {
                validate_node(else_branch)?;
            }
            Ok(())
        }
        FlowNode::Loop {
            body,
            max_iterations,
            ..
        } => {
            if *max_iterations == 0 {
                return Err(EngineError::InvalidPlan(
                    "loop max_iterations must be at least 1".into(),
                ));
            }
            validate_node(body)
        }
        FlowNode::SubFlow { flow } => validate_node(flow),
        FlowNode::Step(_) => Ok(()),
    }
}
