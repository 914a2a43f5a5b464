//! Pure in-memory DAG over pipeline steps — all topology reasoning, zero
//! database access.
//!
//! The graph is short-lived and rebuilt per operation: a flat `Vec` of step
//! nodes indexed by [`StepId`], with adjacency lists for children and
//! parents. Conditions are evaluated against the parent step's output
//! artifact; an unparseable regex fails closed, an unrecognized condition
//! shape defaults to true (forward compatibility).

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default ceiling on steps per pipeline.
pub const DEFAULT_MAX_STEPS: usize = 50;

// ── Step domain types ─────────────────────────────────────────────────────────

/// Index of a step within a [`Dag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepId(pub usize);

/// Kind of work a step represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// A unit of dispatched work.
    Task,
    /// A branching point; children hang off its outgoing edge conditions.
    Decision,
    /// A terminal notification step.
    Notify,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Decision => "decision",
            Self::Notify => "notify",
        }
    }
}

impl std::str::FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "decision" => Ok(Self::Decision),
            "notify" => Ok(Self::Notify),
            _ => Err(format!("unknown step type: {s}")),
        }
    }
}

/// Lifecycle status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Complete,
    Failed,
    Skipped,
    Cancelled,
    Paused,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Skipped | Self::Cancelled)
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("unknown step status: {s}")),
        }
    }
}

/// A step as the graph sees it.
#[derive(Debug, Clone)]
pub struct StepNode {
    pub id: String,
    pub name: String,
    pub step_type: StepType,
    pub status: StepStatus,
    /// 1 = AND-join over parents, 0 = OR-join.
    pub depends_on_all: bool,
    pub output: Option<String>,
}

/// An edge between two steps, by step id.
#[derive(Debug, Clone)]
pub struct EdgeDef {
    pub parent: String,
    pub child: String,
    pub condition: Condition,
}

// ── Conditions ────────────────────────────────────────────────────────────────

/// Edge condition, evaluated against the parent step's output artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// No condition — always true.
    Unconditional,
    /// Case-insensitive substring match.
    Contains(String),
    /// Case-insensitive regex test. An invalid pattern fails closed.
    Match(String),
    /// Unrecognized condition shape — defaults to true.
    Unknown,
}

impl Condition {
    /// Parse a stored condition payload. `None`/`null` is unconditional;
    /// unknown keys fall through to [`Condition::Unknown`].
    pub fn parse(payload: Option<&serde_json::Value>) -> Condition {
        let Some(value) = payload else {
            return Condition::Unconditional;
        };
        if value.is_null() {
            return Condition::Unconditional;
        }
        if let Some(s) = value.get("output_contains").and_then(|v| v.as_str()) {
            return Condition::Contains(s.to_string());
        }
        if let Some(s) = value.get("output_match").and_then(|v| v.as_str()) {
            return Condition::Match(s.to_string());
        }
        Condition::Unknown
    }

    /// Evaluate against a parent output.
    pub fn eval(&self, output: Option<&str>) -> bool {
        match self {
            Condition::Unconditional | Condition::Unknown => true,
            Condition::Contains(needle) => {
                let haystack = output.unwrap_or("").to_lowercase();
                haystack.contains(&needle.to_lowercase())
            }
            Condition::Match(pattern) => {
                match RegexBuilder::new(pattern).case_insensitive(true).build() {
                    Ok(re) => re.is_match(output.unwrap_or("")),
                    Err(_) => false, // invalid regex fails closed
                }
            }
        }
    }

    pub fn is_unconditional(&self) -> bool {
        matches!(self, Condition::Unconditional)
    }
}

// ── Graph structure ───────────────────────────────────────────────────────────

/// Built topology over a pipeline's steps.
#[derive(Debug)]
pub struct Dag {
    steps: Vec<StepNode>,
    children: Vec<Vec<StepId>>,
    parents: Vec<Vec<StepId>>,
    conditions: HashMap<(usize, usize), Condition>,
    roots: Vec<StepId>,
    by_name: HashMap<String, StepId>,
    by_id: HashMap<String, StepId>,
    /// Edges referencing step ids that do not exist; surfaced by validation.
    dangling: Vec<(String, String)>,
}

/// Outcome of [`validate`].
#[derive(Debug)]
pub struct Validation {
    pub ok: bool,
    pub errors: Vec<String>,
}

/// A detected cycle, as a path of step names ending where it started.
#[derive(Debug)]
pub struct Cycle {
    pub path: Vec<String>,
}

/// Aggregate pipeline state derived from step statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// At least one step is non-terminal.
    Running,
    /// Every step is terminal and none failed.
    Complete,
    /// Every step is terminal and at least one failed.
    Failed,
}

/// Build the graph structure from step nodes and edges.
pub fn build(steps: Vec<StepNode>, edges: &[EdgeDef]) -> Dag {
    let mut by_name = HashMap::new();
    let mut by_id = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        by_name.insert(step.name.clone(), StepId(i));
        by_id.insert(step.id.clone(), StepId(i));
    }

    let mut children = vec![Vec::new(); steps.len()];
    let mut parents = vec![Vec::new(); steps.len()];
    let mut conditions = HashMap::new();
    let mut dangling = Vec::new();

    for edge in edges {
        match (by_id.get(&edge.parent), by_id.get(&edge.child)) {
            (Some(&p), Some(&c)) => {
                children[p.0].push(c);
                parents[c.0].push(p);
                conditions.insert((p.0, c.0), edge.condition.clone());
            }
            _ => dangling.push((edge.parent.clone(), edge.child.clone())),
        }
    }

    let roots = (0..steps.len())
        .filter(|&i| parents[i].is_empty())
        .map(StepId)
        .collect();

    Dag {
        steps,
        children,
        parents,
        conditions,
        roots,
        by_name,
        by_id,
        dangling,
    }
}

impl Dag {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, id: StepId) -> &StepNode {
        &self.steps[id.0]
    }

    pub fn steps(&self) -> &[StepNode] {
        &self.steps
    }

    pub fn by_name(&self, name: &str) -> Option<StepId> {
        self.by_name.get(name).copied()
    }

    pub fn by_id(&self, id: &str) -> Option<StepId> {
        self.by_id.get(id).copied()
    }

    pub fn parents(&self, id: StepId) -> &[StepId] {
        &self.parents[id.0]
    }

    pub fn children(&self, id: StepId) -> &[StepId] {
        &self.children[id.0]
    }

    pub fn roots(&self) -> &[StepId] {
        &self.roots
    }

    pub fn condition(&self, parent: StepId, child: StepId) -> &Condition {
        self.conditions
            .get(&(parent.0, child.0))
            .unwrap_or(&Condition::Unconditional)
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Validate a built graph against the structural rules.
pub fn validate(dag: &Dag, max_steps: usize) -> Validation {
    let mut errors = Vec::new();

    if dag.is_empty() {
        errors.push("pipeline has no steps".to_string());
        return Validation { ok: false, errors };
    }
    if dag.len() > max_steps {
        errors.push(format!("pipeline has {} steps (max {max_steps})", dag.len()));
    }

    for (parent, child) in &dag.dangling {
        errors.push(format!("edge references unknown step id: {parent} -> {child}"));
    }

    if dag.roots().is_empty() {
        errors.push("pipeline has no root step (every step has a parent)".to_string());
    }

    if let Some(cycle) = find_cycle(dag) {
        errors.push(format!("pipeline contains a cycle: {}", cycle.path.join(" -> ")));
    } else {
        // Reachability only makes sense on an acyclic graph
        let mut seen = vec![false; dag.len()];
        let mut stack: Vec<StepId> = dag.roots().to_vec();
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id.0], true) {
                continue;
            }
            stack.extend(dag.children(id));
        }
        for (i, reached) in seen.iter().enumerate() {
            if !reached {
                errors.push(format!(
                    "step '{}' is unreachable from any root",
                    dag.step(StepId(i)).name
                ));
            }
        }
    }

    if !(0..dag.len()).any(|i| dag.children(StepId(i)).is_empty()) {
        errors.push("pipeline has no leaf step".to_string());
    }

    // Every decision step that branches needs an unconditional default path
    for i in 0..dag.len() {
        let step = dag.step(StepId(i));
        if step.step_type == StepType::Decision && !dag.children(StepId(i)).is_empty() {
            let has_default = dag
                .children(StepId(i))
                .iter()
                .any(|&c| dag.condition(StepId(i), c).is_unconditional());
            if !has_default {
                errors.push(format!(
                    "decision step '{}' has no unconditional default edge",
                    step.name
                ));
            }
        }
    }

    Validation {
        ok: errors.is_empty(),
        errors,
    }
}

// ── Cycle detection ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// DFS with three-coloring. Returns the first back-edge's cycle path.
pub fn find_cycle(dag: &Dag) -> Option<Cycle> {
    let mut color = vec![Color::White; dag.len()];
    let mut trail: Vec<StepId> = Vec::new();

    fn visit(dag: &Dag, at: StepId, color: &mut [Color], trail: &mut Vec<StepId>) -> Option<Vec<StepId>> {
        color[at.0] = Color::Gray;
        trail.push(at);

        for &child in dag.children(at) {
            match color[child.0] {
                Color::Gray => {
                    // Back edge: slice the trail from the cycle entry
                    let start = trail.iter().position(|&s| s == child).unwrap_or(0);
                    let mut path = trail[start..].to_vec();
                    path.push(child);
                    return Some(path);
                }
                Color::White => {
                    if let Some(found) = visit(dag, child, color, trail) {
                        return Some(found);
                    }
                }
                Color::Black => {}
            }
        }

        trail.pop();
        color[at.0] = Color::Black;
        None
    }

    for i in 0..dag.len() {
        if color[i] == Color::White {
            if let Some(path) = visit(dag, StepId(i), &mut color, &mut trail) {
                return Some(Cycle {
                    path: path.iter().map(|&s| dag.step(s).name.clone()).collect(),
                });
            }
        }
    }
    None
}

/// Kahn's algorithm. Returns `None` when the graph has a cycle.
pub fn topo_sort(dag: &Dag) -> Option<Vec<StepId>> {
    let mut in_degree: Vec<usize> = (0..dag.len()).map(|i| dag.parents(StepId(i)).len()).collect();
    let mut queue: Vec<StepId> = (0..dag.len())
        .filter(|&i| in_degree[i] == 0)
        .map(StepId)
        .collect();
    let mut order = Vec::with_capacity(dag.len());

    while let Some(id) = queue.pop() {
        order.push(id);
        for &child in dag.children(id) {
            in_degree[child.0] -= 1;
            if in_degree[child.0] == 0 {
                queue.push(child);
            }
        }
    }

    if order.len() == dag.len() {
        Some(order)
    } else {
        None
    }
}

// ── Ready / skip / completion ─────────────────────────────────────────────────

/// Whether the edge from `parent` into `child` is satisfied: the parent is
/// complete and its condition holds against the parent's output.
fn edge_satisfied(dag: &Dag, parent: StepId, child: StepId) -> bool {
    let p = dag.step(parent);
    p.status == StepStatus::Complete
        && dag.condition(parent, child).eval(p.output.as_deref())
}

/// Steps currently eligible for dispatch.
pub fn ready_set(dag: &Dag) -> Vec<StepId> {
    (0..dag.len())
        .map(StepId)
        .filter(|&id| {
            let step = dag.step(id);
            if step.status != StepStatus::Pending {
                return false;
            }
            let parents = dag.parents(id);
            if parents.is_empty() {
                return true;
            }
            if step.depends_on_all {
                parents.iter().all(|&p| edge_satisfied(dag, p, id))
            } else {
                parents.iter().any(|&p| edge_satisfied(dag, p, id))
            }
        })
        .collect()
}

/// Pending steps that can never become ready and should be short-circuited
/// as skipped.
pub fn skip_set(dag: &Dag) -> Vec<StepId> {
    (0..dag.len())
        .map(StepId)
        .filter(|&id| {
            let step = dag.step(id);
            if step.status != StepStatus::Pending {
                return false;
            }
            let parents = dag.parents(id);
            if parents.is_empty() {
                return false; // roots are dispatched, never skipped
            }
            if !parents.iter().all(|&p| dag.step(p).status.is_terminal()) {
                return false;
            }
            if step.depends_on_all {
                parents.iter().any(|&p| !edge_satisfied(dag, p, id))
            } else {
                !parents.iter().any(|&p| edge_satisfied(dag, p, id))
            }
        })
        .collect()
}

/// Derive the pipeline-level state from step statuses.
pub fn completion(dag: &Dag) -> Completion {
    if dag.steps().iter().any(|s| !s.status.is_terminal()) {
        return Completion::Running;
    }
    if dag.steps().iter().any(|s| s.status == StepStatus::Failed) {
        Completion::Failed
    } else {
        Completion::Complete
    }
}
