use crate::condition::ConditionOnJobStatus;
use crate::error::ExecutorError;
use crate::node::{ExecutableNode, NodeKind};
use crate::options::ExecutionOptions;
use crate::props::Props;
use crate::sla::SlaOption;
use crate::status::Status;
use chrono::{DateTime, Utc};
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Separator for scope-qualified node ids, e.g. `etl:load`.
pub const NESTED_ID_SEPARATOR: char = ':';

/// A flow admitted for execution: a flat arena of nodes addressed by
/// nested id, plus execution-wide metadata. Embedded flows are nodes
/// whose children live in the same arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutableFlow {
    pub execution_id: i64,
    pub project_id: i32,
    pub version: i32,
    pub flow_id: String,
    pub submit_user: String,
    /// Users the submitter may proxy as.
    pub proxy_users: HashSet<String>,
    pub options: ExecutionOptions,
    pub sla_options: Vec<SlaOption>,
    pub status: Status,
    pub submit_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    pub input_props: Props,
    pub output_props: Props,
    /// Working directory assigned during preparation.
    pub execution_path: Option<PathBuf>,
    nodes: HashMap<String, ExecutableNode>,
    start_nodes: Vec<String>,
    end_nodes: Vec<String>,
}

impl ExecutableFlow {
    pub fn node(&self, nested_id: &str) -> Option<&ExecutableNode> {
        self.nodes.get(nested_id)
    }

    pub fn node_mut(&mut self, nested_id: &str) -> Option<&mut ExecutableNode> {
        self.nodes.get_mut(nested_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ExecutableNode> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Entry nodes of a scope. `None` addresses the top level, `Some`
    /// an embedded flow node.
    pub fn start_nodes_of(&self, scope: Option<&str>) -> Vec<String> {
        match scope {
            None => self.start_nodes.clone(),
            Some(id) => match self.nodes.get(id).map(|n| &n.kind) {
                Some(NodeKind::Flow { start_nodes, .. }) => start_nodes.clone(),
                _ => Vec::new(),
            },
        }
    }

    pub fn end_nodes_of(&self, scope: Option<&str>) -> Vec<String> {
        match scope {
            None => self.end_nodes.clone(),
            Some(id) => match self.nodes.get(id).map(|n| &n.kind) {
                Some(NodeKind::Flow { end_nodes, .. }) => end_nodes.clone(),
                _ => Vec::new(),
            },
        }
    }

    pub fn children_of(&self, scope: Option<&str>) -> Vec<String> {
        match scope {
            None => self
                .nodes
                .values()
                .filter(|n| n.parent.is_none())
                .map(|n| n.nested_id.clone())
                .collect(),
            Some(id) => match self.nodes.get(id).map(|n| &n.kind) {
                Some(NodeKind::Flow { children, .. }) => children.clone(),
                _ => Vec::new(),
            },
        }
    }

    pub fn status_of(&self, scope: Option<&str>) -> Status {
        match scope {
            None => self.status,
            Some(id) => self
                .nodes
                .get(id)
                .map(|n| n.status)
                .unwrap_or(Status::Ready),
        }
    }

    pub fn set_status_of(&mut self, scope: Option<&str>, status: Status, now: DateTime<Utc>) {
        match scope {
            None => {
                self.status = status;
                self.update_time = Some(now);
            }
            Some(id) => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.set_status(status, now);
                }
            }
        }
    }

    pub fn stamp_scope_end(&mut self, scope: Option<&str>, now: DateTime<Utc>) {
        match scope {
            None => {
                self.end_time = Some(now);
                self.update_time = Some(now);
            }
            Some(id) => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.end_time = Some(now);
                    node.update_time = Some(now);
                }
            }
        }
    }

    /// Overlay props onto a scope's output. Used while chaining end-node
    /// outputs during finalization.
    pub fn merge_output_of(&mut self, scope: Option<&str>, props: &Props) {
        match scope {
            None => self.output_props.extend_from(props),
            Some(id) => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.output_props.extend_from(props);
                }
            }
        }
    }

    /// Input props visible to children of a scope.
    pub fn scope_input_props(&self, scope: Option<&str>) -> Props {
        match scope {
            None => self.input_props.clone(),
            Some(id) => self
                .nodes
                .get(id)
                .map(|n| n.input_props.clone())
                .unwrap_or_default(),
        }
    }

    /// Resolve a sibling reference like the `job` part of `${job:prop}`
    /// to a nested id within the same scope as `from`.
    pub fn sibling_nested_id(&self, from: &str, sibling: &str) -> String {
        match from.rsplit_once(NESTED_ID_SEPARATOR) {
            Some((prefix, _)) => format!("{prefix}{NESTED_ID_SEPARATOR}{sibling}"),
            None => sibling.to_string(),
        }
    }
}

/// Declarative description of one node for [`FlowBuilder`].
#[derive(Debug, Clone)]
pub struct NodeSpec {
    id: String,
    kind: SpecKind,
    deps: Vec<String>,
    condition_on: ConditionOnJobStatus,
    condition: Option<String>,
    retries: u32,
    retry_backoff_ms: u64,
    delay_ms: u64,
    disabled: bool,
    props: Props,
}

#[derive(Debug, Clone)]
enum SpecKind {
    Job(String),
    Flow(Vec<NodeSpec>),
}

impl NodeSpec {
    pub fn job(id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: SpecKind::Job(job_type.into()),
            deps: Vec::new(),
            condition_on: ConditionOnJobStatus::AllSuccess,
            condition: None,
            retries: 0,
            retry_backoff_ms: 0,
            delay_ms: 0,
            disabled: false,
            props: Props::new(),
        }
    }

    pub fn subflow(id: impl Into<String>, children: Vec<NodeSpec>) -> Self {
        Self {
            id: id.into(),
            kind: SpecKind::Flow(children),
            deps: Vec::new(),
            condition_on: ConditionOnJobStatus::AllSuccess,
            condition: None,
            retries: 0,
            retry_backoff_ms: 0,
            delay_ms: 0,
            disabled: false,
            props: Props::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn condition_on(mut self, condition: ConditionOnJobStatus) -> Self {
        self.condition_on = condition;
        self
    }

    pub fn condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    pub fn retries(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.retries = retries;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }
}

/// Builds a validated [`ExecutableFlow`]. Rejects cycles, duplicate ids
/// and dependencies on nodes outside the same scope.
pub struct FlowBuilder {
    flow_id: String,
    project_id: i32,
    version: i32,
    specs: Vec<NodeSpec>,
    input_props: Props,
    proxy_users: HashSet<String>,
    sla_options: Vec<SlaOption>,
}

impl FlowBuilder {
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            project_id: 1,
            version: 1,
            specs: Vec::new(),
            input_props: Props::new(),
            proxy_users: HashSet::new(),
            sla_options: Vec::new(),
        }
    }

    pub fn project(mut self, project_id: i32, version: i32) -> Self {
        self.project_id = project_id;
        self.version = version;
        self
    }

    pub fn node(mut self, spec: NodeSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn input_props(mut self, props: Props) -> Self {
        self.input_props = props;
        self
    }

    pub fn proxy_user(mut self, user: impl Into<String>) -> Self {
        self.proxy_users.insert(user.into());
        self
    }

    pub fn sla(mut self, option: SlaOption) -> Self {
        self.sla_options.push(option);
        self
    }

    pub fn build(
        self,
        execution_id: i64,
        submit_user: impl Into<String>,
        options: ExecutionOptions,
    ) -> Result<ExecutableFlow, ExecutorError> {
        if self.specs.is_empty() {
            return Err(ExecutorError::InvalidFlow(format!(
                "flow {} has no nodes",
                self.flow_id
            )));
        }
        let mut nodes = HashMap::new();
        let (start_nodes, end_nodes) = build_scope(None, &self.specs, &mut nodes)?;
        Ok(ExecutableFlow {
            execution_id,
            project_id: self.project_id,
            version: self.version,
            flow_id: self.flow_id,
            submit_user: submit_user.into(),
            proxy_users: self.proxy_users,
            options,
            sla_options: self.sla_options,
            status: Status::Ready,
            submit_time: Some(Utc::now()),
            start_time: None,
            end_time: None,
            update_time: None,
            input_props: self.input_props,
            output_props: Props::new(),
            execution_path: None,
            nodes,
            start_nodes,
            end_nodes,
        })
    }
}

/// Insert one scope's specs into the arena. Returns the scope's start
/// and end node lists (nested ids).
fn build_scope(
    parent: Option<&str>,
    specs: &[NodeSpec],
    arena: &mut HashMap<String, ExecutableNode>,
) -> Result<(Vec<String>, Vec<String>), ExecutorError> {
    let prefix = parent
        .map(|p| format!("{p}{NESTED_ID_SEPARATOR}"))
        .unwrap_or_default();
    let scope_name = parent.unwrap_or("<root>");

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, spec) in specs.iter().enumerate() {
        if spec.id.contains(NESTED_ID_SEPARATOR) {
            return Err(ExecutorError::InvalidFlow(format!(
                "node id '{}' contains reserved separator '{}'",
                spec.id, NESTED_ID_SEPARATOR
            )));
        }
        if index.insert(spec.id.as_str(), i).is_some() {
            return Err(ExecutorError::InvalidFlow(format!(
                "duplicate node id '{}' in {scope_name}",
                spec.id
            )));
        }
    }

    // Cycle detection over this scope's dependency edges.
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut graph_ids = HashMap::new();
    for spec in specs {
        let idx = graph.add_node(spec.id.as_str());
        graph_ids.insert(spec.id.as_str(), idx);
    }
    for spec in specs {
        for dep in &spec.deps {
            let from = *graph_ids.get(dep.as_str()).ok_or_else(|| {
                ExecutorError::InvalidFlow(format!(
                    "node '{}' depends on unknown node '{dep}' in {scope_name}",
                    spec.id
                ))
            })?;
            graph.add_edge(from, graph_ids[spec.id.as_str()], ());
        }
    }
    if petgraph::algo::is_cyclic_directed(&graph) {
        return Err(ExecutorError::InvalidFlow(format!(
            "dependency cycle in {scope_name}"
        )));
    }

    let mut has_dependents: HashSet<&str> = HashSet::new();
    for spec in specs {
        for dep in &spec.deps {
            has_dependents.insert(dep.as_str());
        }
    }

    let mut starts = Vec::new();
    let mut ends = Vec::new();
    for spec in specs {
        let nested_id = format!("{prefix}{}", spec.id);
        if spec.deps.is_empty() {
            starts.push(nested_id.clone());
        }
        if !has_dependents.contains(spec.id.as_str()) {
            ends.push(nested_id.clone());
        }

        let kind = match &spec.kind {
            SpecKind::Job(job_type) => NodeKind::Job {
                job_type: job_type.clone(),
            },
            SpecKind::Flow(children) => {
                if children.is_empty() {
                    return Err(ExecutorError::InvalidFlow(format!(
                        "embedded flow '{nested_id}' has no nodes"
                    )));
                }
                let (child_starts, child_ends) =
                    build_scope(Some(&nested_id), children, arena)?;
                let child_ids = children
                    .iter()
                    .map(|c| format!("{nested_id}{NESTED_ID_SEPARATOR}{}", c.id))
                    .collect();
                NodeKind::Flow {
                    children: child_ids,
                    start_nodes: child_starts,
                    end_nodes: child_ends,
                }
            }
        };

        let in_nodes: Vec<String> = spec.deps.iter().map(|d| format!("{prefix}{d}")).collect();
        arena.insert(
            nested_id.clone(),
            ExecutableNode {
                id: spec.id.clone(),
                nested_id: nested_id.clone(),
                kind,
                parent: parent.map(str::to_string),
                in_nodes,
                out_nodes: Vec::new(),
                condition_on_job_status: spec.condition_on,
                condition: spec.condition.clone(),
                status: if spec.disabled {
                    Status::Disabled
                } else {
                    Status::Ready
                },
                attempt: 0,
                retries: spec.retries,
                retry_backoff_ms: spec.retry_backoff_ms,
                delay_ms: spec.delay_ms,
                start_time: None,
                end_time: None,
                update_time: None,
                override_props: spec.props.clone(),
                input_props: Props::new(),
                output_props: Props::new(),
                failure_message: None,
                killed_by_sla: false,
            },
        );
    }

    // Reverse edges now that every node of the scope exists.
    for spec in specs {
        let nested_id = format!("{prefix}{}", spec.id);
        for dep in &spec.deps {
            let dep_id = format!("{prefix}{dep}");
            if let Some(dep_node) = arena.get_mut(&dep_id) {
                dep_node.out_nodes.push(nested_id.clone());
            }
        }
    }

    Ok((starts, ends))
}
