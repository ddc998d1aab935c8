//! Graphs shared by sessions that run their nodes eagerly.
//!
//! A graph records, for every session, which nodes that session has run. Mutating such a node
//! afterwards is recorded against the session and its next run fails with FailedPrecondition.
//! A graph is destroyed once deletion was requested and no session is registered.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::eager::attr::{AttrMap, AttrValue};
use crate::eager::context::Context;
use crate::eager::execute::execute;
use crate::eager::op::Op;
use crate::eager::tensor_handle::TensorHandle;
use crate::status::{Status, StatusResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub const PLACEHOLDER: &str = "Placeholder";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub name: String,
    pub op: String,
    /// `node` or `node:index`.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub attrs: AttrMap,
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Debug, Default)]
struct SessionRecord {
    ran: HashSet<String>,
    /// First mutation of a node this session ran.
    mutation: Option<String>,
}

#[derive(Debug, Default)]
struct GraphState {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    sessions: HashMap<u64, SessionRecord>,
    delete_requested: bool,
    destroyed: bool,
}

impl GraphState {
    fn node_mut(&mut self, name: &str) -> StatusResult<&mut GraphNode> {
        let index = *self
            .index
            .get(name)
            .ok_or_else(|| Status::not_found(format!("Node '{name}' not found in graph")))?;
        Ok(&mut self.nodes[index])
    }

    fn record_mutation(&mut self, node: &str, description: &str) {
        for (session, record) in &mut self.sessions {
            if record.ran.contains(node) && record.mutation.is_none() {
                tracing::debug!(session, node, description, "graph node mutated after a session ran it");
                record.mutation = Some(format!(
                    "Operation '{node}' was changed by {description} after it was run by a session. \
                     Nodes cannot be mutated once a session has run them; create a new session to use the updated graph."
                ));
            }
        }
    }

    fn destroy_if_unreferenced(&mut self) {
        if self.delete_requested && self.sessions.is_empty() && !self.destroyed {
            self.destroyed = true;
            self.nodes.clear();
            self.index.clear();
            tracing::debug!("graph destroyed");
        }
    }
}

/// A graph handle. Clones refer to the same graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    state: Arc<Mutex<GraphState>>,
}

fn split_output(tensor: &str) -> StatusResult<(&str, usize)> {
    match tensor.rsplit_once(':') {
        Some((node, index)) => index
            .parse()
            .map(|index| (node, index))
            .map_err(|_| Status::invalid_argument(format!("Malformed tensor name '{tensor}'"))),
        None => Ok((tensor, 0)),
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GraphState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> StatusResult<MutexGuard<'_, GraphState>> {
        let state = self.lock();
        if state.destroyed || state.delete_requested {
            return Err(Status::failed_precondition("Graph has been deleted"));
        }
        Ok(state)
    }

    /// Adds a node whose inputs must already be in the graph.
    pub fn add_node(&self, node: GraphNode) -> StatusResult<()> {
        let mut state = self.live()?;
        if state.index.contains_key(&node.name) {
            return Err(Status::invalid_argument(format!(
                "Node '{}' already exists in the graph",
                node.name
            )));
        }
        for input in &node.inputs {
            let (producer, _) = split_output(input.trim_start_matches('^'))?;
            if !state.index.contains_key(producer) {
                return Err(Status::invalid_argument(format!(
                    "Node '{}': unknown input node '{input}'",
                    node.name
                )));
            }
        }
        let position = state.nodes.len();
        state.index.insert(node.name.clone(), position);
        state.nodes.push(node);
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<GraphNode> {
        let state = self.lock();
        state.index.get(name).map(|&index| state.nodes[index].clone())
    }

    pub fn num_nodes(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn set_attr(&self, node: &str, name: &str, value: AttrValue) -> StatusResult<()> {
        let mut state = self.live()?;
        state.node_mut(node)?.attrs.set(name, value);
        state.record_mutation(node, &format!("setting attribute '{name}'"));
        Ok(())
    }

    pub fn update_input(&self, node: &str, index: usize, input: &str) -> StatusResult<()> {
        let mut state = self.live()?;
        let (producer, _) = split_output(input)?;
        if !state.index.contains_key(producer) {
            return Err(Status::invalid_argument(format!("unknown input node '{input}'")));
        }
        let target = state.node_mut(node)?;
        let slot = target.inputs.get_mut(index).ok_or_else(|| {
            Status::out_of_range(format!("Node '{node}' has no input {index}"))
        })?;
        *slot = input.to_string();
        state.record_mutation(node, "updating input tensor");
        Ok(())
    }

    pub fn set_device(&self, node: &str, device: &str) -> StatusResult<()> {
        let mut state = self.live()?;
        state.node_mut(node)?.device = (!device.is_empty()).then(|| device.to_string());
        state.record_mutation(node, "setting the device");
        Ok(())
    }

    /// Marks the graph for deletion. It is destroyed now if no session uses it, otherwise when
    /// the last session closes.
    pub fn request_delete(&self) {
        let mut state = self.lock();
        state.delete_requested = true;
        state.destroy_if_unreferenced();
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    pub fn num_sessions(&self) -> usize {
        self.lock().sessions.len()
    }
}

/// Runs graph nodes eagerly on a context.
pub struct Session {
    id: u64,
    graph: Graph,
    context: Arc<Context>,
    closed: bool,
}

impl Session {
    pub fn new(graph: &Graph, context: &Arc<Context>) -> StatusResult<Self> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        graph.live()?.sessions.insert(id, SessionRecord::default());
        Ok(Session {
            id,
            graph: graph.clone(),
            context: Arc::clone(context),
            closed: false,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Evaluates `fetches` (`node` or `node:index`), feeding `feeds` by node name.
    pub fn run(&mut self, feeds: &[(&str, TensorHandle)], fetches: &[&str]) -> StatusResult<Vec<TensorHandle>> {
        if self.closed {
            return Err(Status::failed_precondition("Session has been closed."));
        }
        let nodes: HashMap<String, GraphNode> = {
            let state = self.graph.lock();
            if state.destroyed {
                return Err(Status::failed_precondition("Graph has been deleted"));
            }
            if let Some(mutation) = state.sessions.get(&self.id).and_then(|record| record.mutation.clone()) {
                return Err(Status::failed_precondition(mutation));
            }
            state
                .nodes
                .iter()
                .map(|node| (node.name.clone(), node.clone()))
                .collect()
        };

        let mut evaluator = Evaluator {
            context: &self.context,
            nodes: &nodes,
            feeds: feeds.iter().map(|(name, handle)| (*name, handle.clone())).collect(),
            values: HashMap::new(),
            visiting: HashSet::new(),
        };
        let mut results = Vec::with_capacity(fetches.len());
        for fetch in fetches {
            let (node, index) = split_output(fetch)?;
            let outputs = evaluator.evaluate(node)?;
            let output = outputs.get(index).cloned().ok_or_else(|| {
                Status::out_of_range(format!("Node '{node}' has no output {index}"))
            })?;
            results.push(output);
        }

        let ran: Vec<String> = evaluator.values.into_keys().collect();
        if let Some(record) = self.graph.lock().sessions.get_mut(&self.id) {
            record.ran.extend(ran);
        }
        Ok(results)
    }

    /// Deregisters from the graph. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.graph.lock();
        state.sessions.remove(&self.id);
        state.destroy_if_unreferenced();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

struct Evaluator<'a> {
    context: &'a Arc<Context>,
    nodes: &'a HashMap<String, GraphNode>,
    feeds: HashMap<&'a str, TensorHandle>,
    values: HashMap<String, Vec<TensorHandle>>,
    visiting: HashSet<String>,
}

impl Evaluator<'_> {
    fn evaluate(&mut self, name: &str) -> StatusResult<Vec<TensorHandle>> {
        if let Some(values) = self.values.get(name) {
            return Ok(values.clone());
        }
        let nodes = self.nodes;
        let node = nodes
            .get(name)
            .ok_or_else(|| Status::not_found(format!("Node '{name}' not found in graph")))?;
        if let Some(fed) = self.feeds.get(name) {
            let outputs = vec![fed.clone()];
            self.values.insert(name.to_string(), outputs.clone());
            return Ok(outputs);
        }
        if node.op == PLACEHOLDER {
            return Err(Status::invalid_argument(format!(
                "You must feed a value for placeholder tensor '{name}'"
            )));
        }
        if !self.visiting.insert(name.to_string()) {
            return Err(Status::invalid_argument(format!("Graph has a cycle through node '{name}'")));
        }

        let mut op = Op::new(self.context, &node.op)?;
        if let Some(device) = &node.device {
            op.set_device(device)?;
        }
        for (attr, value) in node.attrs.iter() {
            op.set_attr(attr, value.clone());
        }
        for input in &node.inputs {
            if input.starts_with('^') {
                continue;
            }
            let (producer, index) = split_output(input)?;
            let outputs = self.evaluate(producer)?;
            let handle = outputs.get(index).ok_or_else(|| {
                Status::out_of_range(format!("Node '{producer}' has no output {index}"))
            })?;
            op.add_input(handle)?;
        }
        let outputs = execute(&op)?;
        self.visiting.remove(name);
        self.values.insert(name.to_string(), outputs.clone());
        Ok(outputs)
    }
}
