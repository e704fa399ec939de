use std::collections::HashMap;

use crate::context::OpContext;
use crate::engine::GraphSession;
use crate::graph::{GraphDef, NodeDef};
use crate::ops::OpRegistry;
use crate::status::EngineStatus;
use crate::tensor::Tensor;

const PLACEHOLDER: &str = "Placeholder";
const IDENTITY: &str = "Identity";
const SCALE: &str = "Scale";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Fresh,
    Active,
    Done,
}

/// One loaded graph. Every `run` evaluates each requested node at most once.
pub struct ReferenceSession {
    ops: &'static OpRegistry,
    device_kernels: bool,
    graph: Option<GraphDef>,
    index: HashMap<String, usize>,
    runs: u64,
}

impl ReferenceSession {
    pub(crate) fn new(ops: &'static OpRegistry, device_kernels: bool) -> Self {
        Self {
            ops,
            device_kernels,
            graph: None,
            index: HashMap::new(),
            runs: 0,
        }
    }

    fn arity(&self, node: &NodeDef) -> Result<usize, EngineStatus> {
        match node.op.as_str() {
            PLACEHOLDER => Ok(0),
            IDENTITY | SCALE => Ok(1),
            op => {
                let kernel = self.ops.get(op).ok_or_else(|| {
                    EngineStatus::not_found(format!("Op type not registered '{op}' in binary"))
                })?;
                if kernel.def().device_only && !self.device_kernels {
                    return Err(EngineStatus::invalid_argument(format!(
                        "No OpKernel was registered to support Op '{op}' used by node {} on device CPU",
                        node.name
                    )));
                }
                Ok(1)
            }
        }
    }

    fn validate(&self, graph: &GraphDef) -> Result<HashMap<String, usize>, EngineStatus> {
        let mut index = HashMap::with_capacity(graph.nodes.len());
        for (i, node) in graph.nodes.iter().enumerate() {
            if node.name.is_empty() {
                return Err(EngineStatus::invalid_argument(format!(
                    "Node {i} ({}) has an empty name",
                    node.op
                )));
            }
            if index.insert(node.name.clone(), i).is_some() {
                return Err(EngineStatus::invalid_argument(format!(
                    "Duplicate node name in graph: '{}'",
                    node.name
                )));
            }
        }

        for node in &graph.nodes {
            let arity = self.arity(node)?;
            if node.inputs.len() != arity {
                return Err(EngineStatus::invalid_argument(format!(
                    "NodeDef {} ({}) expects {arity} inputs, {} specified",
                    node.name,
                    node.op,
                    node.inputs.len()
                )));
            }
            if let Some(missing) = node.inputs.iter().find(|i| !index.contains_key(i.as_str())) {
                return Err(EngineStatus::invalid_argument(format!(
                    "Node '{}': Unknown input node '{missing}'",
                    node.name
                )));
            }
        }

        let mut marks = vec![Mark::Fresh; graph.nodes.len()];
        for i in 0..graph.nodes.len() {
            visit(graph, &index, i, &mut marks)?;
        }
        Ok(index)
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    fn evaluate(
        &self,
        graph: &GraphDef,
        i: usize,
        ctx: &OpContext,
        memo: &mut HashMap<usize, Tensor>,
    ) -> Result<Tensor, EngineStatus> {
        if let Some(done) = memo.get(&i) {
            return Ok(done.clone());
        }
        let node = &graph.nodes[i];
        if node.op == PLACEHOLDER {
            return Err(EngineStatus::invalid_argument(format!(
                "You must feed a value for placeholder tensor '{}' with dtype float",
                node.name
            )));
        }

        let input = match node.inputs.first().and_then(|name| self.lookup(name)) {
            Some(j) => self.evaluate(graph, j, ctx, memo)?,
            None => {
                return Err(EngineStatus::internal(format!(
                    "node {} has no resolvable input",
                    node.name
                )))
            }
        };

        let output = match node.op.as_str() {
            IDENTITY => input,
            SCALE => {
                let scale = node.attrs.get("scale").copied().unwrap_or(1.0);
                let bias = node.attrs.get("bias").copied().unwrap_or(0.0);
                input.map(|v| v * scale + bias)
            }
            op => {
                let kernel = self.ops.get(op).ok_or_else(|| {
                    EngineStatus::not_found(format!("Op type not registered '{op}' in binary"))
                })?;
                kernel.compute(node, &input, ctx)?
            }
        };
        tracing::trace!(node = %node.name, op = %node.op, "node evaluated");
        memo.insert(i, output.clone());
        Ok(output)
    }
}

fn visit(
    graph: &GraphDef,
    index: &HashMap<String, usize>,
    i: usize,
    marks: &mut [Mark],
) -> Result<(), EngineStatus> {
    match marks[i] {
        Mark::Done => return Ok(()),
        Mark::Active => {
            return Err(EngineStatus::invalid_argument(format!(
                "Graph contains a cycle through node '{}'",
                graph.nodes[i].name
            )))
        }
        Mark::Fresh => {}
    }
    marks[i] = Mark::Active;
    for input in &graph.nodes[i].inputs {
        if let Some(&j) = index.get(input.as_str()) {
            visit(graph, index, j, marks)?;
        }
    }
    marks[i] = Mark::Done;
    Ok(())
}

impl std::fmt::Debug for ReferenceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceSession")
            .field("ops", self.ops)
            .field("device_kernels", &self.device_kernels)
            .field("nodes", &self.graph.as_ref().map(|g| g.nodes.len()))
            .field("runs", &self.runs)
            .finish()
    }
}

impl GraphSession for ReferenceSession {
    fn create(&mut self, graph: &GraphDef) -> Result<(), EngineStatus> {
        if self.graph.is_some() {
            return Err(EngineStatus::already_exists("Session already has a graph."));
        }
        self.index = self.validate(graph)?;
        self.graph = Some(graph.clone());
        tracing::debug!(nodes = graph.nodes.len(), "graph created");
        Ok(())
    }

    fn run(
        &mut self,
        feeds: &[(&str, &Tensor)],
        fetches: &[&str],
        ctx: &OpContext,
    ) -> Result<Vec<Tensor>, EngineStatus> {
        let graph = self.graph.as_ref().ok_or_else(|| {
            EngineStatus::failed_precondition("Session was not created with a graph before Run()!")
        })?;

        let mut memo = HashMap::new();
        for (name, tensor) in feeds {
            let i = self.lookup(name).ok_or_else(|| {
                EngineStatus::not_found(format!("FeedInputs: unable to find feed output {name}"))
            })?;
            memo.insert(i, (*tensor).clone());
        }

        let targets = fetches
            .iter()
            .map(|name| {
                self.lookup(name).ok_or_else(|| {
                    EngineStatus::not_found(format!("FetchOutputs node {name}: not found"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let outputs = targets
            .into_iter()
            .map(|i| self.evaluate(graph, i, ctx, &mut memo))
            .collect::<Result<Vec<_>, _>>()?;
        self.runs += 1;
        tracing::trace!(run = self.runs, fetched = outputs.len(), "graph run");
        Ok(outputs)
    }

    fn close(&mut self) -> Result<(), EngineStatus> {
        self.graph = None;
        self.index.clear();
        Ok(())
    }
}
