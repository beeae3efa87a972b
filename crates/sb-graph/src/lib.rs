#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use sb_core::{CastError, DType, DenseArray, Element, ElementKind};
use sb_runtime::{EvidenceKind, RuntimeContext, RuntimeError};
use sb_serialize::{
    LegacySummary, LegacySummaryMetadata, SerializeError, Summary, SummaryMetadata, encode_tensor,
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Shape known while the graph is being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaticShape {
    Unknown,
    Known(Vec<usize>),
}

impl StaticShape {
    #[must_use]
    pub fn scalar() -> Self {
        Self::Known(Vec::new())
    }

    #[must_use]
    pub fn is_known_non_scalar(&self) -> bool {
        matches!(self, Self::Known(shape) if !shape.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum NodeOp {
    Placeholder {
        dtype: DType,
        shape: StaticShape,
    },
    Constant(DenseArray),
    Cast {
        input: NodeId,
        dtype: DType,
    },
    AssertScalar {
        input: NodeId,
    },
    WriteSummary {
        tensor: NodeId,
        metadata: SummaryMetadata,
        step: Option<NodeId>,
    },
    TensorSummary {
        tensor: NodeId,
        metadata: LegacySummaryMetadata,
    },
}

impl NodeOp {
    fn label(&self) -> &'static str {
        match self {
            Self::Placeholder { .. } => "Placeholder",
            Self::Constant(_) => "Const",
            Self::Cast { .. } => "Cast",
            Self::AssertScalar { .. } => "AssertScalar",
            Self::WriteSummary { .. } => "WriteSummary",
            Self::TensorSummary { .. } => "TensorSummary",
        }
    }

    fn inputs(&self) -> Vec<NodeId> {
        match self {
            Self::Placeholder { .. } | Self::Constant(_) => Vec::new(),
            Self::Cast { input, .. } | Self::AssertScalar { input } => vec![*input],
            Self::WriteSummary { tensor, step, .. } => {
                let mut inputs = vec![*tensor];
                inputs.extend(*step);
                inputs
            }
            Self::TensorSummary { tensor, .. } => vec![*tensor],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Node {
    name: String,
    op: NodeOp,
    control_inputs: Vec<NodeId>,
}

/// What a node produces when executed.
#[derive(Debug, Clone, PartialEq)]
pub enum RunValue {
    Tensor(DenseArray),
    /// Result of a deferred write: `true` if a record was emitted.
    Written(bool),
    Summary(LegacySummary),
    Unit,
}

pub type Feeds = BTreeMap<NodeId, DenseArray>;

#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    UnknownNode(NodeId),
    UnknownName(String),
    DuplicateName(String),
    Runtime(RuntimeError),
    MissingFeed { node: String },
    FeedMismatch { node: String, reason: String },
    InvalidShape { node: String, shape: Vec<usize> },
    Cast { node: String, error: CastError },
    InvalidStep { node: String, reason: String },
    NotATensor { node: String },
    NotASummary { node: String },
    Serialize(SerializeError),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode(node) => write!(f, "unknown node id {}", node.0),
            Self::UnknownName(name) => write!(f, "no node named '{name}'"),
            Self::DuplicateName(name) => write!(f, "node name '{name}' is already taken"),
            Self::Runtime(error) => write!(f, "runtime context failure: {error}"),
            Self::MissingFeed { node } => {
                write!(f, "placeholder '{node}' must be fed a value")
            }
            Self::FeedMismatch { node, reason } => {
                write!(f, "value fed to '{node}' does not match: {reason}")
            }
            Self::InvalidShape { node, shape } => write!(
                f,
                "'{node}' expected scalar shape, got shape: {shape:?}"
            ),
            Self::Cast { node, error } => write!(f, "'{node}' cast failed: {error}"),
            Self::InvalidStep { node, reason } => write!(f, "'{node}' step is invalid: {reason}"),
            Self::NotATensor { node } => write!(f, "'{node}' does not produce a tensor"),
            Self::NotASummary { node } => write!(f, "'{node}' does not produce a summary"),
            Self::Serialize(error) => write!(f, "record encoding failed: {error}"),
        }
    }
}

impl std::error::Error for GraphError {}

impl From<RuntimeError> for GraphError {
    fn from(value: RuntimeError) -> Self {
        Self::Runtime(value)
    }
}

impl From<SerializeError> for GraphError {
    fn from(value: SerializeError) -> Self {
        Self::Serialize(value)
    }
}

/// Deferred computation. Building nodes records work and constraints;
/// [`Graph::run`] performs it against a [`RuntimeContext`].
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    names: BTreeMap<String, NodeId>,
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_name(&self, node: NodeId) -> Result<&str, GraphError> {
        Ok(self.node(node)?.name.as_str())
    }

    pub fn node_by_name(&self, name: &str) -> Result<NodeId, GraphError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownName(name.to_string()))
    }

    pub fn control_inputs(&self, node: NodeId) -> Result<&[NodeId], GraphError> {
        Ok(self.node(node)?.control_inputs.as_slice())
    }

    pub fn placeholder(
        &mut self,
        ctx: &mut RuntimeContext,
        name: &str,
        dtype: DType,
        shape: StaticShape,
    ) -> Result<NodeId, GraphError> {
        let name = ctx.unique_name(name)?;
        self.push(ctx, name, NodeOp::Placeholder { dtype, shape })
    }

    pub fn constant(
        &mut self,
        ctx: &mut RuntimeContext,
        name: &str,
        value: DenseArray,
    ) -> Result<NodeId, GraphError> {
        let name = ctx.unique_name(name)?;
        self.push(ctx, name, NodeOp::Constant(value))
    }

    pub fn cast(
        &mut self,
        ctx: &mut RuntimeContext,
        input: NodeId,
        dtype: DType,
    ) -> Result<NodeId, GraphError> {
        let source = self.dtype(input)?;
        let name = ctx.unique_name("Cast")?;
        if dtype.kind() != ElementKind::Float {
            return Err(GraphError::Cast {
                node: name,
                error: CastError::UnsupportedTarget { dtype },
            });
        }
        if !source.kind().is_real() {
            return Err(GraphError::Cast {
                node: name,
                error: CastError::UnsupportedSource { dtype: source },
            });
        }
        self.push(ctx, name, NodeOp::Cast { input, dtype })
    }

    /// Asserts that `input` is rank 0. A statically known non-scalar shape
    /// fails now; otherwise the check runs when the graph executes.
    pub fn assert_scalar(
        &mut self,
        ctx: &mut RuntimeContext,
        input: NodeId,
    ) -> Result<NodeId, GraphError> {
        if let StaticShape::Known(shape) = self.static_shape(input)?
            && !shape.is_empty()
        {
            return Err(GraphError::InvalidShape {
                node: self.node(input)?.name.clone(),
                shape,
            });
        }
        let name = ctx.unique_name("assert_scalar")?;
        self.push(ctx, name, NodeOp::AssertScalar { input })
    }

    /// Adds a summary write whose tag is `tag`. `tag` must already be a
    /// reserved unique name, typically the enclosing scope.
    pub fn write_summary(
        &mut self,
        ctx: &mut RuntimeContext,
        tag: &str,
        tensor: NodeId,
        metadata: SummaryMetadata,
        step: Option<NodeId>,
    ) -> Result<NodeId, GraphError> {
        self.node(tensor)?;
        if let Some(step) = step {
            let dtype = self.dtype(step)?;
            if !matches!(
                dtype.kind(),
                ElementKind::SignedInt | ElementKind::UnsignedInt
            ) {
                return Err(GraphError::InvalidStep {
                    node: tag.to_string(),
                    reason: format!("step must be an integer, got {dtype}"),
                });
            }
        }
        self.push(
            ctx,
            tag.to_string(),
            NodeOp::WriteSummary {
                tensor,
                metadata,
                step,
            },
        )
    }

    /// Adds a legacy tensor summary; its tag is its unique node name.
    pub fn tensor_summary(
        &mut self,
        ctx: &mut RuntimeContext,
        name: &str,
        tensor: NodeId,
        metadata: LegacySummaryMetadata,
    ) -> Result<NodeId, GraphError> {
        self.node(tensor)?;
        let name = ctx.unique_name(name)?;
        self.push(ctx, name, NodeOp::TensorSummary { tensor, metadata })
    }

    /// Makes `node` wait for `dependency` when executed.
    pub fn add_control_input(&mut self, node: NodeId, dependency: NodeId) -> Result<(), GraphError> {
        self.node(dependency)?;
        if dependency >= node {
            return Err(GraphError::UnknownNode(dependency));
        }
        let target = self
            .nodes
            .get_mut(node.0)
            .ok_or(GraphError::UnknownNode(node))?;
        if !target.control_inputs.contains(&dependency) {
            target.control_inputs.push(dependency);
        }
        Ok(())
    }

    pub fn dtype(&self, node: NodeId) -> Result<DType, GraphError> {
        let dtype = match &self.node(node)?.op {
            NodeOp::Placeholder { dtype, .. } | NodeOp::Cast { dtype, .. } => *dtype,
            NodeOp::Constant(value) => value.dtype(),
            NodeOp::AssertScalar { input } => self.dtype(*input)?,
            NodeOp::WriteSummary { .. } => DType::Bool,
            NodeOp::TensorSummary { .. } => DType::Str,
        };
        Ok(dtype)
    }

    pub fn static_shape(&self, node: NodeId) -> Result<StaticShape, GraphError> {
        let shape = match &self.node(node)?.op {
            NodeOp::Placeholder { shape, .. } => shape.clone(),
            NodeOp::Constant(value) => StaticShape::Known(value.shape().to_vec()),
            NodeOp::Cast { input, .. } => self.static_shape(*input)?,
            NodeOp::AssertScalar { .. }
            | NodeOp::WriteSummary { .. }
            | NodeOp::TensorSummary { .. } => StaticShape::scalar(),
        };
        Ok(shape)
    }

    pub fn run(
        &self,
        ctx: &mut RuntimeContext,
        fetch: NodeId,
        feeds: &Feeds,
    ) -> Result<RunValue, GraphError> {
        let mut values = self.run_many(ctx, &[fetch], feeds)?;
        values.pop().ok_or(GraphError::UnknownNode(fetch))
    }

    /// Executes the fetched nodes and everything they depend on, each node at
    /// most once, in construction order.
    pub fn run_many(
        &self,
        ctx: &mut RuntimeContext,
        fetches: &[NodeId],
        feeds: &Feeds,
    ) -> Result<Vec<RunValue>, GraphError> {
        let required = self.required_nodes(fetches)?;
        let mut memo: BTreeMap<NodeId, RunValue> = BTreeMap::new();

        for id in &required {
            let value = self.evaluate(ctx, *id, feeds, &memo)?;
            trace!(node = %self.nodes[id.0].name, "node evaluated");
            memo.insert(*id, value);
        }

        let global_step = ctx.global_step();
        ctx.ledger_mut().record(
            EvidenceKind::Execution,
            format!(
                "run fetches={:?} evaluated={} global_step={global_step:?}",
                fetches.iter().map(|id| id.0).collect::<Vec<_>>(),
                required.len(),
            ),
        );

        fetches
            .iter()
            .map(|id| memo.get(id).cloned().ok_or(GraphError::UnknownNode(*id)))
            .collect()
    }

    /// Runs every node registered under `key` and concatenates the legacy
    /// summaries they produce.
    pub fn run_collection(
        &self,
        ctx: &mut RuntimeContext,
        key: &str,
        feeds: &Feeds,
    ) -> Result<LegacySummary, GraphError> {
        let fetches = ctx
            .collection(key)
            .iter()
            .map(|name| self.node_by_name(name))
            .collect::<Result<Vec<_>, _>>()?;

        let mut merged = LegacySummary::new();
        for (id, value) in fetches.iter().zip(self.run_many(ctx, &fetches, feeds)?) {
            match value {
                RunValue::Summary(summary) => merged.merge(summary),
                _ => {
                    return Err(GraphError::NotASummary {
                        node: self.nodes[id.0].name.clone(),
                    });
                }
            }
        }
        Ok(merged)
    }

    fn node(&self, node: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(node.0).ok_or(GraphError::UnknownNode(node))
    }

    fn push(
        &mut self,
        ctx: &mut RuntimeContext,
        name: String,
        op: NodeOp,
    ) -> Result<NodeId, GraphError> {
        for input in op.inputs() {
            self.node(input)?;
        }
        if self.names.contains_key(&name) {
            return Err(GraphError::DuplicateName(name));
        }

        let id = NodeId(self.nodes.len());
        debug!(node = %name, op = op.label(), id = id.0, "node added");
        ctx.ledger_mut().record(
            EvidenceKind::Construction,
            format!("node={} op={} id={}", name, op.label(), id.0),
        );
        self.names.insert(name.clone(), id);
        self.nodes.push(Node {
            name,
            op,
            control_inputs: Vec::new(),
        });
        Ok(id)
    }

    fn required_nodes(&self, fetches: &[NodeId]) -> Result<BTreeSet<NodeId>, GraphError> {
        let mut required = BTreeSet::new();
        let mut stack: Vec<NodeId> = fetches.to_vec();
        while let Some(id) = stack.pop() {
            let node = self.node(id)?;
            if !required.insert(id) {
                continue;
            }
            stack.extend(node.op.inputs());
            stack.extend(node.control_inputs.iter().copied());
        }
        Ok(required)
    }

    fn evaluate(
        &self,
        ctx: &mut RuntimeContext,
        id: NodeId,
        feeds: &Feeds,
        memo: &BTreeMap<NodeId, RunValue>,
    ) -> Result<RunValue, GraphError> {
        let node = self.node(id)?;
        match &node.op {
            NodeOp::Placeholder { dtype, shape } => {
                let fed = feeds.get(&id).ok_or_else(|| GraphError::MissingFeed {
                    node: node.name.clone(),
                })?;
                check_feed(&node.name, *dtype, shape, fed)?;
                Ok(RunValue::Tensor(fed.clone()))
            }
            NodeOp::Constant(value) => Ok(RunValue::Tensor(value.clone())),
            NodeOp::Cast { input, dtype } => {
                let value = self.tensor_input(memo, *input)?;
                let cast = value.cast(*dtype).map_err(|error| GraphError::Cast {
                    node: node.name.clone(),
                    error,
                })?;
                Ok(RunValue::Tensor(cast))
            }
            NodeOp::AssertScalar { input } => {
                let value = self.tensor_input(memo, *input)?;
                if !value.is_scalar() {
                    return Err(GraphError::InvalidShape {
                        node: node.name.clone(),
                        shape: value.shape().to_vec(),
                    });
                }
                Ok(RunValue::Unit)
            }
            NodeOp::WriteSummary {
                tensor,
                metadata,
                step,
            } => {
                let step = match step {
                    Some(step) => read_step(&node.name, self.tensor_input(memo, *step)?)?,
                    None => ctx.get_or_create_global_step(),
                };
                if !ctx.recording().should_record(step) {
                    debug!(node = %node.name, step, "summary write skipped by recording policy");
                    return Ok(RunValue::Written(false));
                }

                let mut summary = Summary::new();
                summary.add(
                    node.name.clone(),
                    metadata.clone(),
                    encode_tensor(self.tensor_input(memo, *tensor)?)?,
                );
                ctx.emit(step, summary);
                Ok(RunValue::Written(true))
            }
            NodeOp::TensorSummary { tensor, metadata } => {
                let mut summary = LegacySummary::new();
                summary.add(
                    node.name.clone(),
                    metadata.clone(),
                    encode_tensor(self.tensor_input(memo, *tensor)?)?,
                );
                Ok(RunValue::Summary(summary))
            }
        }
    }

    fn tensor_input<'a>(
        &self,
        memo: &'a BTreeMap<NodeId, RunValue>,
        input: NodeId,
    ) -> Result<&'a DenseArray, GraphError> {
        match memo.get(&input) {
            Some(RunValue::Tensor(value)) => Ok(value),
            Some(_) => Err(GraphError::NotATensor {
                node: self.node(input)?.name.clone(),
            }),
            None => Err(GraphError::UnknownNode(input)),
        }
    }
}

fn check_feed(
    node: &str,
    dtype: DType,
    shape: &StaticShape,
    fed: &DenseArray,
) -> Result<(), GraphError> {
    if fed.dtype() != dtype {
        return Err(GraphError::FeedMismatch {
            node: node.to_string(),
            reason: format!("expected dtype {dtype}, got {}", fed.dtype()),
        });
    }
    if let StaticShape::Known(expected) = shape
        && expected.as_slice() != fed.shape()
    {
        return Err(GraphError::FeedMismatch {
            node: node.to_string(),
            reason: format!("expected shape {expected:?}, got {:?}", fed.shape()),
        });
    }
    Ok(())
}

fn read_step(node: &str, value: &DenseArray) -> Result<i64, GraphError> {
    let invalid = |reason: String| GraphError::InvalidStep {
        node: node.to_string(),
        reason,
    };
    match value.scalar_element() {
        Some(Element::Int(step)) => Ok(*step),
        Some(Element::UInt(step)) => {
            i64::try_from(*step).map_err(|_| invalid(format!("{step} does not fit in int64")))
        }
        Some(other) => Err(invalid(format!("expected integer step, got {:?}", other.kind()))),
        None => Err(invalid(format!(
            "expected scalar step, got shape {:?}",
            value.shape()
        ))),
    }
}
