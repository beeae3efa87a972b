#![forbid(unsafe_code)]

//! Scalar summaries: a single floating-point value stored as a rank-0
//! float32 tensor, tagged and described for the scalars dashboard.
//!
//! Four entry points produce them. [`scalar_pb`] and [`pb`] encode a value
//! immediately; [`scalar`] and [`op`] add deferred nodes to a [`Graph`] that
//! encode when the graph runs. [`pb`] and [`op`] produce the legacy record
//! shape, tagged `"<name>/scalar_summary"`.

pub mod metadata;

use std::fmt;

use sb_core::{ArrayError, DType, DenseArray, IntoArray};
use sb_graph::{Graph, GraphError, NodeId};
use sb_runtime::{EvidenceKind, RuntimeContext, RuntimeError, SUMMARIES_COLLECTION};
use sb_serialize::{LegacySummary, SerializeError, Summary, encode_tensor};
use tracing::debug;

pub use metadata::{
    PLUGIN_NAME, PROTO_VERSION, ScalarPluginData, create_summary_metadata, parse_plugin_data,
};

/// Last tag component of legacy scalar summaries.
pub const LEGACY_TAG_SUFFIX: &str = "scalar_summary";

#[derive(Debug, Clone, PartialEq)]
pub enum SummaryError {
    InvalidShape { shape: Vec<usize> },
    UnsupportedType { dtype: DType },
    Array(ArrayError),
    Serialize(SerializeError),
    Runtime(RuntimeError),
    Graph(GraphError),
}

impl fmt::Display for SummaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidShape { shape } => {
                write!(f, "expected scalar shape for data, saw shape: {shape:?}")
            }
            Self::UnsupportedType { dtype } => write!(f, "cast {dtype} to float is not supported"),
            Self::Array(error) => write!(f, "value is not array-like: {error}"),
            Self::Serialize(error) => write!(f, "record encoding failed: {error}"),
            Self::Runtime(error) => write!(f, "{error}"),
            Self::Graph(error) => write!(f, "graph construction failed: {error}"),
        }
    }
}

impl std::error::Error for SummaryError {}

impl From<ArrayError> for SummaryError {
    fn from(value: ArrayError) -> Self {
        Self::Array(value)
    }
}

impl From<SerializeError> for SummaryError {
    fn from(value: SerializeError) -> Self {
        Self::Serialize(value)
    }
}

impl From<RuntimeError> for SummaryError {
    fn from(value: RuntimeError) -> Self {
        Self::Runtime(value)
    }
}

impl From<GraphError> for SummaryError {
    fn from(value: GraphError) -> Self {
        match value {
            GraphError::InvalidShape { shape, .. } => Self::InvalidShape { shape },
            GraphError::Runtime(error) => Self::Runtime(error),
            other => Self::Graph(other),
        }
    }
}

/// Options for [`scalar`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarOptions<'a> {
    /// Accepted for call compatibility but not applied: the tag is always
    /// the generated scope name.
    pub tag: Option<NodeId>,
    pub description: Option<&'a str>,
    /// Integer step node. Defaults to the context's global step, read when
    /// the graph runs.
    pub step: Option<NodeId>,
}

/// Options for [`op`].
#[derive(Debug, Clone, Default)]
pub struct OpOptions<'a> {
    /// Defaults to the summary name.
    pub display_name: Option<&'a str>,
    pub description: Option<&'a str>,
    /// Defaults to [`SUMMARIES_COLLECTION`].
    pub collections: Option<Vec<String>>,
}

/// Encodes `value` as a scalar summary record right away.
pub fn scalar_pb(
    tag: &str,
    value: impl IntoArray,
    description: Option<&str>,
) -> Result<Summary, SummaryError> {
    let value = scalar_f32(value)?;
    let tensor = encode_tensor(&value)?;
    let metadata = create_summary_metadata(None, description)?;
    debug!(tag, "scalar summary encoded");

    let mut summary = Summary::new();
    summary.add(tag, metadata, tensor);
    Ok(summary)
}

/// Encodes `data` as a legacy scalar summary record right away.
pub fn pb(
    name: &str,
    data: impl IntoArray,
    display_name: Option<&str>,
    description: Option<&str>,
) -> Result<LegacySummary, SummaryError> {
    let data = scalar_f32(data)?;
    let tensor = encode_tensor(&data)?;

    let display_name = display_name.unwrap_or(name);
    let summary_metadata = create_summary_metadata(Some(display_name), description)?;
    let legacy_metadata = metadata::to_legacy_metadata(&summary_metadata)?;
    let tag = format!("{name}/{LEGACY_TAG_SUFFIX}");
    debug!(%tag, "legacy scalar summary encoded");

    let mut summary = LegacySummary::new();
    summary.add(tag, legacy_metadata, tensor);
    Ok(summary)
}

/// Adds a deferred scalar summary write for `tensor` to `graph`.
///
/// The write is tagged with the unique scope opened for `name`. When run it
/// checks that `tensor` is rank 0, casts it to float32 and emits one record
/// into `ctx` at the explicit step or, failing that, the global step at run
/// time. The node evaluates to whether a record was written.
pub fn scalar(
    graph: &mut Graph,
    ctx: &mut RuntimeContext,
    name: &str,
    tensor: NodeId,
    options: ScalarOptions<'_>,
) -> Result<NodeId, SummaryError> {
    let metadata = create_summary_metadata(None, options.description)?;
    ctx.with_scope(name, |ctx, scope| -> Result<NodeId, SummaryError> {
        if let Some(tag) = options.tag {
            graph.node_name(tag)?;
            debug!(scope, tag = tag.0, "explicit tag ignored");
            ctx.ledger_mut().record(
                EvidenceKind::Construction,
                format!("scalar summary '{scope}' ignores tag node {}", tag.0),
            );
        }
        let cast = checked_cast(graph, ctx, tensor)?;
        Ok(graph.write_summary(ctx, scope, cast, metadata, options.step)?)
    })
}

/// Adds a deferred legacy scalar summary for `data` to `graph` and registers
/// it in `options.collections`.
pub fn op(
    graph: &mut Graph,
    ctx: &mut RuntimeContext,
    name: &str,
    data: NodeId,
    options: OpOptions<'_>,
) -> Result<NodeId, SummaryError> {
    let display_name = options.display_name.unwrap_or(name);
    let summary_metadata = create_summary_metadata(Some(display_name), options.description)?;
    let legacy_metadata = metadata::to_legacy_metadata(&summary_metadata)?;

    let node = ctx.with_scope(name, |ctx, _| -> Result<NodeId, SummaryError> {
        let cast = checked_cast(graph, ctx, data)?;
        Ok(graph.tensor_summary(ctx, LEGACY_TAG_SUFFIX, cast, legacy_metadata)?)
    })?;

    let node_name = graph.node_name(node)?.to_string();
    let collections = options
        .collections
        .unwrap_or_else(|| vec![SUMMARIES_COLLECTION.to_string()]);
    for key in &collections {
        ctx.add_to_collection(key, node_name.clone());
    }
    Ok(node)
}

/// Scalar assertion, then a float32 cast that waits on it.
fn checked_cast(
    graph: &mut Graph,
    ctx: &mut RuntimeContext,
    tensor: NodeId,
) -> Result<NodeId, SummaryError> {
    let check = graph.assert_scalar(ctx, tensor)?;
    let cast = graph.cast(ctx, tensor, DType::F32)?;
    graph.add_control_input(cast, check)?;
    Ok(cast)
}

fn scalar_f32(value: impl IntoArray) -> Result<DenseArray, SummaryError> {
    let array = value.into_array()?;
    if !array.is_scalar() {
        return Err(SummaryError::InvalidShape {
            shape: array.shape().to_vec(),
        });
    }
    if !array.dtype().kind().is_real() {
        return Err(SummaryError::UnsupportedType {
            dtype: array.dtype(),
        });
    }
    array
        .cast(DType::F32)
        .map_err(|_| SummaryError::UnsupportedType {
            dtype: array.dtype(),
        })
}

#[cfg(test)]
mod tests {
    use half::f16;
    use proptest::prelude::*;
    use sb_core::{DType, DenseArray, IntoArray};
    use sb_graph::{Feeds, Graph, GraphError, RunValue, StaticShape};
    use sb_runtime::{EvidenceKind, RuntimeContext, SUMMARIES_COLLECTION};
    use sb_serialize::decode_tensor;

    use super::{
        OpOptions, PLUGIN_NAME, ScalarOptions, SummaryError, op, parse_plugin_data, pb, scalar,
        scalar_pb,
    };

    #[test]
    fn scalar_pb_decodes_to_the_value() {
        let summary = scalar_pb("loss", 3.5f64, None).expect("encodes");
        assert_eq!(summary.value.len(), 1);
        let value = &summary.value[0];
        assert_eq!(value.tag, "loss");
        assert_eq!(value.tensor.dtype, DType::F32);
        assert!(value.tensor.is_scalar());
        assert_eq!(value.tensor.scalar_f32().expect("float32 scalar"), 3.5);
        assert_eq!(
            decode_tensor(&value.tensor).expect("decodes"),
            DenseArray::scalar_f32(3.5)
        );
    }

    #[test]
    fn scalar_pb_description_and_plugin_name() {
        let summary = scalar_pb("acc", 0.9f32, Some("hello")).expect("encodes");
        let metadata = &summary.value[0].metadata;
        assert_eq!(metadata.summary_description, "hello");
        assert_eq!(metadata.plugin_data.plugin_name, PLUGIN_NAME);
        assert!(metadata.display_name.is_empty());
        assert_eq!(
            parse_plugin_data(&metadata.plugin_data.content)
                .expect("content parses")
                .version,
            0
        );
    }

    #[test]
    fn scalar_pb_accepts_every_real_kind() {
        let cases = [
            (true.into_array().expect("bool"), 1.0f32),
            ((-4i8).into_array().expect("i8"), -4.0),
            (9u64.into_array().expect("u64"), 9.0),
            (f16::from_f32(0.5).into_array().expect("f16"), 0.5),
        ];
        for (value, expected) in cases {
            let summary = scalar_pb("v", value, None).expect("real kinds encode");
            assert_eq!(
                summary.value[0].tensor.scalar_f32().expect("scalar"),
                expected
            );
        }
    }

    #[test]
    fn scalar_pb_rejects_vectors() {
        let err = scalar_pb("v", vec![1.0f64, 2.0, 3.0], None).expect_err("vector must fail");
        assert_eq!(err, SummaryError::InvalidShape { shape: vec![3] });
        assert!(err.to_string().contains("[3]"));
    }

    #[test]
    fn scalar_pb_rejects_text() {
        let err = scalar_pb("v", "three", None).expect_err("text must fail");
        assert_eq!(err, SummaryError::UnsupportedType { dtype: DType::Str });
        assert_eq!(err.to_string(), "cast str to float is not supported");
    }

    #[test]
    fn shape_is_checked_before_kind() {
        let err = scalar_pb("v", vec!["a", "b"], None).expect_err("text vector must fail");
        assert!(matches!(err, SummaryError::InvalidShape { .. }));
    }

    #[test]
    fn scalar_pb_is_idempotent() {
        let first = scalar_pb("loss", 0.25f64, Some("d")).expect("encodes");
        let second = scalar_pb("loss", 0.25f64, Some("d")).expect("encodes");
        assert_eq!(first, second);
    }

    #[test]
    fn pb_uses_legacy_tag_and_default_display_name() {
        let summary = pb("loss", 2i32, None, None).expect("encodes");
        let value = &summary.value[0];
        assert_eq!(value.tag, "loss/scalar_summary");
        assert_eq!(value.metadata.display_name, "loss");
        assert_eq!(value.metadata.plugin_data.plugin_name, PLUGIN_NAME);
        assert_eq!(value.tensor.scalar_f32().expect("scalar"), 2.0);
    }

    #[test]
    fn pb_keeps_explicit_display_name_and_description() {
        let summary = pb("train/loss", 1.0f64, Some("Training loss"), Some("*markdown*"))
            .expect("encodes");
        let value = &summary.value[0];
        assert_eq!(value.tag, "train/loss/scalar_summary");
        assert_eq!(value.metadata.display_name, "Training loss");
        assert_eq!(value.metadata.summary_description, "*markdown*");
    }

    #[test]
    fn pb_rejects_same_inputs_as_scalar_pb() {
        assert!(matches!(
            pb("v", [1u8, 2], None, None),
            Err(SummaryError::InvalidShape { .. })
        ));
        assert!(matches!(
            pb("v", String::from("x"), None, None),
            Err(SummaryError::UnsupportedType { dtype: DType::Str })
        ));
    }

    #[test]
    fn scalar_graph_op_emits_at_run_time_step() {
        let mut ctx = RuntimeContext::default();
        let mut graph = Graph::new();
        let x = graph
            .placeholder(&mut ctx, "x", DType::F64, StaticShape::Unknown)
            .expect("placeholder builds");
        let write = scalar(
            &mut graph,
            &mut ctx,
            "loss",
            x,
            ScalarOptions {
                description: Some("hello"),
                ..ScalarOptions::default()
            },
        )
        .expect("summary builds");
        assert_eq!(graph.node_name(write).expect("named"), "loss");

        ctx.set_global_step(10);
        let feeds: Feeds = [(x, 0.75f64.into_array().expect("converts"))]
            .into_iter()
            .collect();
        assert_eq!(
            graph.run(&mut ctx, write, &feeds).expect("runs"),
            RunValue::Written(true)
        );

        let records = ctx.drain_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].step, 10);
        let value = &records[0].summary.value[0];
        assert_eq!(value.tag, "loss");
        assert_eq!(value.metadata.summary_description, "hello");
        assert_eq!(value.tensor.scalar_f32().expect("scalar"), 0.75);
    }

    #[test]
    fn scalar_graph_op_ignores_tag_node() {
        let mut ctx = RuntimeContext::default();
        let mut graph = Graph::new();
        let tag = graph
            .constant(&mut ctx, "tag", "custom".into_array().expect("converts"))
            .expect("builds");
        let x = graph
            .constant(&mut ctx, "x", DenseArray::scalar_f32(1.0))
            .expect("builds");
        let write = scalar(
            &mut graph,
            &mut ctx,
            "metric",
            x,
            ScalarOptions {
                tag: Some(tag),
                ..ScalarOptions::default()
            },
        )
        .expect("summary builds");

        ctx.set_global_step(0);
        graph.run(&mut ctx, write, &Feeds::new()).expect("runs");
        assert_eq!(ctx.records()[0].summary.value[0].tag, "metric");
        assert!(
            ctx.ledger()
                .of_kind(EvidenceKind::Construction)
                .any(|entry| entry.summary.contains("ignores tag"))
        );
    }

    #[test]
    fn scalar_graph_op_nests_under_outer_scope() {
        let mut ctx = RuntimeContext::default();
        let mut graph = Graph::new();
        let x = graph
            .constant(&mut ctx, "x", DenseArray::scalar_f32(1.0))
            .expect("builds");
        let (first, second) = ctx
            .with_scope("train", |ctx, _| {
                let first = scalar(&mut graph, ctx, "loss", x, ScalarOptions::default())?;
                let second = scalar(&mut graph, ctx, "loss", x, ScalarOptions::default())?;
                Ok::<_, SummaryError>((first, second))
            })
            .expect("summaries build");
        assert_eq!(graph.node_name(first).expect("named"), "train/loss");
        assert_eq!(graph.node_name(second).expect("named"), "train/loss_1");
    }

    #[test]
    fn scalar_graph_op_fails_at_run_time_for_vectors() {
        let mut ctx = RuntimeContext::default();
        let mut graph = Graph::new();
        let x = graph
            .placeholder(&mut ctx, "x", DType::F32, StaticShape::Unknown)
            .expect("placeholder builds");
        let write = scalar(&mut graph, &mut ctx, "loss", x, ScalarOptions::default())
            .expect("deferred check builds");

        ctx.set_global_step(1);
        let feeds: Feeds = [(x, vec![1.0f32, 2.0, 3.0].into_array().expect("converts"))]
            .into_iter()
            .collect();
        let err = graph
            .run(&mut ctx, write, &feeds)
            .expect_err("vector fails on execution");
        assert!(matches!(err, GraphError::InvalidShape { shape, .. } if shape == vec![3]));
        assert!(ctx.records().is_empty());
    }

    #[test]
    fn graph_ops_reject_statically_known_vectors() {
        let mut ctx = RuntimeContext::default();
        let mut graph = Graph::new();
        let v = graph
            .constant(&mut ctx, "v", vec![1i32, 2].into_array().expect("converts"))
            .expect("builds");
        let err = scalar(&mut graph, &mut ctx, "s", v, ScalarOptions::default())
            .expect_err("static vector");
        assert_eq!(err, SummaryError::InvalidShape { shape: vec![2] });
        let err = op(&mut graph, &mut ctx, "o", v, OpOptions::default()).expect_err("static vector");
        assert_eq!(err, SummaryError::InvalidShape { shape: vec![2] });
    }

    #[test]
    fn legacy_graph_op_tag_and_collections() {
        let mut ctx = RuntimeContext::default();
        let mut graph = Graph::new();
        let x = graph
            .placeholder(&mut ctx, "x", DType::I32, StaticShape::scalar())
            .expect("placeholder builds");
        let node = op(&mut graph, &mut ctx, "loss", x, OpOptions::default()).expect("op builds");

        assert_eq!(
            graph.node_name(node).expect("named"),
            "loss/scalar_summary"
        );
        assert_eq!(
            ctx.collection(SUMMARIES_COLLECTION),
            &["loss/scalar_summary".to_string()]
        );

        let feeds: Feeds = [(x, 5i32.into_array().expect("converts"))]
            .into_iter()
            .collect();
        let RunValue::Summary(summary) = graph.run(&mut ctx, node, &feeds).expect("runs") else {
            panic!("legacy op must produce a summary");
        };
        let value = &summary.value[0];
        assert_eq!(value.tag, "loss/scalar_summary");
        assert_eq!(value.metadata.display_name, "loss");
        assert_eq!(value.tensor.scalar_f32().expect("scalar"), 5.0);
    }

    #[test]
    fn graph_ops_accept_slash_separated_names() {
        let mut ctx = RuntimeContext::default();
        let mut graph = Graph::new();
        let x = graph
            .constant(&mut ctx, "x", DenseArray::scalar_f32(0.5))
            .expect("builds");

        let legacy = op(&mut graph, &mut ctx, "train/loss", x, OpOptions::default())
            .expect("nested legacy name builds");
        let eager = pb("train/loss", 0.5f32, None, None).expect("eager encodes");
        assert_eq!(graph.node_name(legacy).expect("named"), eager.value[0].tag);

        let RunValue::Summary(summary) =
            graph.run(&mut ctx, legacy, &Feeds::new()).expect("runs")
        else {
            panic!("legacy op must produce a summary");
        };
        assert_eq!(summary, eager);

        let write = scalar(&mut graph, &mut ctx, "eval/acc", x, ScalarOptions::default())
            .expect("nested name builds");
        assert_eq!(graph.node_name(write).expect("named"), "eval/acc");
    }

    #[test]
    fn scalar_pb_rounds_wide_integers_once() {
        let value = (1i64 << 60) + (1i64 << 36) + 1;
        let summary = scalar_pb("v", value, None).expect("encodes");
        assert_eq!(
            summary.value[0].tensor.scalar_f32().expect("scalar"),
            value as f32
        );
    }

    #[test]
    fn legacy_graph_op_custom_collections_and_display_name() {
        let mut ctx = RuntimeContext::default();
        let mut graph = Graph::new();
        let x = graph
            .constant(&mut ctx, "x", DenseArray::scalar_f32(1.0))
            .expect("builds");
        op(
            &mut graph,
            &mut ctx,
            "acc",
            x,
            OpOptions {
                display_name: Some("Accuracy"),
                description: Some("top-1"),
                collections: Some(vec!["eval".to_string(), "all".to_string()]),
            },
        )
        .expect("op builds");

        assert!(ctx.collection(SUMMARIES_COLLECTION).is_empty());
        assert_eq!(ctx.collection("eval"), &["acc/scalar_summary".to_string()]);
        let merged = graph
            .run_collection(&mut ctx, "all", &Feeds::new())
            .expect("collection runs");
        assert_eq!(merged.value[0].metadata.display_name, "Accuracy");
        assert_eq!(merged.value[0].metadata.summary_description, "top-1");
    }

    proptest! {
        #[test]
        fn prop_scalar_pb_matches_f32_cast(value in any::<i32>()) {
            let summary = scalar_pb("v", value, None).expect("encodes");
            prop_assert_eq!(summary.value[0].tensor.scalar_f32().expect("scalar"), value as f32);
        }

        #[test]
        fn prop_pb_matches_f32_cast(value in -1.0e30f64..1.0e30f64) {
            let summary = pb("v", value, None, None).expect("encodes");
            prop_assert_eq!(summary.value[0].tensor.scalar_f32().expect("scalar"), value as f32);
        }

        #[test]
        fn prop_non_scalars_are_rejected(values in prop::collection::vec(any::<f32>(), 1..6)) {
            let len = values.len();
            let err = scalar_pb("v", values, None).expect_err("rank 1 must fail");
            prop_assert_eq!(err, SummaryError::InvalidShape { shape: vec![len] });
        }
    }
}
