#![forbid(unsafe_code)]

use std::fmt;

use sb_core::{DType, ExecutionMode, IntoArray};
use sb_graph::{Feeds, Graph, GraphError, NodeId, RunValue, StaticShape};
use sb_runtime::{
    EvidenceEntry, EvidenceKind, RuntimeConfig, RuntimeContext, SUMMARIES_COLLECTION, StepRecord,
};
use sb_serialize::{
    EnvelopeMode, LegacySummary, SerializeError, Summary, decode_legacy_summary, decode_summary,
    encode_summary,
};
use sb_summary::{OpOptions, ScalarOptions, SummaryError};

pub use sb_summary::{pb as legacy_scalar_pb, scalar_pb};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub runtime: RuntimeConfig,
    /// Mode stamped on envelopes written by [`SummarySession::export_records`].
    pub envelope_mode: EnvelopeMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            envelope_mode: EnvelopeMode::Strict,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    Summary(SummaryError),
    Graph(GraphError),
    Serialize(SerializeError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Summary(error) => write!(f, "summary failure: {error}"),
            Self::Graph(error) => write!(f, "graph failure: {error}"),
            Self::Serialize(error) => write!(f, "record envelope failure: {error}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<SummaryError> for SessionError {
    fn from(value: SummaryError) -> Self {
        Self::Summary(value)
    }
}

impl From<GraphError> for SessionError {
    fn from(value: GraphError) -> Self {
        Self::Graph(value)
    }
}

impl From<SerializeError> for SessionError {
    fn from(value: SerializeError) -> Self {
        Self::Serialize(value)
    }
}

/// A graph and the runtime context it is built and run against.
#[derive(Debug, Clone)]
pub struct SummarySession {
    graph: Graph,
    runtime: RuntimeContext,
    envelope_mode: EnvelopeMode,
}

impl SummarySession {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            graph: Graph::new(),
            runtime: RuntimeContext::with_config(config.runtime),
            envelope_mode: config.envelope_mode,
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    #[must_use]
    pub fn context(&self) -> &RuntimeContext {
        &self.runtime
    }

    pub fn placeholder(
        &mut self,
        name: &str,
        dtype: DType,
        shape: StaticShape,
    ) -> Result<NodeId, SessionError> {
        Ok(self
            .graph
            .placeholder(&mut self.runtime, name, dtype, shape)?)
    }

    pub fn constant(&mut self, name: &str, value: impl IntoArray) -> Result<NodeId, SessionError> {
        let value = value.into_array().map_err(SummaryError::from)?;
        Ok(self.graph.constant(&mut self.runtime, name, value)?)
    }

    /// Deferred scalar summary; see [`sb_summary::scalar`].
    pub fn scalar(
        &mut self,
        name: &str,
        tensor: NodeId,
        options: ScalarOptions<'_>,
    ) -> Result<NodeId, SessionError> {
        Ok(sb_summary::scalar(
            &mut self.graph,
            &mut self.runtime,
            name,
            tensor,
            options,
        )?)
    }

    /// Deferred legacy scalar summary; see [`sb_summary::op`].
    pub fn scalar_legacy(
        &mut self,
        name: &str,
        data: NodeId,
        options: OpOptions<'_>,
    ) -> Result<NodeId, SessionError> {
        Ok(sb_summary::op(
            &mut self.graph,
            &mut self.runtime,
            name,
            data,
            options,
        )?)
    }

    pub fn run(&mut self, fetch: NodeId, feeds: &Feeds) -> Result<RunValue, SessionError> {
        Ok(self.graph.run(&mut self.runtime, fetch, feeds)?)
    }

    /// Runs every node in the default summaries collection and merges the
    /// results.
    pub fn merge_all(&mut self, feeds: &Feeds) -> Result<LegacySummary, SessionError> {
        Ok(self
            .graph
            .run_collection(&mut self.runtime, SUMMARIES_COLLECTION, feeds)?)
    }

    pub fn set_global_step(&mut self, step: i64) {
        self.runtime.set_global_step(step);
    }

    pub fn increment_global_step(&mut self) -> i64 {
        self.runtime.increment_global_step()
    }

    #[must_use]
    pub fn global_step(&self) -> Option<i64> {
        self.runtime.global_step()
    }

    pub fn drain_records(&mut self) -> Vec<StepRecord> {
        self.runtime.drain_records()
    }

    /// Drains emitted records and encodes each as a JSON envelope, paired
    /// with its step. Nothing is drained if any record fails to encode.
    pub fn export_records(&mut self) -> Result<Vec<(i64, String)>, SessionError> {
        let exported = self
            .runtime
            .records()
            .iter()
            .map(|record| {
                encode_summary(&record.summary, self.envelope_mode)
                    .map(|envelope| (record.step, envelope))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.runtime.drain_records();
        self.runtime.ledger_mut().record(
            EvidenceKind::Emission,
            format!(
                "exported records={} envelope_mode={:?}",
                exported.len(),
                self.envelope_mode
            ),
        );
        Ok(exported)
    }

    /// Decodes a summary envelope. Strict sessions use the strict decode
    /// path; hardened sessions use the allow-list path.
    pub fn import_summary(&mut self, envelope: &str) -> Result<Summary, SessionError> {
        let mode = self.runtime.decode_mode();
        let summary = decode_summary(envelope, mode)?;
        self.runtime.ledger_mut().record(
            EvidenceKind::Import,
            format!("imported summary values={} decode_mode={mode:?}", summary.value.len()),
        );
        Ok(summary)
    }

    pub fn import_legacy_summary(&mut self, envelope: &str) -> Result<LegacySummary, SessionError> {
        let mode = self.runtime.decode_mode();
        let summary = decode_legacy_summary(envelope, mode)?;
        self.runtime.ledger_mut().record(
            EvidenceKind::Import,
            format!(
                "imported legacy summary values={} decode_mode={mode:?}",
                summary.value.len()
            ),
        );
        Ok(summary)
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.ledger().len()
    }
}

impl Default for SummarySession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
